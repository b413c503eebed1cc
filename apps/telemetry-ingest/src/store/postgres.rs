use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{
    decode_measurements, encode_measurements, ReadingQuery, ReadingStats, ReadingStore,
    StoreError, MAX_QUERY_LIMIT,
};
use crate::readings::{NormalizedReading, Reading};

#[derive(Clone)]
pub struct PgReadingStore {
    db: PgPool,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: i64,
    gateway_id: String,
    node_id: String,
    ts: DateTime<Utc>,
    humidity: Option<f64>,
    moisture: Option<f64>,
    temperature: Option<f64>,
    battery_voltage: Option<f64>,
    measurements: Option<SqlJson<serde_json::Value>>,
    created_at: DateTime<Utc>,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Self {
            id: row.id,
            gateway_id: row.gateway_id,
            node_id: row.node_id,
            timestamp: row.ts,
            humidity: row.humidity,
            moisture: row.moisture,
            temperature: row.temperature,
            battery_voltage: row.battery_voltage,
            measurements: row.measurements.and_then(|json| decode_measurements(json.0)),
            created_at: row.created_at,
        }
    }
}

impl PgReadingStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Newest first, ties broken by id. `limit` is clamped to 1..=1000.
    pub async fn query(&self, query: &ReadingQuery) -> Result<Vec<Reading>, sqlx::Error> {
        let limit = query.limit.clamp(1, MAX_QUERY_LIMIT);
        let offset = query.offset.max(0);

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            SELECT id, gateway_id, node_id, ts, humidity, moisture, temperature,
                   battery_voltage, measurements, created_at
            FROM sensor_readings
            WHERE TRUE
            "#,
        );
        if let Some(gateway_id) = &query.gateway_id {
            qb.push(" AND gateway_id = ").push_bind(gateway_id.clone());
        }
        if let Some(node_id) = &query.node_id {
            qb.push(" AND node_id = ").push_bind(node_id.clone());
        }
        if let Some(since) = query.since {
            qb.push(" AND ts >= ").push_bind(since);
        }
        qb.push(" ORDER BY ts DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows: Vec<ReadingRow> = qb.build_query_as().fetch_all(&self.db).await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    pub async fn stats(&self) -> Result<ReadingStats, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT
                COUNT(*)::BIGINT AS total_readings,
                COUNT(DISTINCT gateway_id)::BIGINT AS total_gateways,
                COUNT(DISTINCT node_id)::BIGINT AS total_nodes,
                MAX(ts) AS latest_reading_time
            FROM sensor_readings
            "#,
        )
        .fetch_one(&self.db)
        .await
    }

    pub async fn gateways(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT DISTINCT gateway_id FROM sensor_readings ORDER BY gateway_id ASC")
            .fetch_all(&self.db)
            .await
    }

    pub async fn nodes(&self, gateway_id: Option<&str>) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT node_id
            FROM sensor_readings
            WHERE ($1::TEXT IS NULL OR gateway_id = $1)
            ORDER BY node_id ASC
            "#,
        )
        .bind(gateway_id)
        .fetch_all(&self.db)
        .await
    }

    /// Deletes readings whose timestamp is older than `cutoff` and returns how many went.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sensor_readings WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn insert(&self, job_id: Uuid, reading: &NormalizedReading) -> Result<i64, StoreError> {
        let measurements = reading
            .measurements
            .as_ref()
            .map(encode_measurements)
            .transpose()?
            .map(SqlJson);

        // The second branch only sees rows committed before this statement, so it returns
        // the id of an earlier delivery and nothing when the insert itself succeeded.
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            WITH inserted AS (
                INSERT INTO sensor_readings (
                    ingest_job_id, submitted_by, gateway_id, node_id, ts,
                    humidity, moisture, temperature, battery_voltage, measurements
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (ingest_job_id) DO NOTHING
                RETURNING id
            )
            SELECT id FROM inserted
            UNION ALL
            SELECT id FROM sensor_readings WHERE ingest_job_id = $1
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(reading.submitted_by)
        .bind(&reading.gateway_id)
        .bind(&reading.node_id)
        .bind(reading.timestamp)
        .bind(reading.humidity)
        .bind(reading.moisture)
        .bind(reading.temperature)
        .bind(reading.battery_voltage)
        .bind(measurements)
        .fetch_optional(&self.db)
        .await?;

        if let Some(id) = id {
            return Ok(id);
        }

        // A concurrent delivery of the same job committed while this statement waited on
        // the unique index.
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM sensor_readings WHERE ingest_job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.db)
                .await?;
        existing.ok_or_else(|| {
            StoreError::Transient(format!("insert for job {job_id} returned no row"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::{MeasurementValue, Measurements};
    use crate::store::schema::ensure_schema;
    use crate::test_support::{drop_test_schema, sample_reading, setup_test_pool};
    use chrono::Duration;

    #[tokio::test]
    async fn redelivered_job_does_not_duplicate_the_row() -> anyhow::Result<()> {
        let Some((pool, schema)) = setup_test_pool("store_dedupe").await? else {
            return Ok(());
        };
        ensure_schema(&pool).await?;
        let store = PgReadingStore::new(pool.clone());

        let job_id = Uuid::new_v4();
        let reading = sample_reading("GW-1", "NODE-1");
        let first = store.insert(job_id, &reading).await?;
        let second = store.insert(job_id, &reading).await?;
        assert_eq!(first, second);

        // Identical content under a different job is a distinct reading.
        let third = store.insert(Uuid::new_v4(), &reading).await?;
        assert_ne!(first, third);
        assert_eq!(store.stats().await?.total_readings, 2);

        drop_test_schema(&schema).await;
        Ok(())
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_filters() -> anyhow::Result<()> {
        let Some((pool, schema)) = setup_test_pool("store_query").await? else {
            return Ok(());
        };
        ensure_schema(&pool).await?;
        let store = PgReadingStore::new(pool.clone());

        let base = Utc::now() - Duration::hours(5);
        for (offset_hours, gateway, node) in [
            (0, "GW-1", "NODE-A"),
            (1, "GW-1", "NODE-B"),
            (2, "GW-2", "NODE-C"),
            (4, "GW-1", "NODE-A"),
        ] {
            let mut reading = sample_reading(gateway, node);
            reading.timestamp = base + Duration::hours(offset_hours);
            store.insert(Uuid::new_v4(), &reading).await?;
        }
        // Same timestamp as the newest row; inserted later so it has the higher id.
        let mut tie = sample_reading("GW-2", "NODE-D");
        tie.timestamp = base + Duration::hours(4);
        let mut measurements = Measurements::new();
        measurements.insert("ph".to_string(), MeasurementValue::Number(6.5));
        measurements.insert("soil".to_string(), MeasurementValue::Text("loam".to_string()));
        tie.measurements = Some(measurements.clone());
        let tie_id = store.insert(Uuid::new_v4(), &tie).await?;

        let all = store.query(&ReadingQuery::default()).await?;
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].id, tie_id);
        assert_eq!(all[0].measurements.as_ref(), Some(&measurements));
        assert!(all
            .windows(2)
            .all(|pair| (pair[0].timestamp, pair[0].id) > (pair[1].timestamp, pair[1].id)));

        let gw1 = store
            .query(&ReadingQuery {
                gateway_id: Some("GW-1".to_string()),
                ..ReadingQuery::default()
            })
            .await?;
        assert_eq!(gw1.len(), 3);
        assert!(gw1.iter().all(|r| r.gateway_id == "GW-1"));

        let recent = store
            .query(&ReadingQuery {
                since: Some(base + Duration::minutes(150)),
                ..ReadingQuery::default()
            })
            .await?;
        assert_eq!(recent.len(), 2);

        let page = store
            .query(&ReadingQuery {
                limit: 2,
                offset: 1,
                ..ReadingQuery::default()
            })
            .await?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, all[1].id);

        assert_eq!(store.gateways().await?, vec!["GW-1", "GW-2"]);
        assert_eq!(store.nodes(Some("GW-2")).await?, vec!["NODE-C", "NODE-D"]);
        assert_eq!(store.nodes(None).await?.len(), 4);

        let stats = store.stats().await?;
        assert_eq!(stats.total_readings, 5);
        assert_eq!(stats.total_gateways, 2);
        assert_eq!(stats.total_nodes, 4);

        let purged = store.purge_older_than(base + Duration::minutes(90)).await?;
        assert_eq!(purged, 2);

        drop_test_schema(&schema).await;
        Ok(())
    }
}
