use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueStatus};
use crate::readings::{DeadLetter, NormalizedReading, QueuedJob};

/// Queue backed by two tables in the readings database. Leasing uses
/// `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the same row.
#[derive(Clone)]
pub struct PgJobQueue {
    db: PgPool,
    lease: Duration,
    poll_interval: Duration,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    job_id: Uuid,
    payload: SqlJson<NormalizedReading>,
    attempts: i32,
    enqueued_at: DateTime<Utc>,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl From<QueueRow> for QueuedJob {
    fn from(row: QueueRow) -> Self {
        Self {
            job_id: row.job_id,
            reading: row.payload.0,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            enqueued_at: row.enqueued_at,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    job_id: Uuid,
    payload: SqlJson<NormalizedReading>,
    reason: String,
    attempts: i32,
    first_seen_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for DeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            job_id: row.job_id,
            reading: row.payload.0,
            reason: row.reason,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            first_seen_at: row.first_seen_at,
            dead_lettered_at: row.dead_lettered_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    pending: i64,
    leased: i64,
    oldest_pending_at: Option<DateTime<Utc>>,
}

const LEASE_EXPIRED: &str = "lease expired before the job was settled";

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

impl PgJobQueue {
    pub fn new(db: PgPool, lease: Duration, poll_interval: Duration) -> Self {
        Self {
            db,
            lease,
            poll_interval,
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_queue (
                job_id UUID PRIMARY KEY,
                payload JSONB NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at TIMESTAMPTZ NOT NULL,
                next_attempt_at TIMESTAMPTZ NOT NULL,
                leased_until TIMESTAMPTZ NULL,
                last_error TEXT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ingest_queue_ready_idx ON ingest_queue (next_attempt_at, enqueued_at)",
        )
        .execute(&self.db)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_dead_letters (
                job_id UUID PRIMARY KEY,
                payload JSONB NOT NULL,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                first_seen_at TIMESTAMPTZ NOT NULL,
                dead_lettered_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Every claim spends an attempt. A row that still carries a lease was abandoned by
    /// a worker that never settled it.
    async fn claim_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut tx = self.db.begin().await?;
        let claimed: Option<QueueRow> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT job_id
                FROM ingest_queue
                WHERE next_attempt_at <= now()
                  AND (leased_until IS NULL OR leased_until < now())
                ORDER BY enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_queue
            SET leased_until = now() + make_interval(secs => $1),
                attempts = attempts + 1,
                last_error = CASE WHEN leased_until IS NULL THEN last_error ELSE $2 END
            WHERE job_id IN (SELECT job_id FROM next)
            RETURNING job_id, payload, attempts, enqueued_at, next_attempt_at, last_error
            "#,
        )
        .bind(self.lease.as_secs_f64())
        .bind(LEASE_EXPIRED)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(claimed.map(QueuedJob::from))
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<Uuid, QueueError> {
        sqlx::query(
            r#"
            INSERT INTO ingest_queue (job_id, payload, attempts, enqueued_at, next_attempt_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.job_id)
        .bind(SqlJson(&job.reading))
        .bind(attempts_param(job.attempts))
        .bind(job.enqueued_at)
        .bind(job.next_attempt_at)
        .bind(job.last_error.as_deref())
        .execute(&self.db)
        .await?;
        Ok(job.job_id)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(job) = self.claim_next().await? {
                return Ok(Some(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM ingest_queue WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        job_id: Uuid,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let updated = sqlx::query(
            r#"
            UPDATE ingest_queue
            SET attempts = $2,
                next_attempt_at = now() + make_interval(secs => $3),
                leased_until = NULL,
                last_error = $4
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(attempts_param(attempts))
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.db)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(QueueError::UnknownJob(job_id));
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        job: &QueuedJob,
        attempts: u32,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO ingest_dead_letters (job_id, payload, reason, attempts, first_seen_at, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (job_id) DO UPDATE
            SET reason = EXCLUDED.reason,
                attempts = EXCLUDED.attempts,
                dead_lettered_at = EXCLUDED.dead_lettered_at
            "#,
        )
        .bind(job.job_id)
        .bind(SqlJson(&job.reading))
        .bind(reason)
        .bind(attempts_param(attempts))
        .bind(job.enqueued_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM ingest_queue WHERE job_id = $1")
            .bind(job.job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT job_id, payload, reason, attempts, first_seen_at, dead_lettered_at
            FROM ingest_dead_letters
            ORDER BY dead_lettered_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(DeadLetter::from).collect())
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        let row: StatusRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE leased_until IS NULL OR leased_until < now()) AS pending,
                COUNT(*) FILTER (WHERE leased_until >= now()) AS leased,
                MIN(enqueued_at) AS oldest_pending_at
            FROM ingest_queue
            "#,
        )
        .fetch_one(&self.db)
        .await?;
        let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_dead_letters")
            .fetch_one(&self.db)
            .await?;
        Ok(QueueStatus {
            backend: "postgres",
            pending: u64::try_from(row.pending).unwrap_or(0),
            leased: u64::try_from(row.leased).unwrap_or(0),
            dead_letters: u64::try_from(dead_letters).unwrap_or(0),
            oldest_pending_at: row.oldest_pending_at,
        })
    }
}
