use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};

use crate::auth::GatewayAuth;
use crate::error::{map_db_error, AppError, AppResult};
use crate::ingest::SubmitError;
use crate::readings::{Measurements, Reading};
use crate::state::AppState;
use crate::store::{ReadingQuery, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const ENQUEUE_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct SubmitResponse {
    pub status: String,
    pub message: String,
    /// Correlation handle; the reading is not queryable until a worker persists it.
    pub job_id: String,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct ReadingResponse {
    pub id: i64,
    pub gateway_id: String,
    pub node_id: String,
    pub timestamp: String,
    pub humidity: Option<f64>,
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub battery_voltage: Option<f64>,
    #[schema(value_type = Option<Object>)]
    pub measurements: Option<Measurements>,
    pub created_at: String,
}

impl From<Reading> for ReadingResponse {
    fn from(reading: Reading) -> Self {
        Self {
            id: reading.id,
            gateway_id: reading.gateway_id,
            node_id: reading.node_id,
            timestamp: reading.timestamp.to_rfc3339(),
            humidity: reading.humidity,
            moisture: reading.moisture,
            temperature: reading.temperature,
            battery_voltage: reading.battery_voltage,
            measurements: reading.measurements,
            created_at: reading.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct ReadingsQuery {
    /// Filter by gateway id.
    gateway_id: Option<String>,
    /// Filter by node id.
    node_id: Option<String>,
    #[param(minimum = 1, maximum = 1000)]
    limit: Option<i64>,
    /// Rows to skip (`skip` is accepted as an alias).
    #[param(minimum = 0)]
    offset: Option<i64>,
    #[param(minimum = 0)]
    skip: Option<i64>,
    /// Only readings from the last N hours.
    #[param(minimum = 1)]
    hours: Option<i64>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl ReadingsQuery {
    fn into_reading_query(self) -> AppResult<ReadingQuery> {
        let limit = self.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        if !(1..=MAX_QUERY_LIMIT).contains(&limit) {
            return Err(AppError::unprocessable(format!(
                "limit must be between 1 and {MAX_QUERY_LIMIT}"
            )));
        }
        let offset = self.offset.or(self.skip).unwrap_or(0);
        if offset < 0 {
            return Err(AppError::unprocessable("offset must be >= 0"));
        }
        let since = match self.hours {
            Some(hours) if hours < 1 => {
                return Err(AppError::unprocessable("hours must be >= 1"));
            }
            Some(hours) => Some(
                Duration::try_hours(hours)
                    .and_then(|window| Utc::now().checked_sub_signed(window))
                    .ok_or_else(|| AppError::unprocessable("hours is out of range"))?,
            ),
            None => None,
        };
        Ok(ReadingQuery {
            gateway_id: non_blank(self.gateway_id),
            node_id: non_blank(self.node_id),
            since,
            limit,
            offset,
        })
    }
}

#[utoipa::path(
    post,
    path = "/api/sensor-data",
    tag = "sensor_data",
    request_body = crate::ingest::RawReading,
    params(("Idempotency-Key" = Option<String>, Header, description = "Stable per logical submission; retries reuse the job id")),
    responses(
        (status = 202, description = "Reading queued", body = SubmitResponse),
        (status = 401, description = "Missing or invalid API key", body = crate::error::ErrorBody),
        (status = 422, description = "Validation error", body = crate::error::ErrorBody),
        (status = 503, description = "Queue unavailable; retry later", body = crate::error::ErrorBody)
    ),
    security(("ApiKey" = []), ("HTTPBearer" = []))
)]
pub(crate) async fn submit_reading(
    State(state): State<AppState>,
    GatewayAuth(principal): GatewayAuth,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::unprocessable("Idempotency-Key must be visible ASCII"))
        })
        .transpose()?;

    match state
        .gateway
        .submit_json(&body, &principal, idempotency_key)
        .await
    {
        Ok(submission) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                status: "accepted".to_string(),
                message: "Reading queued for storage".to_string(),
                job_id: submission.job_id.to_string(),
            }),
        )),
        Err(SubmitError::Invalid(err)) => Err(AppError::unprocessable(err.to_string())),
        Err(SubmitError::Unavailable(_)) => Err(AppError::unavailable(
            "Ingest queue unavailable; retry later",
            ENQUEUE_RETRY_AFTER_SECS,
        )),
    }
}

#[utoipa::path(
    get,
    path = "/api/sensor-data",
    tag = "sensor_data",
    params(ReadingsQuery),
    responses(
        (status = 200, description = "Readings, newest first", body = Vec<ReadingResponse>),
        (status = 401, description = "Missing or invalid API key", body = crate::error::ErrorBody),
        (status = 422, description = "Invalid filter", body = crate::error::ErrorBody)
    ),
    security(("ApiKey" = []), ("HTTPBearer" = []))
)]
pub(crate) async fn list_readings(
    State(state): State<AppState>,
    GatewayAuth(_principal): GatewayAuth,
    Query(query): Query<ReadingsQuery>,
) -> AppResult<Json<Vec<ReadingResponse>>> {
    let query = query.into_reading_query()?;
    let readings = state.readings.query(&query).await.map_err(map_db_error)?;
    Ok(Json(
        readings.into_iter().map(ReadingResponse::from).collect(),
    ))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/sensor-data", get(list_readings).post(submit_reading))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_aliases() {
        let query = ReadingsQuery {
            skip: Some(20),
            gateway_id: Some("  ".to_string()),
            node_id: Some(" N-1 ".to_string()),
            ..Default::default()
        }
        .into_reading_query()
        .unwrap();
        assert_eq!(query.limit, DEFAULT_QUERY_LIMIT);
        assert_eq!(query.offset, 20);
        assert_eq!(query.gateway_id, None);
        assert_eq!(query.node_id.as_deref(), Some("N-1"));
        assert!(query.since.is_none());
    }

    #[test]
    fn hours_become_a_lower_bound() {
        let before = Utc::now() - Duration::hours(6);
        let query = ReadingsQuery {
            hours: Some(6),
            ..Default::default()
        }
        .into_reading_query()
        .unwrap();
        let since = query.since.unwrap();
        assert!(since >= before && since <= Utc::now() - Duration::hours(6) + Duration::seconds(1));
    }

    #[test]
    fn out_of_range_filters_are_unprocessable() {
        for query in [
            ReadingsQuery {
                limit: Some(0),
                ..Default::default()
            },
            ReadingsQuery {
                limit: Some(MAX_QUERY_LIMIT + 1),
                ..Default::default()
            },
            ReadingsQuery {
                offset: Some(-1),
                ..Default::default()
            },
            ReadingsQuery {
                hours: Some(0),
                ..Default::default()
            },
            ReadingsQuery {
                hours: Some(i64::MAX),
                ..Default::default()
            },
        ] {
            let err = query.into_reading_query().unwrap_err();
            assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        }
    }
}
