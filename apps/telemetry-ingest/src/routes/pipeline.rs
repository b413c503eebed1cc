use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value as JsonValue;

use crate::auth::GatewayAuth;
use crate::error::{internal_error, AppError, AppResult};
use crate::queue::QueueError;
use crate::readings::DeadLetter;
use crate::services::stats::PipelineCounters;
use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;
const MAX_DEAD_LETTER_LIMIT: usize = 1000;

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct DeadLettersQuery {
    #[param(minimum = 1, maximum = 1000)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct DeadLetterResponse {
    pub job_id: String,
    #[schema(value_type = Object)]
    pub payload: JsonValue,
    pub reason: String,
    pub attempts: u32,
    pub first_seen_at: String,
    pub dead_lettered_at: String,
}

impl DeadLetterResponse {
    fn from_dead_letter(dead: DeadLetter) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_id: dead.job_id.to_string(),
            payload: serde_json::to_value(&dead.reading)?,
            reason: dead.reason,
            attempts: dead.attempts,
            first_seen_at: dead.first_seen_at.to_rfc3339(),
            dead_lettered_at: dead.dead_lettered_at.to_rfc3339(),
        })
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct QueueStatusResponse {
    pub backend: String,
    pub pending: u64,
    pub leased: u64,
    pub dead_letters: u64,
    pub oldest_pending_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct IngestStatusResponse {
    pub queue: QueueStatusResponse,
    pub counters: PipelineCounters,
    pub workers: usize,
}

fn queue_unavailable(err: QueueError) -> AppError {
    tracing::error!(error = %err, "queue status unavailable");
    AppError::unavailable("Ingest queue unavailable", 5)
}

#[utoipa::path(
    get,
    path = "/api/dead-letters",
    tag = "pipeline",
    params(DeadLettersQuery),
    responses(
        (status = 200, description = "Permanently failed jobs, most recent first", body = Vec<DeadLetterResponse>),
        (status = 401, description = "Missing or invalid API key"),
        (status = 422, description = "Invalid limit", body = crate::error::ErrorBody)
    ),
    security(("ApiKey" = []), ("HTTPBearer" = []))
)]
pub(crate) async fn list_dead_letters(
    State(state): State<AppState>,
    GatewayAuth(_principal): GatewayAuth,
    Query(query): Query<DeadLettersQuery>,
) -> AppResult<Json<Vec<DeadLetterResponse>>> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    if !(1..=MAX_DEAD_LETTER_LIMIT).contains(&limit) {
        return Err(AppError::unprocessable(format!(
            "limit must be between 1 and {MAX_DEAD_LETTER_LIMIT}"
        )));
    }
    let dead = state
        .queue
        .list_dead_letters(limit)
        .await
        .map_err(queue_unavailable)?;
    let response = dead
        .into_iter()
        .map(DeadLetterResponse::from_dead_letter)
        .collect::<Result<Vec<_>, _>>()
        .map_err(internal_error)?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/ingest/status",
    tag = "pipeline",
    responses(
        (status = 200, description = "Queue depth and pipeline counters", body = IngestStatusResponse),
        (status = 401, description = "Missing or invalid API key"),
        (status = 503, description = "Queue unavailable", body = crate::error::ErrorBody)
    ),
    security(("ApiKey" = []), ("HTTPBearer" = []))
)]
pub(crate) async fn ingest_status(
    State(state): State<AppState>,
    GatewayAuth(_principal): GatewayAuth,
) -> AppResult<Json<IngestStatusResponse>> {
    let status = state.queue.status().await.map_err(queue_unavailable)?;
    Ok(Json(IngestStatusResponse {
        queue: QueueStatusResponse {
            backend: status.backend.to_string(),
            pending: status.pending,
            leased: status.leased,
            dead_letters: status.dead_letters,
            oldest_pending_at: status.oldest_pending_at.map(|ts| ts.to_rfc3339()),
        },
        counters: state.stats.snapshot(),
        workers: state.config.workers,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dead-letters", get(list_dead_letters))
        .route("/ingest/status", get(ingest_status))
}
