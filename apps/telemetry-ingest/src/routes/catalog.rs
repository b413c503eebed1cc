use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::auth::GatewayAuth;
use crate::error::{map_db_error, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct StatsResponse {
    pub total_readings: i64,
    pub total_gateways: i64,
    pub total_nodes: i64,
    pub latest_reading_time: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct NodesQuery {
    /// Only nodes that reported through this gateway.
    gateway_id: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "catalog",
    responses(
        (status = 200, description = "Aggregate reading statistics", body = StatsResponse),
        (status = 401, description = "Missing or invalid API key")
    ),
    security(("ApiKey" = []), ("HTTPBearer" = []))
)]
pub(crate) async fn reading_stats(
    State(state): State<AppState>,
    GatewayAuth(_principal): GatewayAuth,
) -> AppResult<Json<StatsResponse>> {
    let stats = state.readings.stats().await.map_err(map_db_error)?;
    Ok(Json(StatsResponse {
        total_readings: stats.total_readings,
        total_gateways: stats.total_gateways,
        total_nodes: stats.total_nodes,
        latest_reading_time: stats.latest_reading_time.map(|ts| ts.to_rfc3339()),
    }))
}

#[utoipa::path(
    get,
    path = "/api/gateways",
    tag = "catalog",
    responses(
        (status = 200, description = "Distinct gateway ids", body = Vec<String>),
        (status = 401, description = "Missing or invalid API key")
    ),
    security(("ApiKey" = []), ("HTTPBearer" = []))
)]
pub(crate) async fn list_gateways(
    State(state): State<AppState>,
    GatewayAuth(_principal): GatewayAuth,
) -> AppResult<Json<Vec<String>>> {
    let gateways = state.readings.gateways().await.map_err(map_db_error)?;
    Ok(Json(gateways))
}

#[utoipa::path(
    get,
    path = "/api/nodes",
    tag = "catalog",
    params(NodesQuery),
    responses(
        (status = 200, description = "Distinct node ids", body = Vec<String>),
        (status = 401, description = "Missing or invalid API key")
    ),
    security(("ApiKey" = []), ("HTTPBearer" = []))
)]
pub(crate) async fn list_nodes(
    State(state): State<AppState>,
    GatewayAuth(_principal): GatewayAuth,
    Query(query): Query<NodesQuery>,
) -> AppResult<Json<Vec<String>>> {
    let gateway_id = query
        .gateway_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let nodes = state.readings.nodes(gateway_id).await.map_err(map_db_error)?;
    Ok(Json(nodes))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(reading_stats))
        .route("/gateways", get(list_gateways))
        .route("/nodes", get(list_nodes))
}
