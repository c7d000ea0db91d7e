//! vDAG Node Admin API
//!
//! HTTP surface of a running node:
//! - `GET /health` - node status, used by peers as a liveness probe
//! - `POST /setParameters` - runtime parameters for the node logic
//! - `POST /mgmt` - management commands for the node logic
//! - `POST /policies/mgmt` - management commands for a bound policy
//! - `GET /monitoring/pool` - worker pool statistics
//! - `POST /submit` - direct transport entry point
//! - `GET /stream` - WebSocket streaming of partial output

pub mod error;
pub mod model;
pub mod openapi;
pub mod stream;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tracing::{debug, info};

use vd_common::{Packet, PoolStats};
use vd_queue::direct::QUEUE_HEADER;
use vd_runtime::{NodeRuntime, StreamHub};

pub use error::{ApiError, ApiResult};
pub use model::*;
pub use openapi::ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<NodeRuntime>,
    pub streams: Arc<StreamHub>,
}

impl AppState {
    pub fn new(runtime: Arc<NodeRuntime>, streams: Arc<StreamHub>) -> Self {
        Self { runtime, streams }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/setParameters", post(set_parameters_handler))
        .route("/mgmt", post(management_handler))
        .route("/policies/mgmt", post(policy_management_handler))
        .route("/monitoring/pool", get(pool_stats_handler))
        .route("/submit", post(submit_handler))
        .route("/stream", get(stream::stream_handler))
        .route("/api-doc/openapi.json", get(openapi_handler))
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "node",
    responses(
        (status = 200, description = "Node status", body = HealthResponse)
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtime = &state.runtime;
    Json(HealthResponse {
        status: runtime.health().await,
        node_label: runtime.label().to_string(),
        node_id: runtime.node_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        processed_total: runtime.processed_total(),
        dropped_total: runtime.dropped_total(),
    })
}

#[utoipa::path(
    post,
    path = "/setParameters",
    tag = "node",
    responses(
        (status = 200, description = "Parameters applied", body = ManagementResponse),
        (status = 400, description = "Parameters rejected", body = error::ErrorBody)
    )
)]
pub async fn set_parameters_handler(
    State(state): State<AppState>,
    Json(params): Json<Value>,
) -> ApiResult<Json<ManagementResponse>> {
    let applied = state.runtime.update_parameters(params).await?;
    info!(node_label = %state.runtime.label(), "Parameters updated via API");
    Ok(Json(ManagementResponse::ok(applied)))
}

#[utoipa::path(
    post,
    path = "/mgmt",
    tag = "node",
    request_body = ManagementRequest,
    responses(
        (status = 200, description = "Command result", body = ManagementResponse),
        (status = 400, description = "Unsupported command", body = error::ErrorBody)
    )
)]
pub async fn management_handler(
    State(state): State<AppState>,
    Json(request): Json<ManagementRequest>,
) -> ApiResult<Json<ManagementResponse>> {
    let result = state.runtime.management(&request.action, request.data).await?;
    Ok(Json(ManagementResponse::ok(result)))
}

#[utoipa::path(
    post,
    path = "/policies/mgmt",
    tag = "policies",
    request_body = PolicyManagementRequest,
    responses(
        (status = 200, description = "Command result", body = ManagementResponse),
        (status = 400, description = "Unsupported command", body = error::ErrorBody),
        (status = 404, description = "No policy bound", body = error::ErrorBody)
    )
)]
pub async fn policy_management_handler(
    State(state): State<AppState>,
    Json(request): Json<PolicyManagementRequest>,
) -> ApiResult<Json<ManagementResponse>> {
    let handle = state
        .runtime
        .policies()
        .resolve(&request.subgraph, request.stage)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "no {:?} policy bound for sub-graph '{}'",
                request.stage, request.subgraph
            ))
        })?;
    let result = handle.manage(&request.action, request.data).await?;
    Ok(Json(ManagementResponse::ok(result)))
}

#[utoipa::path(
    get,
    path = "/monitoring/pool",
    tag = "monitoring",
    responses(
        (status = 200, description = "Worker pool statistics", body = PoolStats),
        (status = 404, description = "Node runs without a pool", body = error::ErrorBody)
    )
)]
pub async fn pool_stats_handler(State(state): State<AppState>) -> ApiResult<Json<PoolStats>> {
    state
        .runtime
        .pool_stats()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("worker pool is not enabled".to_string()))
}

#[utoipa::path(
    post,
    path = "/submit",
    tag = "node",
    responses(
        (status = 202, description = "Packet accepted", body = SubmitResponse),
        (status = 503, description = "Packet rejected", body = error::ErrorBody)
    )
)]
pub async fn submit_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(packet): Json<Packet>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let queue = headers
        .get(QUEUE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let session_id = packet.session_id.clone();
    debug!(session_id = %session_id, queue = %queue, "Direct submit");

    if !state.runtime.dispatch(packet).await {
        return Err(ApiError::Unavailable(format!(
            "packet for session '{}' rejected",
            session_id
        )));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            accepted: true,
            session_id,
        }),
    ))
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    use utoipa::OpenApi;
    Json(ApiDoc::openapi())
}
