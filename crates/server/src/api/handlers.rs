use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use assignrelay_core::{OrchestratorStatus, SanitizedConfig};

use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<SanitizedConfig> {
    Json(state.sanitized_config())
}

/// Orchestrator status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Whether the orchestrator is enabled in config
    pub available: bool,
    /// Connected hub sessions across all groups
    pub hub_sessions: usize,
    #[serde(flatten)]
    pub orchestrator: OrchestratorStatus,
}

/// Get orchestrator and per-worker consumer status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let hub_sessions = state.sessions().session_count().await;
    match state.orchestrator() {
        Some(orch) => Json(StatusResponse {
            available: true,
            hub_sessions,
            orchestrator: orch.status().await,
        }),
        None => Json(StatusResponse {
            available: false,
            hub_sessions,
            orchestrator: OrchestratorStatus::default(),
        }),
    }
}

/// Prometheus text exposition
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state).await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        encode_metrics(),
    )
}
