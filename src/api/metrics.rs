use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub documents: usize,
    pub chunks: usize,
}

/// GET /api/metrics - Query counters since start or last reset
pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// POST /api/metrics/reset
pub async fn reset_metrics(State(state): State<AppState>) -> StatusCode {
    state.metrics.reset();
    tracing::info!("Metrics reset");
    StatusCode::NO_CONTENT
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        documents: state.documents.read().len(),
        chunks: state.corpus.num_chunks(),
    })
}
