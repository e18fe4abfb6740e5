/// Metrics snapshot endpoint

use axum::{extract::State, response::Json, routing::get, Router};

use crate::api::AppState;
use crate::runtime::RuntimeMetrics;

pub fn create_metrics_routes() -> Router<AppState> {
    Router::new().route("/api/metrics", get(get_metrics))
}

/// GET /api/metrics
/// Returns: { "queue": {...}, "cache": {...}, "pool": {...}, "memory": {...}, "breakers": [...] }
async fn get_metrics(State(state): State<AppState>) -> Json<RuntimeMetrics> {
    Json(state.runtime.metrics())
}
