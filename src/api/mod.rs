/// HTTP API Layer
///
/// REST endpoints for node-graph owners and dashboards:
/// - Plan preview for a node/edge graph
/// - Distributed execution through an HTTP callback
/// - Runtime metrics snapshot

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

use crate::error::{PlanError, RuntimeError};
use crate::runtime::Runtime;

// Plan preview endpoint
pub mod plans;

// Execution endpoint
pub mod executions;

// Metrics snapshot endpoint
pub mod metrics;

// Re-export router builders
pub use executions::create_execution_routes;
pub use metrics::create_metrics_routes;
pub use plans::create_plan_routes;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

/// Error body returned by handlers: `{ "error": ..., "code": ... }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        Self::bad_request("PLAN_ERROR", err.to_string())
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = match &err {
            RuntimeError::Plan(_) | RuntimeError::Config(_) => StatusCode::BAD_REQUEST,
            RuntimeError::QueueFull { .. } | RuntimeError::PoolTimeout { .. } | RuntimeError::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("❌ {} ({})", self.message, self.code);
        }
        (self.status, Json(json!({ "error": self.message, "code": self.code }))).into_response()
    }
}
