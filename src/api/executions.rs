/// Execution endpoint
///
/// Plans the submitted graph and runs it, delegating every node to the
/// caller's callback URL. Responds once the whole graph has finished with the
/// aggregated result and its stats. Node failures are part of a 200 response;
/// only malformed graphs and bad callback URLs are rejected.

use axum::{extract::State, response::Json, routing::post, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::api::{ApiError, AppState};
use crate::runtime::pool::origin_of;
use crate::runtime::{AggregatedResult, ExecutionOptions, ExecutionStats, HttpCallbackExecutor};
use crate::workflow::types::{Edge, Node, TaskPriority};

/// Request body for a distributed execution
#[derive(Debug, Deserialize)]
pub struct ExecutionRequest {
    pub workflow_id: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Receives one POST per node with the task as JSON
    pub callback_url: String,
    /// Input for root nodes
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub result: AggregatedResult,
    pub stats: ExecutionStats,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new().route("/api/executions", post(execute_workflow))
}

/// Plan and run a workflow
///
/// POST /api/executions
/// Body: { "workflow_id": "...", "nodes": [...], "edges": [...], "priority": "high",
///         "callback_url": "http://...", "input": {...} }
async fn execute_workflow(
    State(state): State<AppState>,
    Json(payload): Json<ExecutionRequest>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    origin_of(&payload.callback_url)
        .map_err(|e| ApiError::bad_request("INVALID_CALLBACK_URL", e.to_string()))?;

    let runtime = &state.runtime;
    let plan = runtime.create_execution_plan(&payload.workflow_id, &payload.nodes, &payload.edges)?;
    let executor = Arc::new(HttpCallbackExecutor::new(runtime.pool().clone(), payload.callback_url));

    tracing::info!(
        "▶️ Executing workflow '{}' at {} priority",
        plan.workflow_id,
        payload.priority.as_str()
    );
    let options = ExecutionOptions {
        priority: payload.priority,
        input: payload.input,
        ..ExecutionOptions::default()
    };
    let result = runtime.execute_distributed_with(&plan, executor, options).await;
    let stats = result.get_execution_stats();

    Ok(Json(ExecutionResponse { result, stats }))
}
