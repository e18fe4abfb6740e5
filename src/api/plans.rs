/// Plan preview endpoint
///
/// Lets a graph owner see how a node/edge graph would be leveled and
/// partitioned without running anything.

use axum::{extract::State, response::Json, routing::post, Router};
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::runtime::ExecutionPlan;
use crate::workflow::types::{Edge, Node};

/// Request body for plan creation
#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub workflow_id: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

pub fn create_plan_routes() -> Router<AppState> {
    Router::new().route("/api/plans", post(create_plan))
}

/// Build an execution plan
///
/// POST /api/plans
/// Body: { "workflow_id": "...", "nodes": [...], "edges": [...] }
async fn create_plan(
    State(state): State<AppState>,
    Json(payload): Json<PlanRequest>,
) -> Result<Json<ExecutionPlan>, ApiError> {
    let plan = state
        .runtime
        .create_execution_plan(&payload.workflow_id, &payload.nodes, &payload.edges)?;

    tracing::info!(
        "🗺️ Planned workflow '{}': {} partitions over {} levels",
        plan.workflow_id,
        plan.partitions.len(),
        plan.level_count()
    );
    Ok(Json(plan))
}
