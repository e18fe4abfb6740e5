/// flowgrid: distributed workflow execution runtime
///
/// Main entry point. Loads configuration (from `FLOWGRID_CONFIG` when set,
/// otherwise `FLOWGRID_*` environment defaults) and starts the HTTP server:
/// - Plan preview at /api/plans
/// - Distributed execution at /api/executions
/// - Metrics at /api/metrics
/// - Health check at /healthz

use flowgrid::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_from_env()?;

    start_server(config).await?;

    Ok(())
}
