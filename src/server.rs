/// Server setup and initialization
///
/// Starts the runtime and wires it into the HTTP routes.
/// Provides the main application factory function for creating the Axum app.

use crate::{
    api::{create_execution_routes, create_metrics_routes, create_plan_routes, AppState},
    config::Config,
    runtime::Runtime,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Create the Axum application around an already-started runtime
pub fn create_app(runtime: Arc<Runtime>) -> Router {
    let state = AppState { runtime };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_plan_routes())
        .merge(create_execution_routes())
        .merge(create_metrics_routes())
        .with_state(state)
}

/// Start the runtime and serve HTTP until ctrl-c
pub async fn start_server(config: Config) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowgrid server...");

    let runtime = Runtime::start(config.clone())?;
    let app = create_app(runtime.clone());

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    runtime.shutdown().await;
    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
