//! JSON HTTP API over the pipeline service and sync job manager.

pub mod error;
pub mod extract;
pub mod routes;
pub mod state;

use std::path::Path;

use anyhow::Context;
use axum::Router;
use gcpt_lifecycle::PipelineService;
use gcpt_storage::StoreHandles;
use gcpt_sync::{source_from_config, SyncConfig, SyncManager, SyncPipeline};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use error::{ApiError, ApiResult};
pub use state::AppState;

pub const CRATE_NAME: &str = "gcpt-web";

pub const DEFAULT_PORT: u16 = 8000;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::router()
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Wire the store, outbox and sync manager from the environment.
/// `fixtures` swaps SAM.gov for captured listings.
pub async fn state_from_env(fixtures: Option<&Path>) -> anyhow::Result<AppState> {
    let handles = StoreHandles::from_env().await?;
    let config = SyncConfig::from_env();
    let source = source_from_config(&config, fixtures)?;
    let pipeline = SyncPipeline::new(source, handles.pipeline.clone(), config);
    let service = PipelineService::from_handles(handles);
    Ok(AppState::new(service, SyncManager::new(pipeline)))
}

pub async fn serve_from_env(fixtures: Option<&Path>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("GCPT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let state = state_from_env(fixtures).await?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "gcpt api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
