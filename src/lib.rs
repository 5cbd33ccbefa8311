//! jobcache -- execution-history cache manager for a job-orchestration host.
//!
//! Fetches per-job execution history from the host API on a background
//! worker, caches it in an embedded SQLite store, and reads a companion
//! plugin's cache when one is installed.

pub mod api;
pub mod config;
pub mod fetcher;
pub mod logging;
pub mod manager;
pub mod model;
pub mod pool;
pub mod store;
pub mod worker;

use anyhow::Result;

use crate::config::AppConfig;
use crate::manager::ExecutionDataManager;

/// Start the daemon: cache manager, worker health monitor, and API server.
/// Returns after ctrl-c, once the worker has been terminated.
pub async fn serve(config: &AppConfig, bind: &str) -> Result<()> {
    tracing::info!(db_path = %config.cache.db_path.display(), "initializing cache manager");
    let manager = ExecutionDataManager::from_config(config);
    manager.start_health_monitor();

    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState {
        manager: manager.clone(),
    });

    tracing::info!(%addr, "jobcache listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
