//! Image Server - on-demand image resizing with a hybrid disk cache
//!
//! Serves images from local folders and remote HTTP origins, applying the
//! transformation commands in the query string. Derivatives are cached on
//! disk and evicted least-recently-read first.

mod config;
mod error;
mod request;
mod server;
mod storage;
mod transform;
mod types;

use crate::config::ServerConfig;
use crate::error::{ImageServerError, Result};
use crate::request::RequestPipeline;
use crate::server::{start_server, ServerState, SharedState};
use crate::storage::StorageRouter;
use hybrid_cache::HybridCache;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("image_server=info".parse()?)
        .add_directive("hybrid_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Image Server...");

    let config = ServerConfig::from_env()?;
    info!("Port: {}", config.port);
    info!("Web root: {:?}", config.web_root);
    info!("Cache dir: {:?}", config.cache.cache_directory);
    info!(
        "Cache size cap: {} MB",
        config.cache.cache_size_cap / (1024 * 1024)
    );
    info!(
        "Write queue budget: {} MB",
        config.cache.write_queue_memory_budget / (1024 * 1024)
    );

    let cache = HybridCache::open(config.cache.clone()).await?;
    let storage = StorageRouter::new(config.mounts());
    let pipeline = RequestPipeline::new(config.rewrite_rules.clone());

    let state: SharedState = Arc::new(ServerState::new(
        cache.clone(),
        storage,
        pipeline,
        &config.default_cache_control,
    )?);

    start_server(state, config.port, shutdown_signal())
        .await
        .map_err(|e| ImageServerError::Config(format!("Server error: {}", e)))?;

    info!("Draining cache writes...");
    cache.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
