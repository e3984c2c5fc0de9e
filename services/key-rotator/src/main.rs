//! Key Rotator
//!
//! Single-binary service that:
//! 1. Loads a pool of rate-limited API keys from configuration
//! 2. Backs the rotation queue in memory or in a shared Redis store
//! 3. Hands out the next usable key over HTTP, tracking per-window usage
//! 4. Optionally rotates the queue head on a fixed interval

mod api;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use key_pool::{KeyQueue, MemoryQueue, Pool, RedisQueue, SystemClock};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::{Backend, Config};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-rotator");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        keys = config.pool.keys.len(),
        "configuration loaded"
    );

    let queue = build_queue(&config).await?;
    let pool = Arc::new(Pool::new(queue, Arc::new(SystemClock)));
    let queued = pool.len().await.context("failed to read pool size")?;
    info!(backend = pool.backend(), queued, "key pool ready");

    let rotation = (config.pool.rotate_interval_secs > 0).then(|| {
        let interval = Duration::from_secs(config.pool.rotate_interval_secs);
        info!(interval_secs = interval.as_secs(), "scheduled rotation enabled");
        key_pool::spawn_rotation_task(pool.clone(), interval)
    });

    let app = api::build_router(
        AppState::new(pool, prometheus_handle),
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: notify the
    // server to drain, then race the drain against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    if let Some(rotation) = rotation {
        rotation.abort();
    }
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Build the rotation queue for the configured backend.
///
/// A Redis store that already holds a pool keeps its state; the configured
/// key list only seeds an empty namespace.
async fn build_queue(config: &Config) -> Result<Arc<dyn KeyQueue>> {
    let records = config.pool.records();

    match config.store.backend {
        Backend::Memory => Ok(Arc::new(MemoryQueue::new(records))),
        Backend::Redis => {
            let url = config
                .store
                .url
                .as_ref()
                .context("redis backend has no store URL")?;
            let queue = RedisQueue::connect(url.expose(), &config.store.namespace)
                .await
                .context("failed to connect to shared key store")?;
            queue
                .seed(&records)
                .await
                .context("failed to seed shared key store")?;
            Ok(Arc::new(queue))
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
