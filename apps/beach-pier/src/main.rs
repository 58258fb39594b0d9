use std::sync::Arc;

use anyhow::{Context, Result};
use beach_pier::backend::WebSocketConnector;
use beach_pier::config::{Cli, ServerConfig};
use beach_pier::mirror::{spawn_ndjson_writer, FrameMirror};
use beach_pier::server::{self, AppState};
use beach_pier::{pool, telemetry};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        backend_url = %config.backend_url,
        min_connections = config.pool.min_connections,
        max_connections = config.pool.max_connections,
        balance = ?config.pool.balance,
        "starting beach-pier"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let mirror = FrameMirror::default();
    let mirror_writer = config
        .mirror_path
        .clone()
        .map(|path| spawn_ndjson_writer(path, mirror.subscribe()));

    let connector = WebSocketConnector::new(config.backend_url.clone())
        .context("invalid backend url")?;
    let (pool, pool_task) = pool::start(config.pool.clone(), Arc::new(connector), mirror.clone())
        .await
        .context("failed to start backend pool")?;

    let router = server::router(AppState::new(pool.clone(), metrics));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-pier listening on {}", config.listen_addr);

    let graceful = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; closing backend pool"
    );
    if let Err(err) = pool.shutdown().await {
        warn!(error = %err, "backend pool was already closed");
    }
    if let Err(err) = pool_task.await {
        warn!(error = %err, "backend pool task ended abnormally");
    }
    drop(mirror);
    if let Some(writer) = mirror_writer {
        if tokio::time::timeout(config.shutdown_grace, writer).await.is_err() {
            warn!("frame mirror writer did not finish within the grace period");
        }
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
