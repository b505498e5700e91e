//! Process entrypoint: configuration, service wiring, worker pool, and
//! the HTTP listener.

mod routes;
mod state;

use std::time::Duration;

use murmur_config::Config;
use murmur_pipeline::WorkerPool;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::state::CoreServices;

/// How often the expiry and stuck-job sweeps run.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let services = CoreServices::build(config).await?;

    let shutdown = CancellationToken::new();
    let worker_handles = WorkerPool::new(services.pipeline.clone()).start(shutdown.clone());
    spawn_sweeps(services.clone(), shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    let app = routes::app(services);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}

fn spawn_sweeps(services: std::sync::Arc<CoreServices>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match services.ingest.sweep_expired().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "expired upload sessions"),
                Err(e) => tracing::warn!(error = %e, "upload expiry sweep failed"),
            }
            match services.jobs.sweep_stuck().await {
                Ok(0) => {}
                Ok(count) => tracing::warn!(count, "failed stuck jobs"),
                Err(e) => tracing::warn!(error = %e, "stuck job sweep failed"),
            }
        }
    });
}
