mod aggregator;
mod api;
mod client;
mod config;
mod connection_pool;
mod errors;
mod executor;
mod memory_guard;
mod metrics;
mod percentiles;
mod registry;
mod results;
mod runner;
mod scheduler;
mod telemetry;

use std::sync::Arc;

use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let server_config = ServerConfig::from_env()?;
    info!(?server_config, "starting load test control plane");

    metrics::register_metrics()?;

    let registry = Arc::new(std::sync::Mutex::new(prometheus::default_registry().clone()));
    tokio::spawn(metrics::start_metrics_server(
        server_config.metrics_port,
        registry,
    ));

    tokio::spawn(memory_guard::spawn_memory_guard(
        memory_guard::MemoryGuardConfig::default(),
    ));

    let bind_addr = server_config.bind_addr.clone();
    let state = AppState::new(server_config);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight tests");
}
