//! aidispatch: AI job dispatch node.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aidispatch_core::{DispatchConfig, RunnersConfig};
use aidispatch_server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DispatchConfig::from_env()?;
    let port = config.port;
    let runners = match &config.runners_file {
        Some(path) => RunnersConfig::load(path)?,
        None => RunnersConfig::default(),
    };

    let state = Arc::new(AppState::new(config)?);
    state.warm_runners(&runners).await;
    state.dispatcher.start();

    let app = build_router(state.clone());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("aidispatch listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    // Every accepted job gets a delivery before the process goes away.
    let drain_timeout = if state.dispatcher.fatal().is_triggered() {
        state.config.fatal_delivery_timeout
    } else {
        state.config.job_timeout
    };
    state.dispatcher.drain(drain_timeout).await;
    state.shutdown().await;

    if let Some(reason) = state.dispatcher.fatal().reason() {
        error!("Exiting after unrecoverable worker error: {}", reason);
        std::process::exit(1);
    }
    info!("aidispatch stopped");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let fatal = state.dispatcher.fatal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        reason = fatal.wait() => error!("Terminating: {}", reason),
    }
    // Upgraded worker sockets are not tracked by graceful shutdown.
    state.remote.stop();
}
