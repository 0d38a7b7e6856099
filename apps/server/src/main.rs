//! agent-assist-server — standalone binary for the real-time agent-assist
//! pipeline.
//!
//! Wires [`agent_assist_core::bootstrap_services`] and serves the ingest
//! WebSocket, the browser-facing SSE stream, and the status endpoints until
//! a shutdown signal arrives.

mod config;

use std::path::PathBuf;

use agent_assist_core::api::AppState;
use agent_assist_core::start_server;
use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

/// Headless server for the real-time agent-assist pipeline.
#[derive(Parser, Debug)]
#[command(name = "agent-assist-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter (e.g. "info", "agent_assist_core=debug,info").
    #[arg(short, long, default_value = "info", env = "AGENT_ASSIST_LOG_LEVEL")]
    log_level: String,

    /// Port the ingest/SSE/status HTTP server binds (overrides config file/env).
    #[arg(short = 'p', long, env = "INGEST_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "agent-assist-server starting");

    let mut config = ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.core.ingest_port = port;
    }

    let services = agent_assist_core::bootstrap_services(config.core)
        .await
        .context("failed to bootstrap services")?;
    tracing::info!("services bootstrapped");

    let app_state = AppState::new(
        services.bus.clone(),
        services.registry.clone(),
        services.config.clone(),
        services.ws_manager.clone(),
        services.asr_worker.clone(),
        services.fanout.clone(),
        services.cancel.clone(),
    );

    let server_handle = tokio::spawn(async move {
        if let Err(err) = start_server(app_state).await {
            tracing::error!(error = %err, "server error");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, cleaning up");

    services.shutdown().await;
    let _ = server_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Bridges the crate's `log` macro usage (older dependency-style logging in
/// a few kept modules) into the same `tracing` subscriber used everywhere else.
fn init_logging(filter: &str) {
    tracing_log::LogTracer::init().expect("failed to install log-to-tracing bridge");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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
}
