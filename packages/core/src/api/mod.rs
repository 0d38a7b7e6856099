//! HTTP/WebSocket API layer.
//!
//! This module wires the five components (bus, registry, ASR worker,
//! fan-out, ingest gateway) behind one [`AppState`] and exposes them over
//! axum: the telephony ingest WebSocket, the browser-facing SSE stream, and
//! a small set of operational JSON endpoints.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::asr::AsrWorker;
use crate::bus::MessageBus;
use crate::config::CoreConfig;
use crate::fanout::TranscriptFanout;
use crate::registry::CallRegistry;

pub mod http;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Counters surfaced at `/health` for the ingest gateway.
#[derive(Default)]
pub struct IngestMetrics {
    pub frames_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub congestion_events: AtomicU64,
}

/// Shared application state for the API layer.
///
/// A thin handle to the already-constructed components; handlers never hold
/// business logic themselves, only enough to route a request to the right
/// component method.
#[derive(Clone)]
pub struct AppState {
    /// Durable message bus (`audio_stream`, `transcript.<call>` topics).
    pub bus: Arc<dyn MessageBus>,
    /// Active call metadata store.
    pub registry: Arc<dyn CallRegistry>,
    /// Business-logic configuration (ingest auth mode, ports, tunables).
    pub config: Arc<CoreConfig>,
    /// Tracks live ingest WebSocket connections for force-close on shutdown.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Ingest gateway counters.
    pub ingest_metrics: Arc<IngestMetrics>,
    /// ASR worker, queried for `/health` counters.
    pub asr_worker: Arc<AsrWorker>,
    /// Transcript fan-out, queried for `/transcripts/status` and used to
    /// register SSE clients at `/events/stream`.
    pub fanout: Arc<TranscriptFanout>,
    /// Cancelled on graceful shutdown; handlers use it to bound long-lived
    /// streams (SSE, ingest) so `axum::serve` can drain in bounded time.
    pub cancel: CancellationToken,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn CallRegistry>,
        config: Arc<CoreConfig>,
        ws_manager: Arc<WsConnectionManager>,
        asr_worker: Arc<AsrWorker>,
        fanout: Arc<TranscriptFanout>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            registry,
            config,
            ws_manager,
            ingest_metrics: Arc::new(IngestMetrics::default()),
            asr_worker,
            fanout,
            cancel,
        }
    }
}

/// Starts the HTTP server on `state.config.ingest_port`, serving until
/// `state.cancel` fires.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.ingest_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(%addr, "ingest/status server listening");
    let cancel = state.cancel.clone();
    let app = http::create_router(state);

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    );

    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server exited with error");
            }
        }
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received, stopping server");
        }
    }
    Ok(())
}
