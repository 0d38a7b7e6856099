//! agent-assist-core — shared library for the real-time agent-assist pipeline.
//!
//! Telephony audio comes in over a WebSocket, is buffered and gated per call,
//! streamed to a speech-to-text vendor, and the resulting transcripts are
//! published to a durable bus and fanned out to browser-facing SSE clients.
//! This crate is used by the standalone server binary; it has no
//! platform-specific dependencies of its own.
//!
//! # Architecture
//!
//! - [`bus`]: durable, ordered, at-least-once message bus (in-memory and
//!   Redis Streams adapters)
//! - [`registry`]: TTL-backed active-call metadata store
//! - [`asr`]: per-call audio buffering, silence gating, and vendor streaming
//! - [`fanout`]: transcript discovery and SSE client routing
//! - [`api`]: the ingest WebSocket, SSE stream, and status HTTP endpoints
//! - [`bootstrap`]: composition root wiring the above into
//!   [`BootstrappedServices`]
//! - [`config`]: business-logic configuration ([`CoreConfig`])
//! - [`error`]: the crate-wide [`PipelineError`] taxonomy
//!
//! # Abstraction Traits
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks
//!   independent of the embedding runtime
//! - [`MessageBus`](bus::MessageBus) / [`CallRegistry`](registry::CallRegistry):
//!   swappable in-memory vs. Redis-backed adapters

#![warn(clippy::all)]

pub mod api;
pub mod asr;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod protocol_constants;
pub mod registry;
pub mod runtime;
pub mod utils;

// Re-export commonly used types at the crate root.
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use bus::{AudioEncoding, AudioFrame, BusError, MessageBus, Transcript, TranscriptType};
pub use config::{AsrProvider, CoreConfig, IngestAuth, PubsubAdapter, SilenceThresholds};
pub use error::{ErrorCode, PipelineError, PipelineResult};
pub use registry::{Call, CallMetadata, CallRegistry, CallStatus, RegistryError};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use utils::now_millis;

pub use api::{start_server, AppState, ServerError, WsConnectionManager};
pub use asr::AsrWorker;
pub use fanout::{FanoutStatus, TranscriptFanout};
