//! Durable message bus: ordered topics, consumer groups, at-least-once delivery.
//!
//! [`MessageBus`] is the trait the rest of the pipeline depends on; two
//! adapters ship behind it — [`in_memory::InMemoryBus`] (the first-class,
//! dependency-free adapter used by tests and single-binary deployments) and
//! [`redis_streams::RedisStreamsBus`] (backed by Redis Streams). Selecting
//! between them is a bootstrap-time concern (`PUBSUB_ADAPTER`), never a
//! per-call decision.

pub mod in_memory;
pub mod model;
pub mod redis_streams;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryBus;
pub use model::{AudioEncoding, AudioFrame, Transcript, TranscriptType};
pub use redis_streams::RedisStreamsBus;

/// Errors surfaced by a [`MessageBus`] adapter.
///
/// These are internal to the bus; callers that cross an API boundary convert
/// them into [`crate::error::PipelineError::Bus`].
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("bus operation timed out: {0}")]
    Timeout(String),

    #[error("unknown consumer group {group} on topic {topic}")]
    UnknownGroup { topic: String, group: String },

    #[error("unknown message id {0}")]
    UnknownMessageId(String),

    #[error("bus backend error: {0}")]
    Backend(String),
}

/// A message delivered to a subscription: decoded bytes plus the bus-assigned
/// monotonically increasing id used for acking and ordering.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub payload: Vec<u8>,
}

/// A durable, ordered, at-least-once topic abstraction with consumer groups.
///
/// Implementations must guarantee FIFO delivery per topic and that a new
/// consumer group joins at the topic's tail (live-tail semantics — no replay
/// of history), matching live-transcript consumption. Trimming must never
/// discard a message that is still pending (delivered, unacked) for some
/// group within the retention window.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Appends `payload` to `topic`. Returns the bus-assigned message id.
    ///
    /// Not idempotent at the bus level; producers that need de-duplication
    /// embed their own `seq` in the payload.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, BusError>;

    /// Joins (creating if necessary) `group` on `topic` as `consumer`.
    ///
    /// A freshly created group starts at the topic's tail. A group that
    /// already exists (e.g. after a process restart with the same name)
    /// resumes from its stored cursor, and its pending (delivered-but-unacked)
    /// messages become available again via [`BusSubscription::reclaim`].
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Enumerates topic names matching `pattern` (a glob: `transcript.*`).
    async fn scan_topics(&self, pattern: &str) -> Result<Vec<String>, BusError>;
}

/// A live subscription handle returned by [`MessageBus::subscribe`].
#[async_trait]
pub trait BusSubscription: Send + Sync {
    /// Waits for and returns the next undelivered message for this group, or
    /// `None` on an internal poll timeout (callers should simply call again;
    /// this is not end-of-stream, topics never end).
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError>;

    /// Marks `message_id` as processed, removing it from the group's pending list.
    async fn ack(&mut self, message_id: &str) -> Result<(), BusError>;

    /// Returns pending messages idle for at least `min_idle_ms`, re-assigning
    /// them to this consumer. Used to recover work from a crashed peer in the
    /// same consumer group.
    async fn reclaim(&mut self, min_idle_ms: u64) -> Result<Vec<Delivery>, BusError>;
}
