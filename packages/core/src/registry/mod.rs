//! Call Registry: short-lived call metadata with TTL, the source of truth for
//! "is this call live".
//!
//! Two adapters ship behind [`CallRegistry`]: [`in_memory::InMemoryCallRegistry`]
//! (`DashMap` plus a periodic sweep task, mirroring the bus's ring-buffer trim
//! pattern) and [`redis::RedisCallRegistry`] (native key TTL, `SCAN` for
//! `list_active`). Registry unavailability is non-fatal to the rest of the
//! pipeline: callers treat [`RegistryError`] as something to log and continue
//! past, never a reason to drop audio.

pub mod in_memory;
pub mod redis_backed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use in_memory::InMemoryCallRegistry;
pub use redis_backed::RedisCallRegistry;

use crate::bus::AudioEncoding;

/// Errors surfaced by a [`CallRegistry`] adapter.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("registry backend unavailable: {0}")]
    Unavailable(String),

    #[error("registry backend error: {0}")]
    Backend(String),
}

/// Lifecycle state of a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Active,
    Ended,
}

/// A registered call's metadata, as stored at `call:metadata:<interaction_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub interaction_id: String,
    pub tenant_id: String,
    pub from: String,
    pub to: String,
    pub start_time_ms: u64,
    pub last_activity_ms: u64,
    pub status: CallStatus,
    pub sample_rate_hz: u32,
    pub encoding: AudioEncoding,
}

/// Fields known at `start`, before any frame has been sent.
#[derive(Debug, Clone)]
pub struct CallMetadata {
    pub tenant_id: String,
    pub from: String,
    pub to: String,
    pub sample_rate_hz: u32,
    pub encoding: AudioEncoding,
}

/// Key-value store with TTL for active call metadata.
#[async_trait]
pub trait CallRegistry: Send + Sync {
    /// Upserts `interaction_id` with a fresh TTL.
    async fn register(&self, interaction_id: &str, metadata: CallMetadata) -> Result<(), RegistryError>;

    /// Refreshes TTL only. A no-op (not an error) if the call is unknown —
    /// registry loss must never be fatal to an in-flight call.
    async fn touch(&self, interaction_id: &str) -> Result<(), RegistryError>;

    /// Marks the call ended and shortens its TTL for post-call queries.
    async fn end(&self, interaction_id: &str) -> Result<(), RegistryError>;

    /// Returns active calls, most recently active first.
    async fn list_active(&self, limit: usize) -> Result<Vec<Call>, RegistryError>;

    /// Looks up a single call's metadata.
    async fn get(&self, interaction_id: &str) -> Result<Option<Call>, RegistryError>;
}
