//! Vendor streaming connection abstraction.
//!
//! The worker depends only on [`VendorStream`]/[`VendorFactory`], never on a
//! specific vendor SDK, so it is testable with [`super::mock_vendor::MockVendor`]
//! and swappable to a real implementation ([`super::vendor_ws::VendorWebSocketFactory`])
//! purely by configuration (`ASR_PROVIDER`).

use async_trait::async_trait;
use thiserror::Error;

/// Errors from a vendor streaming connection. Internal to the ASR worker;
/// converted to [`crate::error::PipelineError::Vendor`] at API boundaries.
#[derive(Debug, Error, Clone)]
pub enum VendorError {
    #[error("vendor connect failed: {0}")]
    Connect(String),

    #[error("vendor authentication failed: {0}")]
    Auth(String),

    #[error("vendor rate limited: {0}")]
    RateLimited(String),

    #[error("vendor connection closed: {0}")]
    Closed(String),

    #[error("malformed vendor message: {0}")]
    MalformedMessage(String),
}

/// A decoded event from the vendor stream.
#[derive(Debug, Clone, PartialEq)]
pub enum VendorEvent {
    Transcript {
        text: String,
        is_final: bool,
        confidence: Option<f32>,
    },
    Error(VendorErrorKind),
}

/// Coarse vendor error classification, distinct from [`VendorError`] so a
/// transcript-level event stream doesn't need to carry owned error chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorErrorKind {
    Auth,
    RateLimited,
    Other,
}

/// One live streaming session with an ASR vendor, scoped to a single call.
///
/// Exactly one `VendorStream` must exist per `interaction_id` at a time;
/// creating a second one for the same call while the first is live is a bug.
#[async_trait]
pub trait VendorStream: Send {
    /// Sends a chunk of PCM16LE audio already past the silence gate.
    async fn send_audio(&mut self, pcm16le: &[u8]) -> Result<(), VendorError>;

    /// Waits for the next vendor event. `None` means the vendor closed the
    /// stream (clean close or unrecoverable error); the caller should
    /// reconnect through [`VendorFactory::connect`].
    async fn next_event(&mut self) -> Option<VendorEvent>;

    /// Releases vendor-side resources. Idempotent.
    async fn close(&mut self);
}

/// Constructs a [`VendorStream`] for a specific call. Implementations decide
/// how connection parameters (endpoint, credentials) are supplied.
#[async_trait]
pub trait VendorFactory: Send + Sync {
    async fn connect(
        &self,
        interaction_id: &str,
        sample_rate_hz: u32,
    ) -> Result<Box<dyn VendorStream>, VendorError>;
}
