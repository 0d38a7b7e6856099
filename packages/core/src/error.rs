//! Centralized error types for the agent-assist pipeline core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the agent-assist pipeline.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum PipelineError {
    /// The durable message bus could not complete an operation after retries.
    #[error("bus error: {0}")]
    Bus(String),

    /// The speech-to-text vendor connection failed for a specific call.
    #[error("vendor streaming error: {0}")]
    Vendor(String),

    /// The ingest WebSocket received an event outside its expected state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A transcript payload was malformed or empty and was dropped.
    #[error("malformed transcript: {0}")]
    MalformedTranscript(String),

    /// The call registry is unreachable; callers should degrade gracefully.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Requested call is not known to the registry.
    #[error("call not found: {0}")]
    CallNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed for an ingest connection or API call.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Server configuration error (missing required settings).
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Bus(_) => "bus_error",
            Self::Vendor(_) => "vendor_error",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::MalformedTranscript(_) => "malformed_transcript",
            Self::RegistryUnavailable(_) => "registry_unavailable",
            Self::CallNotFound(_) => "call_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "internal_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CallNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::MalformedTranscript(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RegistryUnavailable(_) | Self::Configuration(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<crate::bus::BusError> for PipelineError {
    fn from(err: crate::bus::BusError) -> Self {
        Self::Bus(err.to_string())
    }
}

impl From<crate::asr::vendor::VendorError> for PipelineError {
    fn from(err: crate::asr::vendor::VendorError) -> Self {
        Self::Vendor(err.to_string())
    }
}

impl From<crate::registry::RegistryError> for PipelineError {
    fn from(err: crate::registry::RegistryError) -> Self {
        Self::RegistryUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_not_found_returns_correct_code() {
        let err = PipelineError::CallNotFound("c1".into());
        assert_eq!(err.code(), "call_not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn registry_unavailable_returns_service_unavailable() {
        let err = PipelineError::RegistryUnavailable("redis down".into());
        assert_eq!(err.code(), "registry_unavailable");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn unauthorized_returns_401() {
        let err = PipelineError::Unauthorized("bad token".into());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }
}
