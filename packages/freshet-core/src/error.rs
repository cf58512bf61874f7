//! Centralized error types for the Freshet core library.
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

use crate::context::ContextId;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Freshet server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("EOF: {0}")]
    Eof(String),

    /// A blocking operation did not complete within its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A coroutine was asked to stop and observed it at `pull()`.
    ///
    /// This is the cooperative-shutdown signal, not a failure. Runtimes
    /// treat a cycle returning this as a clean exit.
    #[error("Coroutine interrupted: {0}")]
    Interrupted(String),

    /// Wire-format violation (RTMP chunking, AMF0, MPEG-TS, RTP, FLV).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The stream URL already has an active publisher.
    #[error("stream {url} is busy, acquired by cid={owner}, current cid={current}")]
    StreamBusy {
        url: String,
        owner: ContextId,
        current: ContextId,
    },

    /// A consumer queue exceeded its bound and was dropped.
    #[error("Consumer overflow: {0}")]
    ConsumerOverflow(String),

    /// Requested stream does not exist.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// HLS playback session missing or expired.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Server configuration error (missing or inconsistent settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error wrapped with a context string while propagating upward.
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<ServerError>,
    },
}

impl ServerError {
    /// Wraps the error with a context string, preserving the cause chain.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether the root cause is the cooperative-shutdown signal.
    ///
    /// Wrapping never hides an interrupt: connection loops use this to
    /// distinguish clean shutdown from real failures.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted(_) => true,
            Self::Wrapped { source, .. } => source.is_interrupted(),
            _ => false,
        }
    }

    /// Whether the root cause is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Wrapped { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::StreamNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::StreamBusy { .. } => StatusCode::CONFLICT,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Wrapped { source, .. } => source.status_code(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorCode for ServerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Eof(_) => "eof",
            Self::Timeout(_) => "timeout",
            Self::Interrupted(_) => "interrupted",
            Self::Protocol(_) => "protocol_error",
            Self::StreamBusy { .. } => "stream_busy",
            Self::ConsumerOverflow(_) => "consumer_overflow",
            Self::StreamNotFound(_) => "stream_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
            Self::Wrapped { source, .. } => source.code(),
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ServerError {
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
