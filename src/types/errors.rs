//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant maps onto a stable [`ErrorCode`] that is what clients see on the
//! wire, together with a human-readable message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error code carried in every structured error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidEnvelope,
    RateLimitExceeded,
    AccessDenied,
    NoRoute,
    CircuitOpen,
    Timeout,
    DispatchFailed,
    InternalServiceError,
    ConfigurationError,
    ProtocolError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidEnvelope => "INVALID_ENVELOPE",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::NoRoute => "NO_ROUTE",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DispatchFailed => "DISPATCH_FAILED",
            ErrorCode::InternalServiceError => "INTERNAL_SERVICE_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error enum for the routing kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope failed validation; carries every violation found.
    #[error("invalid envelope: {}", .0.join("; "))]
    InvalidEnvelope(Vec<String>),

    /// Source exceeded its request window.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Source is not on the target's allow list.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// No live adapter is registered for the target.
    #[error("no route for target '{target}'")]
    NoRoute {
        target: String,
        known_adapters: Vec<String>,
    },

    /// Breaker for the selected adapter is open.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Bus request or handshake deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Adapter answered with an error, or the send itself failed.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// A built-in service raised unexpectedly.
    #[error("internal service error: {0}")]
    InternalService(String),

    /// Invalid wiring or settings (duplicate responder, zero limits, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed frame or unexpected control message on a connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidEnvelope(_) => ErrorCode::InvalidEnvelope,
            Error::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            Error::AccessDenied(_) => ErrorCode::AccessDenied,
            Error::NoRoute { .. } => ErrorCode::NoRoute,
            Error::CircuitOpen(_) => ErrorCode::CircuitOpen,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::DispatchFailed(_) => ErrorCode::DispatchFailed,
            Error::InternalService(_) => ErrorCode::InternalServiceError,
            Error::Configuration(_) => ErrorCode::ConfigurationError,
            Error::Protocol(_) | Error::Serialization(_) => ErrorCode::ProtocolError,
            Error::Internal(_) | Error::Io(_) => ErrorCode::Internal,
        }
    }

    /// Only transport-level dispatch failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::DispatchFailed(_))
    }

    /// Render the structured error object returned to callers.
    pub fn to_body(&self) -> Value {
        let mut body = serde_json::json!({
            "error": true,
            "error_code": self.code(),
            "message": self.to_string(),
        });
        match self {
            Error::InvalidEnvelope(violations) => {
                body["violations"] = serde_json::json!(violations);
            }
            Error::NoRoute { known_adapters, .. } => {
                body["available_adapters"] = serde_json::json!(known_adapters);
            }
            _ => {}
        }
        body
    }
}

// Convenience constructors
impl Error {
    pub fn invalid_envelope(violations: Vec<String>) -> Self {
        Self::InvalidEnvelope(violations)
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimitExceeded(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    pub fn no_route(target: impl Into<String>, known_adapters: Vec<String>) -> Self {
        Self::NoRoute {
            target: target.into(),
            known_adapters,
        }
    }

    pub fn circuit_open(msg: impl Into<String>) -> Self {
        Self::CircuitOpen(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn dispatch_failed(msg: impl Into<String>) -> Self {
        Self::DispatchFailed(msg.into())
    }

    pub fn internal_service(msg: impl Into<String>) -> Self {
        Self::InternalService(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
