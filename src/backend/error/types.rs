//! Backend Error Types
//!
//! This module defines the error type used throughout the server. It
//! wraps the protocol taxonomy from the shared module and the failure
//! modes of the ambient stack.

use thiserror::Error;

use crate::shared::ProtocolError;

/// All errors that can occur in the server
#[derive(Debug, Error)]
pub enum BackendError {
    /// Protocol-level error, including open-post guard failures
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// JSON serialization or deserialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket transport failure
    #[error("websocket: {0}")]
    WebSocket(String),

    /// Snapshot cache build failure. Carries the original error message
    /// so that all single-flight waiters can receive the same error.
    #[error("cache: {message}")]
    Cache { message: String },

    /// Password hashing failure
    #[error("bcrypt: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    /// Server configuration error
    #[error("config: {message}")]
    Config { message: String },
}

impl BackendError {
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The protocol error wrapped by this error, if any
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this error is a guard failure that rejects the current
    /// operation without terminating the session
    pub fn is_guard_failure(&self) -> bool {
        self.as_protocol()
            .map(|err| !err.closes_session())
            .unwrap_or(false)
    }
}

impl From<axum::Error> for BackendError {
    fn from(err: axum::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_failures_detected() {
        let err = BackendError::from(ProtocolError::BodyTooLong);
        assert!(err.is_guard_failure());

        let err = BackendError::from(ProtocolError::BufferOverflow);
        assert!(!err.is_guard_failure());
    }

    #[test]
    fn test_store_errors_are_not_guard_failures() {
        let err = BackendError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_guard_failure());
        assert!(err.as_protocol().is_none());
    }

    #[test]
    fn test_cache_error_message() {
        let err = BackendError::cache("fetch failed");
        assert_eq!(err.to_string(), "cache: fetch failed");
    }
}
