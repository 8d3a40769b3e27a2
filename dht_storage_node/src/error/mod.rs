// Error handling module for the DHT storage node
//
// This module defines the error type shared by the local store, the service
// endpoint and the replication client, plus its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::io;
use std::result;
use thiserror::Error;

/// Result type for DHT node operations
pub type Result<T> = result::Result<T, DhtError>;

/// Error type for DHT node operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// Value exceeds the per-entry size cap; rejected before any mutation
    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// Create-only put on a key that already holds a different value
    #[error("Entry already exists")]
    Conflict,

    /// Write quorum not reached
    #[error("Operation failed Total/Positive/Negative: {total}/{positive}/{negative}")]
    PutFailed {
        total: usize,
        positive: usize,
        negative: usize,
    },

    /// Malformed Get continuation token
    #[error("Invalid continuation token: {0}")]
    InvalidToken(String),

    /// Request body is well-formed but not acceptable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The local overlay node is not connected
    #[error("The node is (going) offline, DHT is offline")]
    Offline,

    /// The redundant neighbor write failed and the local write was rolled back
    #[error("Forward to neighbor failed: {0}")]
    ForwardFailed(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization-related errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    IO(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DhtError {
    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            DhtError::ValueTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DhtError::Conflict | DhtError::PutFailed { .. } => StatusCode::CONFLICT,
            DhtError::InvalidToken(_) | DhtError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DhtError::Offline => StatusCode::SERVICE_UNAVAILABLE,
            DhtError::ForwardFailed(_) | DhtError::Network(_) => StatusCode::BAD_GATEWAY,
            DhtError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DhtError::NotFound(_) => StatusCode::NOT_FOUND,
            DhtError::Serialization(_) => StatusCode::BAD_REQUEST,
            DhtError::Config(_) | DhtError::IO(_) | DhtError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON body sent with the status code; remote callers rebuild the error from it
    pub(crate) fn body(&self) -> serde_json::Value {
        let code = self.status_code().as_u16();
        let message = self.to_string();
        match self {
            DhtError::ValueTooLarge { size, max } => serde_json::json!({
                "error": {
                    "code": code,
                    "message": message,
                    "size": size,
                    "max": max,
                }
            }),
            DhtError::PutFailed {
                total,
                positive,
                negative,
            } => serde_json::json!({
                "error": {
                    "code": code,
                    "message": message,
                    "total": total,
                    "positive": positive,
                    "negative": negative,
                }
            }),
            _ => serde_json::json!({
                "error": {
                    "code": code,
                    "message": message
                }
            }),
        }
    }
}

/// Implement IntoResponse for DhtError so it can be returned directly from handlers
impl IntoResponse for DhtError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

impl From<io::Error> for DhtError {
    fn from(err: io::Error) -> Self {
        DhtError::IO(err.to_string())
    }
}

impl From<reqwest::Error> for DhtError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DhtError::Timeout
        } else {
            DhtError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DhtError {
    fn from(err: serde_json::Error) -> Self {
        DhtError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for DhtError {
    fn from(err: bincode::Error) -> Self {
        DhtError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for DhtError {
    fn from(err: toml::ser::Error) -> Self {
        DhtError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DhtError {
    fn from(err: toml::de::Error) -> Self {
        DhtError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for DhtError {
    fn from(err: config::ConfigError) -> Self {
        DhtError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_failed_message_carries_vote_counts() {
        let err = DhtError::PutFailed {
            total: 4,
            positive: 1,
            negative: 2,
        };
        assert_eq!(
            err.to_string(),
            "Operation failed Total/Positive/Negative: 4/1/2"
        );
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn size_and_token_errors_are_client_errors() {
        let too_large = DhtError::ValueTooLarge { size: 2048, max: 1024 };
        assert_eq!(too_large.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(DhtError::InvalidToken("bad".into())
            .status_code()
            .is_client_error());
    }

    #[test]
    fn upstream_failures_are_bad_gateway() {
        for err in [
            DhtError::ForwardFailed("right neighbor".into()),
            DhtError::Network("refused".into()),
        ] {
            assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        }
    }
}
