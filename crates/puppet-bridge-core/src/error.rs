//! Error types for the puppet bridge.
//!
//! Every failure a caller can observe is a [`BridgeError`]. Errors cross the
//! wire as a [`Status`] (code + message) and are rebuilt on the other side
//! with [`BridgeError::from_status`].

use crate::wire::{Status, StatusCode};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the puppet bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Session setup errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    // Mid-session transport errors
    #[error("Stream error: {message}")]
    Stream { message: String },

    // Malformed chunk sequences or wire messages
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Out-of-band store errors
    #[error("Out-of-band entry not found: {uuid}")]
    NotFound { uuid: String },

    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    /// A non-OK status returned by the remote peer.
    #[error("Remote status {code:?}: {message}")]
    Status { code: StatusCode, message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Call cancelled")]
    Cancelled,

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Method not implemented: {method}")]
    Unimplemented { method: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rustls::Error> for BridgeError {
    fn from(err: rustls::Error) -> Self {
        BridgeError::Tls {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BridgeError::Timeout(std::time::Duration::from_secs(0))
        } else {
            BridgeError::Connection {
                message: err.to_string(),
            }
        }
    }
}

impl BridgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a stream error.
    pub fn stream(message: impl Into<String>) -> Self {
        BridgeError::Stream {
            message: message.into(),
        }
    }

    /// Shorthand for a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        BridgeError::Connection {
            message: message.into(),
        }
    }

    /// Not-found error for an out-of-band identifier.
    pub fn not_found(uuid: &Uuid) -> Self {
        BridgeError::NotFound {
            uuid: uuid.to_string(),
        }
    }

    /// Map to the status code carried on the wire.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::Connection { .. } | BridgeError::Stream { .. } => StatusCode::Unavailable,
            BridgeError::Protocol { .. } | BridgeError::InvalidParams { .. } => {
                StatusCode::InvalidArgument
            }
            BridgeError::NotFound { .. } => StatusCode::NotFound,
            BridgeError::AlreadyExists { .. } => StatusCode::AlreadyExists,
            BridgeError::Unauthenticated { .. } => StatusCode::Unauthenticated,
            BridgeError::Status { code, .. } => *code,
            BridgeError::Timeout(_) => StatusCode::DeadlineExceeded,
            BridgeError::Cancelled => StatusCode::Cancelled,
            BridgeError::Unimplemented { .. } => StatusCode::Unimplemented,

            // All other errors are internal errors
            _ => StatusCode::Internal,
        }
    }

    /// Convert into a wire status.
    pub fn to_status(&self) -> Status {
        let message = match self {
            // Keep the bare identifier so the peer can rebuild the same variant.
            BridgeError::NotFound { uuid } => uuid.clone(),
            BridgeError::Protocol { message }
            | BridgeError::AlreadyExists { message }
            | BridgeError::Unauthenticated { message }
            | BridgeError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Status::new(self.status_code(), message)
    }

    /// Rebuild an error from a non-OK status received from the peer.
    pub fn from_status(status: Status) -> Self {
        match status.code {
            StatusCode::NotFound => BridgeError::NotFound {
                uuid: status.message,
            },
            StatusCode::AlreadyExists => BridgeError::AlreadyExists {
                message: status.message,
            },
            StatusCode::Unauthenticated => BridgeError::Unauthenticated {
                message: status.message,
            },
            StatusCode::InvalidArgument => BridgeError::Protocol {
                message: status.message,
            },
            StatusCode::Cancelled => BridgeError::Cancelled,
            code => BridgeError::Status {
                code,
                message: status.message,
            },
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection { .. } | BridgeError::Timeout(_) | BridgeError::Stream { .. }
        )
    }
}
