//! Error types shared across the sync core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for sync core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry policy classification for remote submission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    Retryable,
    Permanent,
}

/// Classify HTTP status into retry behavior.
///
/// Auth failures are retryable: queued intents must survive a token refresh.
pub fn classify_http_status(status: u16) -> RetryClass {
    match status {
        401 | 403 => RetryClass::Retryable,
        408 | 409 | 423 | 425 | 429 => RetryClass::Retryable,
        500..=599 => RetryClass::Retryable,
        _ => RetryClass::Permanent,
    }
}

/// Failures raised by the local replica and its storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend failure (I/O, database)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A persisted document could not be decoded
    #[error("Document '{document}' is corrupted: {reason}")]
    Corrupted { document: String, reason: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Create a backend error from any displayable cause
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a corrupted-document error
    pub fn corrupted(document: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupted {
            document: document.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failures raised while submitting a queued operation to the backend.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure (DNS, connect, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// The submission did not complete within the allotted time
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// Error response from the backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Missing or unusable access token
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The backend rejected the operation outright
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Create a network error from any displayable cause
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Create a rejection error
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for the drain retry policy.
    ///
    /// Auth failures count as retryable: the host can refresh its token and
    /// queued intents must still be there when it does.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Network(_) => RetryClass::Retryable,
            Self::Timeout(_) => RetryClass::Retryable,
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Auth(_) => RetryClass::Retryable,
            Self::Rejected(_) => RetryClass::Permanent,
        }
    }
}

/// Errors surfaced by the sync core facade.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence failure
    #[error("Local storage error: {0}")]
    Store(#[from] StoreError),

    /// Remote submission failure
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Caller supplied an invalid mutation
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
