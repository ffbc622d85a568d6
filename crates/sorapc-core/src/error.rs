//! Error types for the core library.

use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote endpoint error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Image decoding failed.
    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// A stored row could not be decoded.
    #[error("Corrupt cache row: {0}")]
    CorruptRow(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential storage error.
    #[error("Credential error: {0}")]
    Credential(#[from] crate::account::credentials::CredentialError),

    /// Background task panicked.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Failure reported by a remote endpoint (message source or document store).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network-level failure that may succeed on retry.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Credentials were rejected; the user has to sign in again.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The endpoint answered with something we cannot use.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Classifies an HTTP status code returned by a remote endpoint.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("HTTP {status}: {}", message.into());
        match status {
            401 | 403 => Self::Auth(message),
            408 | 425 | 429 | 500..=599 => Self::TransientNetwork(message),
            _ => Self::Protocol(message),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::TransientNetwork(err.to_string())
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
