//! Error types shared across the FaceGuard workspace.

use thiserror::Error;

/// Errors that can occur anywhere in the scanner pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration error (missing or malformed environment values)
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Object-storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Platform / discovery provider error
    #[error("provider error: {0}")]
    Provider(String),

    /// Face-detection provider error
    #[error("detection error: {0}")]
    Detection(String),

    /// Circuit breaker is open for a remote host; fail fast
    #[error("circuit open for host: {0}")]
    CircuitOpen(String),

    /// Downloaded bytes failed image validation (content type, magic bytes,
    /// size floor, dimensions, decode)
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for a provider error.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Shorthand for a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Shorthand for a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Whether the retry helper should attempt this operation again.
    ///
    /// Transient transport failures (timeouts, connect errors, 5xx) and I/O
    /// errors are retryable. Validation failures, circuit-open, and logic
    /// errors are terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error is the circuit breaker failing fast.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}
