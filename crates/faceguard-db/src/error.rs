//! Error types for the data store adapter.

use thiserror::Error;

/// Errors that can occur when talking to the shared database.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// PostgreSQL connection or query error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON (de)serialization error for JSONB columns
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value read from the database violated a scanner invariant
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

/// Result type for data store operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for faceguard::Error {
    fn from(err: Error) -> Self {
        faceguard::Error::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_row_display() {
        let err = Error::InvalidRow("phash must be 64 bits".to_string());
        assert_eq!(err.to_string(), "invalid row: phash must be 64 bits");
    }

    #[test]
    fn test_generic_display() {
        let err = Error::Generic("boom".to_string());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_converts_to_core_error() {
        let err: faceguard::Error = Error::Generic("query failed".to_string()).into();
        assert!(matches!(err, faceguard::Error::Database(_)));
        assert!(err.to_string().contains("query failed"));
    }
}
