//! Error types for the chat relay.

use thiserror::Error;

use crate::broker::BrokerError;

/// Common error type for the chat relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Database error.
    ///
    /// Database errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Permission denied error.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Validation error for user input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pub/sub broker error.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// External profile service error.
    #[error("profile service error: {0}")]
    Profile(String),
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::Database(e.to_string())
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
