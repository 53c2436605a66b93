//! Error types for cadence.

use thiserror::Error;

/// Result type alias using cadence's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cadence operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Contact not found
    #[error("Contact not found: {0}")]
    ContactNotFound(uuid::Uuid),

    /// Reminder not found
    #[error("Reminder not found: {0}")]
    ReminderNotFound(uuid::Uuid),

    /// Outbound message delivery failed
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid recurrence rule, bad timezone, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
