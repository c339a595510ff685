//! Error types for reps-core

use thiserror::Error;

/// Result type alias using reps-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in reps-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record, operation or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid sync configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence layer cannot be reached (poisoned lock, closed store)
    #[error("Sync store unavailable: {0}")]
    StoreUnavailable(String),
}
