//! Error types for the mnemograph memory engine
//!
//! This module provides structured error handling using thiserror. The
//! variants mirror the engine's failure taxonomy: authorization failures are
//! always explicit, validation failures carry a specific reason, and
//! degraded external dependencies are absorbed by callers rather than
//! propagated (see the mutation subsystem).

use thiserror::Error;

/// Main error type for mnemograph operations
#[derive(Error, Debug)]
pub enum MnemographError {
    /// No valid identity on the request (HTTP 401 equivalent)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Valid identity but insufficient permission (HTTP 403 equivalent).
    /// Permission shortfalls are surfaced, never masked as empty data.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Referenced entity/observation does not exist in this tenant
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input (bad cursor, limit out of range, ...)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Write refused by the content sanitizer; audited as flagged
    #[error("Content rejected: {0}")]
    ContentRejected(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Vector index call failed. Mutation paths absorb this into tombstone
    /// counters; it only escapes from direct index administration.
    #[error("Vector index error: {0}")]
    VectorIndex(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid record ID format
    #[error("Invalid record ID: {0}")]
    InvalidRecordId(#[from] uuid::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for mnemograph operations
pub type Result<T> = std::result::Result<T, MnemographError>;

impl From<libsql::Error> for MnemographError {
    fn from(err: libsql::Error) -> Self {
        MnemographError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for MnemographError {
    fn from(err: anyhow::Error) -> Self {
        MnemographError::Other(err.to_string())
    }
}
