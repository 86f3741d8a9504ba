//! Core error types for stocksync-core.
//!
//! This module defines the error hierarchy used across the library. The
//! sync-facing taxonomy lives in [`SyncError`]; everything else is plumbing
//! for storage, configuration and payload validation.

use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;

/// Core error type for stocksync-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Payload or key validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Remote backend errors (only surfaced for remote-only writes)
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// The store was never opened or has been degraded
    #[error("Local store unavailable")]
    Unavailable,

    /// Filesystem error around the database file
    #[error("Database IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No row with this id
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored row could not be decoded
    #[error("Corrupted row in {table}: {message}")]
    Corrupted { table: &'static str, message: String },
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Validation errors raised at the data access boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Payload is not a JSON object
    #[error("Payload for {entity_type} must be a JSON object")]
    NotAnObject { entity_type: String },

    /// A required field is absent or empty
    #[error("Missing required field '{field}' for {entity_type}")]
    MissingField { entity_type: String, field: String },

    /// A field has the wrong JSON type
    #[error("Field '{field}' must be {expected}")]
    WrongType { field: String, expected: &'static str },

    /// Quantity-like field below zero
    #[error("Field '{field}' must not be negative (got {value})")]
    Negative { field: String, value: f64 },

    /// Entity key is empty or whitespace
    #[error("Entity key must not be empty")]
    EmptyKey,

    /// Unknown entity type name
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Create on a key that already exists locally
    #[error("{entity_type} '{key}' already exists")]
    DuplicateKey { entity_type: String, key: String },
}

/// Failure taxonomy of the synchronization subsystem.
///
/// None of these reach a facade caller from background sync; they are
/// carried in pass reports, bootstrap reports and [`crate::SyncEvent`]s.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Probe or remote call timed out or was refused.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Remote rejected a queued operation.
    #[error("Operation {op_id} rejected: {reason}")]
    QueueApply { op_id: String, reason: String },

    /// Remote refused or garbled a listing during the pull phase.
    #[error("Pull of {entity_type} failed: {reason}")]
    Pull { entity_type: String, reason: String },

    /// Local persistence unavailable or corrupted.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// Initialization could not complete fully.
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl DatabaseError {
    /// Whether the store should be abandoned for remote-only mode.
    ///
    /// Lock contention, a missing row and a single undecodable row are not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DatabaseError::Locked | DatabaseError::NotFound(_) | DatabaseError::Corrupted { .. }
        )
    }
}

impl From<DatabaseError> for SyncError {
    fn from(err: DatabaseError) -> Self {
        SyncError::LocalStore(err.to_string())
    }
}


/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
