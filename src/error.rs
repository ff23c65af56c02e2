//! Error types for cache and synchronization operations

use thiserror::Error;

/// Errors that can occur during cache, store, or ledger operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Failed to read from or write to the origin store
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Failed to serialize or deserialize a persisted record
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The fetch collaborator failed and no fallback was available
    #[error("Fetch failed for '{key}': {reason}")]
    FetchError { key: String, reason: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Underlying I/O failure from a file-backed store
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Boxed error produced by caller-supplied collaborators (network fetches,
/// remote revocation lookups)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl From<String> for SyncError {
    fn from(s: String) -> Self {
        SyncError::Other(s)
    }
}

impl From<&str> for SyncError {
    fn from(s: &str) -> Self {
        SyncError::Other(s.to_string())
    }
}
