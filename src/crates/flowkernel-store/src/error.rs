//! Error types for repository, lock and messenger operations

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while talking to a collaborator backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent modification or violated precondition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend (database, lock service, broker) failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend has been shut down
    #[error("Backend closed: {0}")]
    Closed(String),
}
