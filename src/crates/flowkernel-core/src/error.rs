//! Error types for graph construction, ingestion and execution
//!
//! # Error Hierarchy
//!
//! ```text
//! FlowError
//! ├── Validation        - Graph structure errors
//! ├── SessionMismatch   - Offered contexts come from different sessions
//! ├── EmptyOffer        - Nothing to start a run with
//! ├── UnknownNode       - Node id not registered with the runtime
//! ├── UnknownBlock      - No suspension point with that event id
//! ├── NodeExecution     - A transform failed
//! ├── Store             - Repository / lock / messenger failures
//! ├── Configuration     - Invalid runtime configuration
//! ├── Timeout           - Waiting for a run gave up
//! ├── Shutdown          - Runtime is gone
//! ├── Serialization     - JSON errors
//! ├── Yaml              - YAML errors
//! └── Io                - File errors
//! ```
//!
//! Only ingestion-time problems surface synchronously from [`crate::Flow::start`].
//! Transform failures happen on background tasks and are reported through error
//! handlers and [`crate::FlowEvent::BatchFailed`].
//!
//! ```rust
//! use flowkernel_core::FlowError;
//!
//! fn describe(err: &FlowError) -> String {
//!     match err {
//!         FlowError::SessionMismatch { node } => format!("rejected at {}", node),
//!         FlowError::NodeExecution { node, error } => format!("{} failed: {}", node, error),
//!         other => other.to_string(),
//!     }
//! }
//!
//! let err = FlowError::node_execution("parse", "unexpected token");
//! assert_eq!(describe(&err), "parse failed: unexpected token");
//! ```

use flowkernel_store::StoreError;
use thiserror::Error;

/// Convenience result type using [`FlowError`]
pub type Result<T> = std::result::Result<T, FlowError>;

/// Boxed error returned by user transforms
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for all kernel operations
#[derive(Error, Debug)]
pub enum FlowError {
    /// Graph structure is invalid
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// Contexts offered together do not share one session id
    #[error("Contexts offered to '{node}' belong to different sessions")]
    SessionMismatch {
        /// Node whose publisher rejected the offer
        node: String,
    },

    /// A run was started without payloads
    #[error("Cannot start a run on '{0}' without payloads")]
    EmptyOffer(String),

    /// Node id not registered
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// No block carries the event id
    #[error("No suspension point with event id '{0}'")]
    UnknownBlock(String),

    /// A transform failed
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Node whose transform failed
        node: String,
        /// Error message from the transform
        error: String,
    },

    /// Collaborator failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Gave up waiting
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The runtime has been shut down or dropped
    #[error("Runtime is shut down")]
    Shutdown,

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Create a node execution error
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }
}
