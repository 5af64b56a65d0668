//! Collaborator contracts consumed by the kernel
//!
//! The kernel never talks to a database, a lock service or a message broker directly.
//! It depends on three narrow traits instead:
//!
//! - [`Repository`] - persists contexts, traces and window tokens and answers the
//!   queries the scheduler needs (by position and status, by parallel group, by trace)
//! - [`LockManager`] - hands out mutually exclusive leases keyed by
//!   `(stream, node, operation)`
//! - [`Messenger`] - publishes "batch ready" triggers addressed to a node and delivers
//!   them to that node's processing loop
//!
//! Several kernel instances (threads or processes) sharing one set of collaborators
//! cooperate safely as long as the implementations honour the atomicity notes on each
//! method. [`crate::memory`] provides in-process implementations for development and
//! tests.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use flowkernel_store::{Context, ContextStatus, Repository, Result};
//!
//! struct PostgresRepository {
//!     pool: sqlx::PgPool,
//! }
//!
//! #[async_trait]
//! impl Repository for PostgresRepository {
//!     async fn mark_dispatched(&self, ids: &[String]) -> Result<usize> {
//!         // UPDATE contexts SET dispatched = true
//!         //  WHERE id = ANY($1) AND status = 'pending' AND NOT dispatched
//!         todo!()
//!     }
//!
//!     // ...
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::pin::Pin;

use crate::context::{Context, ContextStatus};
use crate::error::Result;
use crate::trace::{Trace, TraceStatus};
use crate::window::WindowToken;

/// Persistence contract for contexts, traces and windows
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert or replace contexts by id
    async fn save_contexts(&self, contexts: &[Context]) -> Result<()>;

    /// Load one context
    async fn get_context(&self, id: &str) -> Result<Option<Context>>;

    /// Contexts of `stream` positioned at any of `positions` with `status`, oldest first
    async fn find_contexts(
        &self,
        stream_id: &str,
        positions: &[String],
        status: ContextStatus,
    ) -> Result<Vec<Context>>;

    /// Flag contexts as dispatched
    ///
    /// Atomic: only contexts that are still `Pending` and not yet dispatched are
    /// claimed. Returns how many were claimed by this call.
    async fn mark_dispatched(&self, ids: &[String]) -> Result<usize>;

    /// Every context carrying the parallel group id, oldest first
    async fn find_by_parallel(&self, parallel_id: &str) -> Result<Vec<Context>>;

    /// Flag members of a parallel group as joined
    async fn mark_joined(&self, parallel_id: &str, ids: &[String]) -> Result<()>;

    /// Every context belonging to a trace, oldest first
    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Context>>;

    /// Insert or replace a trace
    async fn save_trace(&self, trace: &Trace) -> Result<()>;

    /// Load a trace
    async fn get_trace(&self, id: &str) -> Result<Option<Trace>>;

    /// Add context ids to the pool of every listed trace
    async fn register_in_pool(&self, trace_ids: &[String], context_ids: &[String]) -> Result<()>;

    /// Whether every listed trace is terminated (`false` for an empty list)
    async fn is_terminated(&self, trace_ids: &[String]) -> Result<bool>;

    /// Mark traces terminated
    async fn mark_terminated(&self, trace_ids: &[String]) -> Result<()>;

    /// Move a trace out of `Running`
    ///
    /// Atomic: has no effect unless the trace is currently running. Returns whether the
    /// status changed.
    async fn complete_trace(&self, id: &str, status: TraceStatus) -> Result<bool>;

    /// Insert or replace a window token
    async fn save_window(&self, window: &WindowToken) -> Result<()>;

    /// Load a window token
    async fn get_window(&self, id: &str) -> Result<Option<WindowToken>>;

    /// Replace `removed` by `added` in a window's todo set
    ///
    /// Atomic with respect to other window operations.
    async fn rebind_window(
        &self,
        id: &str,
        removed: &[String],
        added: &[String],
    ) -> Result<Option<WindowToken>>;

    /// Fire a window if its todo set is empty; returns whether this call fired it
    ///
    /// Atomic with respect to other window operations.
    async fn fire_window(&self, id: &str) -> Result<bool>;
}

/// Composite key identifying one lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    /// Stream id
    pub stream: String,
    /// Node id
    pub node: String,
    /// Operation name (`pre-process`, `request-ready`, `dispatch`, ...)
    pub operation: String,
}

impl LockKey {
    /// Build a key
    pub fn new(
        stream: impl Into<String>,
        node: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            node: node.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stream, self.node, self.operation)
    }
}

/// A held lock; released when dropped
pub struct LockGuard {
    key: LockKey,
    _lease: Box<dyn Any + Send>,
}

impl LockGuard {
    /// Wrap a backend lease
    pub fn new(key: LockKey, lease: impl Any + Send) -> Self {
        Self {
            key,
            _lease: Box::new(lease),
        }
    }

    /// Key this guard holds
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Mutual exclusion contract
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Wait for and take the lock named by `key`
    async fn acquire(&self, key: &LockKey) -> Result<LockGuard>;
}

/// Trigger telling a node that a batch is ready to be claimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReady {
    /// Stream of the node
    pub stream_id: String,
    /// Addressed node
    pub node_id: String,
    /// Batch that was dispatched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Emission time
    pub issued_at: DateTime<Utc>,
}

impl BatchReady {
    /// Build a trigger
    pub fn new(
        stream_id: impl Into<String>,
        node_id: impl Into<String>,
        batch_id: Option<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            node_id: node_id.into(),
            batch_id,
            issued_at: Utc::now(),
        }
    }
}

/// Stream of triggers delivered to one node
pub type TriggerStream = Pin<Box<dyn Stream<Item = BatchReady> + Send>>;

/// Event delivery contract
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Publish a trigger to every listener of `trigger.node_id`
    async fn publish(&self, trigger: BatchReady) -> Result<()>;

    /// Listen for triggers addressed to `node_id`
    async fn subscribe(&self, node_id: &str) -> Result<TriggerStream>;
}
