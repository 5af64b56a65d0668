//! Context - one in-flight data token
//!
//! A [`Context`] carries a single payload through the graph. Each hop consumes a
//! generation of contexts and produces the next one through [`Context::generate`], so a
//! context id is never processed twice: once a context reaches a final status
//! ([`ContextStatus::is_final`]) it is only ever read for auditing.
//!
//! # Lifecycle
//!
//! ```text
//!  New ──┐
//!        ├──► Ready ──► Archived | Terminated | Error
//! Pending┘
//! ```
//!
//! `dispatched` is orthogonal to the status: a `Pending` context becomes dispatched when
//! the pre-processing phase of its target node claims it, and a `New` context becomes
//! dispatched when its producing node's publisher hands it to outgoing edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Position holding terminal outputs of a run
pub const END: &str = "__end__";

/// Processing status of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    /// Produced by a node, waiting for its publisher to dispatch it
    New,
    /// Waiting on an edge (or node inbox) for the target to claim it
    Pending,
    /// Claimed for execution at a node, or held by a block
    Ready,
    /// Fully handled
    Archived,
    /// Suppressed because its run was terminated
    Terminated,
    /// The transform consuming it failed
    Error,
}

impl ContextStatus {
    /// Whether the context can still make progress
    pub fn is_live(&self) -> bool {
        matches!(self, Self::New | Self::Pending | Self::Ready)
    }

    /// Whether the context has left processing for good
    pub fn is_final(&self) -> bool {
        !self.is_live()
    }
}

/// Join semantics of a parallel group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// The first branch to arrive wins
    Either,
    /// Every branch must arrive
    All,
}

/// Correlation id for everything spawned by one external `start` call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    id: String,
}

impl Session {
    /// Create a session with a fresh id
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Session {
    fn from(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl From<String> for Session {
    fn from(id: String) -> Self {
        Self { id }
    }
}

/// One data token positioned at a node or an edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Unique id of this generation
    pub id: String,

    /// Stream owning the node or edge the context sits at
    pub stream_id: String,

    /// Stream of the run that created the context
    pub origin_stream: String,

    /// Node id or edge id
    pub position: String,

    /// Payload; `Null` marks an intentionally idle placeholder
    pub payload: Value,

    /// Processing status
    pub status: ContextStatus,

    /// Already handed to the next phase
    #[serde(default)]
    pub dispatched: bool,

    /// Cohort this context arrived with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    /// Cohort its successors will share
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_batch: Option<String>,

    /// Fan-out group id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_id: Option<String>,

    /// Fan-out join semantics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_mode: Option<ParallelMode>,

    /// Consumed by a join
    #[serde(default)]
    pub joined: bool,

    /// Runs this context belongs to
    #[serde(default)]
    pub trace_ids: BTreeSet<String>,

    /// Session id of the originating `start` call
    pub session: String,

    /// Window token id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,

    /// Node that produced this context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Context {
    /// Create a fresh context in `stream` at `position`
    pub fn new(
        stream_id: impl Into<String>,
        position: impl Into<String>,
        payload: Value,
        session: &Session,
    ) -> Self {
        let stream_id = stream_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            origin_stream: stream_id.clone(),
            stream_id,
            position: position.into(),
            payload,
            status: ContextStatus::New,
            dispatched: false,
            batch_id: None,
            to_batch: None,
            parallel_id: None,
            parallel_mode: None,
            joined: false,
            trace_ids: BTreeSet::new(),
            session: session.id().to_string(),
            window: None,
            lineage: None,
            created_at: Utc::now(),
        }
    }

    /// Derive the next generation of this context
    ///
    /// The successor gets a fresh id, the given payload and position, status `New`, and
    /// inherits stream, origin, batch, session, traces, window, parallel group and
    /// lineage.
    pub fn generate(&self, payload: Value, position: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: self.stream_id.clone(),
            origin_stream: self.origin_stream.clone(),
            position: position.into(),
            payload,
            status: ContextStatus::New,
            dispatched: false,
            batch_id: self.batch_id.clone(),
            to_batch: None,
            parallel_id: self.parallel_id.clone(),
            parallel_mode: self.parallel_mode,
            joined: self.joined,
            trace_ids: self.trace_ids.clone(),
            session: self.session.clone(),
            window: self.window.clone(),
            lineage: self.lineage.clone(),
            created_at: Utc::now(),
        }
    }

    /// Set the status
    pub fn with_status(mut self, status: ContextStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the batch id
    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Add a trace id
    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_ids.insert(trace_id.into());
        self
    }

    /// Set the window token id
    pub fn with_window(mut self, window_id: impl Into<String>) -> Self {
        self.window = Some(window_id.into());
        self
    }

    /// Set the parallel group
    pub fn with_parallel(mut self, parallel_id: impl Into<String>, mode: ParallelMode) -> Self {
        self.parallel_id = Some(parallel_id.into());
        self.parallel_mode = Some(mode);
        self
    }

    /// Drop the parallel group, making this an ordinary context again
    pub fn clear_parallel(&mut self) {
        self.parallel_id = None;
        self.parallel_mode = None;
        self.joined = false;
    }

    /// Whether the payload is the idle sentinel
    pub fn is_idle(&self) -> bool {
        self.payload.is_null()
    }

    /// Whether the context still takes part in a run
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}
