//! Trace - one logical run of a graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    /// Contexts are still in flight
    Running,
    /// Nothing left in flight, no failure
    Ready,
    /// Nothing left in flight, at least one batch failed
    Error,
    /// Externally terminated
    Terminated,
}

/// One run of a graph started by a single external trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Trace id
    pub id: String,

    /// Stream the run was started on
    pub stream_id: String,

    /// Node the run entered at
    pub start_node: String,

    /// Run status
    pub status: TraceStatus,

    /// Every context id ever registered with this run
    #[serde(default)]
    pub pool: BTreeSet<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Trace {
    /// Start a new running trace
    pub fn new(stream_id: impl Into<String>, start_node: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            start_node: start_node.into(),
            status: TraceStatus::Running,
            pool: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Register context ids in the pool
    pub fn register<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        self.pool.extend(ids.into_iter().cloned());
        self.updated_at = Utc::now();
    }

    /// Whether the run was terminated
    pub fn is_terminated(&self) -> bool {
        self.status == TraceStatus::Terminated
    }

    /// Whether the run has settled
    pub fn is_finished(&self) -> bool {
        self.status != TraceStatus::Running
    }
}
