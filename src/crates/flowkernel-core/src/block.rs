//! Suspension points for human-in-the-loop flows
//!
//! A [`Block`] holds contexts until someone calls [`Block::resume`]. It comes in two
//! variants:
//!
//! - **Validator** (node level): items of a ready batch that fail the node's validator
//!   are held instead of executing. A node built with `NodeRef::block` rejects every
//!   item, so everything reaching it suspends.
//! - **Filter** (edge level): items matched by an edge are held before they reach the
//!   target node.
//!
//! ```text
//!            ┌────────────┐  resume(verify, payload)
//!  ─────────►│   Block    │────────────────────────►  downstream
//!   held     │ (holding)  │  accepted items are regenerated
//!            └────────────┘  rejected items stay held
//! ```
//!
//! Held contexts are persisted as `Ready` at the block position, so they stay live (their
//! run does not settle) and are never claimed again. A runtime reloads them into the
//! holding set when it launches. There is no timeout: a held item waits until it is
//! resumed or its run is terminated.

use flowkernel_store::{Context, ContextStatus};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Weak;

use crate::error::{FlowError, Result};
use crate::hooks::FlowEvent;
use crate::node::NodeId;
use crate::runtime::Kernel;

/// Where a block sits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// On a node; released items go to the node's publisher
    Validator,
    /// On an edge; released items wait on the edge for the target node
    Filter {
        /// Edge id
        edge: String,
    },
}

/// A suspension point with a holding set
pub struct Block {
    event_id: String,
    node: NodeId,
    stream: String,
    kind: BlockKind,
    held: Mutex<Vec<Context>>,
    kernel: Weak<Kernel>,
}

impl Block {
    pub(crate) fn new(
        event_id: impl Into<String>,
        node: NodeId,
        stream: String,
        kind: BlockKind,
        kernel: Weak<Kernel>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            node,
            stream,
            kind,
            held: Mutex::new(Vec::new()),
            kernel,
        }
    }

    /// Event id used to look the block up
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Owning node (validator) or target node (filter)
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Variant
    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    /// Position held contexts sit at
    pub fn position(&self) -> &str {
        match &self.kind {
            BlockKind::Validator => &self.node,
            BlockKind::Filter { edge } => edge,
        }
    }

    /// Number of held contexts
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Snapshot of held contexts
    pub fn held(&self) -> Vec<Context> {
        self.held.lock().clone()
    }

    /// Add contexts to the holding set, ignoring ids already held
    pub(crate) fn hold(&self, contexts: Vec<Context>) -> usize {
        let mut held = self.held.lock();
        let known: BTreeSet<String> = held.iter().map(|c| c.id.clone()).collect();
        let before = held.len();
        held.extend(contexts.into_iter().filter(|c| !known.contains(&c.id)));
        held.len() - before
    }

    /// Release held contexts accepted by `verify`
    ///
    /// Each accepted item is archived and regenerated with a fresh id, its original batch
    /// id and `payload` (or its own payload when `None`). Returns how many were released.
    pub async fn resume<F>(&self, verify: F, payload: Option<Value>) -> Result<usize>
    where
        F: Fn(&Context) -> bool,
    {
        let kernel = self.kernel.upgrade().ok_or(FlowError::Shutdown)?;

        let accepted: Vec<Context> = {
            let mut held = self.held.lock();
            let (accepted, kept): (Vec<Context>, Vec<Context>) =
                held.drain(..).partition(|c| verify(c));
            *held = kept;
            accepted
        };
        if accepted.is_empty() {
            return Ok(0);
        }

        let mut archived = Vec::with_capacity(accepted.len());
        let mut fresh = Vec::with_capacity(accepted.len());
        for ctx in accepted {
            let body = payload.clone().unwrap_or_else(|| ctx.payload.clone());
            let mut next = ctx.generate(body, ctx.position.clone());
            next.stream_id = self.stream.clone();
            next.status = match self.kind {
                BlockKind::Validator => ContextStatus::New,
                BlockKind::Filter { .. } => ContextStatus::Pending,
            };
            fresh.push(next);
            archived.push(ctx.with_status(ContextStatus::Archived));
        }

        // One write, successors first: the run must never look idle in between
        kernel.repo.save_contexts(&[fresh.as_slice(), archived.as_slice()].concat()).await?;
        kernel.rebind_windows(&archived, &fresh).await?;

        match self.kind {
            BlockKind::Validator => {
                let batches: BTreeSet<Option<String>> =
                    fresh.iter().map(|c| c.batch_id.clone()).collect();
                for batch in batches {
                    kernel.enqueue_dispatch(&self.node, batch);
                }
            }
            BlockKind::Filter { .. } => kernel.wake(&self.node),
        }

        let count = fresh.len();
        tracing::info!(event_id = %self.event_id, node = %self.node, count, "Resumed held contexts");
        kernel.emit(FlowEvent::Resumed {
            event_id: self.event_id.clone(),
            count,
        });
        Ok(count)
    }

    /// Drop held contexts of a terminated run
    pub(crate) async fn release_trace(&self, kernel: &Kernel, trace_id: &str) -> Result<usize> {
        let released: Vec<Context> = {
            let mut held = self.held.lock();
            let (released, kept): (Vec<Context>, Vec<Context>) =
                held.drain(..).partition(|c| c.trace_ids.contains(trace_id));
            *held = kept;
            released
        };
        if released.is_empty() {
            return Ok(0);
        }

        let terminated: Vec<Context> = released
            .into_iter()
            .map(|c| c.with_status(ContextStatus::Terminated))
            .collect();
        kernel.repo.save_contexts(&terminated).await?;
        kernel.rebind_windows(&terminated, &[]).await?;
        tracing::debug!(event_id = %self.event_id, trace = %trace_id, count = terminated.len(), "Dropped held contexts of terminated run");
        Ok(terminated.len())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("event_id", &self.event_id)
            .field("node", &self.node)
            .field("kind", &self.kind)
            .field("held", &self.held_count())
            .finish()
    }
}
