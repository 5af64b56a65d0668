//! Publisher - the outgoing side of a node
//!
//! The publisher owns a node's edges and moves contexts onto them:
//!
//! - [`Publisher::offer_payloads`] ingests external payloads, opening a run
//! - [`Publisher::offer`] hands produced contexts to matching edges; the runtime's
//!   dispatcher calls it for every batch a node completes
//!
//! ```text
//!  after-process ──► dispatch queue ──► dispatcher ──► Publisher::offer
//!     (NEW @ node)                      lock(dispatch)     │
//!                                                          ├─► edge 1: PENDING @ edge
//!                                                          ├─► edge 2: held in block
//!                                                          └─► no match: resolved
//! ```

use flowkernel_store::{Context, ContextStatus, LockKey, Session, Trace, WindowToken};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::conditions::{self, Routing};
use crate::edge::Subscription;
use crate::error::{FlowError, Result};
use crate::hooks::FlowEvent;
use crate::node::NodeId;
use crate::runtime::Kernel;

pub(crate) const DISPATCH: &str = "dispatch";

/// Outgoing side of a node
pub struct Publisher {
    node_id: NodeId,
    stream_id: String,
    routing: Routing,
    edges: RwLock<Vec<Arc<Subscription>>>,
}

impl Publisher {
    pub(crate) fn new(node_id: NodeId, stream_id: String, routing: Routing) -> Self {
        Self {
            node_id,
            stream_id,
            routing,
            edges: RwLock::new(Vec::new()),
        }
    }

    /// Routing mode
    pub fn routing(&self) -> Routing {
        self.routing
    }

    /// Outgoing edges in subscription order
    pub fn edges(&self) -> Vec<Arc<Subscription>> {
        self.edges.read().clone()
    }

    /// Number of edges already leading to `target`
    pub(crate) fn edges_to(&self, target: &str) -> usize {
        self.edges.read().iter().filter(|e| e.target() == target).count()
    }

    /// Register an edge
    pub fn subscribe(&self, edge: Subscription) -> Arc<Subscription> {
        let edge = Arc::new(edge);
        self.edges.write().push(edge.clone());
        edge
    }

    /// Open a run with `payloads` waiting at this node; returns the trace id
    pub(crate) async fn offer_payloads(
        &self,
        kernel: &Arc<Kernel>,
        payloads: Vec<Value>,
        session: &Session,
    ) -> Result<String> {
        if payloads.is_empty() {
            return Err(FlowError::EmptyOffer(self.node_id.clone()));
        }

        let trace = Trace::new(&self.stream_id, &self.node_id);
        let batch = Uuid::new_v4().to_string();

        let inputs: Vec<Context> = payloads
            .into_iter()
            .map(|payload| {
                let mut ctx = Context::new(&self.stream_id, &self.node_id, payload, session)
                    .with_trace(&trace.id)
                    .with_status(ContextStatus::Archived);
                ctx.dispatched = true;
                ctx
            })
            .collect();

        let mut generation: Vec<Context> = inputs
            .iter()
            .map(|ctx| {
                ctx.generate(ctx.payload.clone(), self.node_id.clone())
                    .with_status(ContextStatus::Pending)
                    .with_batch(&batch)
            })
            .collect();
        let window = WindowToken::seeded(generation.iter().map(|c| c.id.clone()));
        for ctx in generation.iter_mut() {
            ctx.window = Some(window.id.clone());
        }
        let ids: Vec<String> = generation.iter().map(|c| c.id.clone()).collect();

        kernel.repo.save_window(&window).await?;
        kernel.repo.save_trace(&trace).await?;
        kernel.repo.save_contexts(&inputs).await?;
        kernel.repo.save_contexts(&generation).await?;
        kernel
            .repo
            .register_in_pool(&[trace.id.clone()], &ids)
            .await?;

        tracing::info!(
            trace = %trace.id,
            node = %self.node_id,
            count = ids.len(),
            "Started run"
        );
        kernel.emit(FlowEvent::TraceStarted {
            trace_id: trace.id.clone(),
            stream_id: self.stream_id.clone(),
            count: ids.len(),
        });
        kernel.wake(&self.node_id);
        Ok(trace.id)
    }

    /// Hand contexts produced by this node to its edges
    ///
    /// Returns how many successors were created (pending or held).
    pub(crate) async fn offer(&self, kernel: &Arc<Kernel>, contexts: Vec<Context>) -> Result<usize> {
        let Some(first) = contexts.first() else {
            return Ok(0);
        };
        if contexts.iter().any(|c| c.session != first.session) {
            return Err(FlowError::SessionMismatch {
                node: self.node_id.clone(),
            });
        }

        let traces: Vec<String> = contexts
            .iter()
            .flat_map(|c| c.trace_ids.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if kernel.repo.is_terminated(&traces).await? {
            let terminated: Vec<Context> = contexts
                .into_iter()
                .map(|mut c| {
                    c.status = ContextStatus::Terminated;
                    c.dispatched = true;
                    c
                })
                .collect();
            kernel.repo.save_contexts(&terminated).await?;
            kernel.rebind_windows(&terminated, &[]).await?;
            kernel.settle(&traces).await?;
            tracing::debug!(node = %self.node_id, count = terminated.len(), "Suppressed terminated contexts");
            return Ok(0);
        }

        let edges = self.edges();
        let mut derived = Vec::new();
        let mut held: Vec<(Arc<Subscription>, Context)> = Vec::new();
        let mut targets = BTreeSet::new();
        for (edge, ctx) in conditions::route(self.routing, &self.stream_id, &edges, &contexts) {
            let next = edge.carry(ctx);
            if edge.block().is_some() {
                held.push((edge.clone(), next));
            } else {
                targets.insert(edge.target().to_string());
                derived.push(next);
            }
        }

        let offered: Vec<Context> = contexts
            .into_iter()
            .map(|mut c| {
                c.status = ContextStatus::Archived;
                c.dispatched = true;
                c
            })
            .collect();
        let mut successors = derived;
        successors.extend(held.iter().map(|(_, c)| c.clone()));

        kernel.repo.save_contexts(&successors).await?;
        kernel.repo.save_contexts(&offered).await?;
        kernel.rebind_windows(&offered, &successors).await?;

        for (edge, ctx) in held {
            if let Some(block) = edge.block() {
                let count = block.hold(vec![ctx]);
                kernel.emit(FlowEvent::BatchHeld {
                    event_id: block.event_id().to_string(),
                    count,
                });
            }
        }
        for target in &targets {
            kernel.wake(target);
        }

        tracing::debug!(
            node = %self.node_id,
            offered = offered.len(),
            count = successors.len(),
            "Dispatched batch"
        );
        kernel.settle(&traces).await?;
        Ok(successors.len())
    }

    /// Offer the `New` contexts of one batch waiting at this node
    pub(crate) async fn dispatch_batch(
        &self,
        kernel: &Arc<Kernel>,
        batch: Option<&str>,
    ) -> Result<usize> {
        let key = LockKey::new(&self.stream_id, &self.node_id, DISPATCH);
        let _guard = kernel.locks.acquire(&key).await?;
        let queued: Vec<Context> = kernel
            .repo
            .find_contexts(&self.stream_id, &[self.node_id.clone()], ContextStatus::New)
            .await?
            .into_iter()
            .filter(|c| c.batch_id.as_deref() == batch)
            .collect();
        if queued.is_empty() {
            return Ok(0);
        }
        self.offer(kernel, queued).await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("node_id", &self.node_id)
            .field("routing", &self.routing)
            .field("edges", &self.edges.read().len())
            .finish()
    }
}
