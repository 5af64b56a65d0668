//! Subscriber - the incoming side of a node
//!
//! A subscriber drives a node's work in two phases, each run by its own loop:
//!
//! ```text
//!            inbound positions: upstream edge ids + node id
//!                              │
//!   ┌──────────────────────────▼───────────────────────────┐
//!   │ pre-process     lock(stream, node, "pre-process")    │
//!   │  PENDING, not dispatched ─► oldest batch ─► claim    │
//!   │  terminated run? ─► TERMINATED                       │
//!   │  publish BatchReady (joins: process inline)          │
//!   └──────────────────────────┬───────────────────────────┘
//!                              │ trigger / poll
//!   ┌──────────────────────────▼───────────────────────────┐
//!   │ process   permit + lock(stream, node, "request-ready")│
//!   │  PENDING, dispatched ─► select (batch/group/cohort)  │
//!   │  introduce_to_process ─► READY @ node                │
//!   │  validator rejects ─► block holding set              │
//!   └──────────────────────────┬───────────────────────────┘
//!                              │ spawned task
//!   ┌──────────────────────────▼───────────────────────────┐
//!   │ execute ─► transform ─► after-process                │
//!   │  outputs NEW @ node (or END when terminal)           │
//!   │  enqueue dispatch ─► publisher                       │
//!   └──────────────────────────────────────────────────────┘
//! ```
//!
//! Both phases hold a lock keyed by `(stream, node, operation)`, so several runtimes
//! sharing one repository and lock manager never claim the same batch twice.

use flowkernel_store::{BatchReady, Context, ContextStatus, LockKey, END};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::block::Block;
use crate::edge::PredicateFn;
use crate::error::{BoxError, Result};
use crate::hooks::{deliver_failure, FailureOutcome, FlowEvent, NodeFailure, NodeHooks, RetryHandle, SharedError};
use crate::node::{NodeId, Role, Transform};
use crate::parallel::{self, Eligibility};
use crate::runtime::Kernel;

pub(crate) const PRE_PROCESS: &str = "pre-process";
pub(crate) const REQUEST_READY: &str = "request-ready";

/// How the processing phase runs a claimed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drive {
    /// On the caller's task
    Inline,
    /// On a spawned task holding the permit
    Spawned,
}

/// Result of one pre-processing pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PreProcess {
    /// Nothing pending
    Idle,
    /// Work appeared while checking; run again without sleeping
    Retrigger,
    /// A batch was claimed
    Claimed(usize),
    /// A batch of a terminated run was suppressed
    Terminated(usize),
}

/// Result of one processing pass
#[derive(Debug, Clone)]
pub(crate) enum Processed {
    /// Concurrency budget exhausted
    Busy,
    /// Nothing selectable
    Idle,
    /// Every ready item went to the block
    Held(usize),
    /// A batch was handed to a spawned task
    Submitted(usize),
    /// A batch ran inline
    Executed(ExecutionOutcome),
}

/// Result of running a transform on a batch
#[derive(Debug, Clone)]
pub(crate) enum ExecutionOutcome {
    /// Null singleton, nothing produced
    Idle,
    /// Successful hop
    Produced(usize),
    /// Transform failure
    Failed(FailureOutcome),
}

/// Incoming side of a node
pub struct Subscriber {
    node_id: NodeId,
    stream_id: String,
    role: Role,
    transform: Transform,
    upstream: RwLock<Vec<String>>,
    validator: RwLock<Option<PredicateFn>>,
    block: RwLock<Option<Arc<Block>>>,
    permits: Arc<Semaphore>,
    wake: Notify,
    slot_freed: Notify,
    hooks: NodeHooks,
}

impl Subscriber {
    pub(crate) fn new(
        node_id: NodeId,
        stream_id: String,
        role: Role,
        transform: Transform,
        concurrency: usize,
    ) -> Self {
        Self {
            node_id,
            stream_id,
            role,
            transform,
            upstream: RwLock::new(Vec::new()),
            validator: RwLock::new(None),
            block: RwLock::new(None),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            wake: Notify::new(),
            slot_freed: Notify::new(),
            hooks: NodeHooks::default(),
        }
    }

    /// Role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Ids of edges feeding this node
    pub fn upstream(&self) -> Vec<String> {
        self.upstream.read().clone()
    }

    /// Validator block, if any
    pub fn block(&self) -> Option<Arc<Block>> {
        self.block.read().clone()
    }

    /// Free execution slots
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) fn hooks(&self) -> &NodeHooks {
        &self.hooks
    }

    pub(crate) fn add_upstream(&self, edge_id: String) {
        self.upstream.write().push(edge_id);
    }

    pub(crate) fn set_validator(&self, accept: PredicateFn, block: Arc<Block>) {
        *self.validator.write() = Some(accept);
        *self.block.write() = Some(block);
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn woken(&self) -> &Notify {
        &self.wake
    }

    pub(crate) fn slot_freed(&self) -> &Notify {
        &self.slot_freed
    }

    fn inbound_positions(&self) -> Vec<String> {
        let mut positions = self.upstream();
        positions.push(self.node_id.clone());
        positions
    }

    fn lock_key(&self, operation: &str) -> LockKey {
        LockKey::new(&self.stream_id, &self.node_id, operation)
    }

    /// Claim the oldest pending batch
    pub(crate) async fn pre_process(self: &Arc<Self>, kernel: &Arc<Kernel>) -> Result<PreProcess> {
        let inbound = self.inbound_positions();
        let guard = kernel.locks.acquire(&self.lock_key(PRE_PROCESS)).await?;

        let pending: Vec<Context> = kernel
            .repo
            .find_contexts(&self.stream_id, &inbound, ContextStatus::Pending)
            .await?
            .into_iter()
            .filter(|c| !c.dispatched)
            .collect();
        let group = select_batch(pending);

        if group.is_empty() {
            drop(guard);
            let raced = kernel
                .repo
                .find_contexts(&self.stream_id, &inbound, ContextStatus::Pending)
                .await?
                .iter()
                .any(|c| !c.dispatched && c.parallel_id.is_none());
            return Ok(if raced {
                PreProcess::Retrigger
            } else {
                PreProcess::Idle
            });
        }

        let traces = trace_ids(&group);
        if kernel.repo.is_terminated(&traces).await? {
            let terminated: Vec<Context> = group
                .into_iter()
                .map(|c| c.with_status(ContextStatus::Terminated))
                .collect();
            kernel.repo.save_contexts(&terminated).await?;
            drop(guard);
            kernel.rebind_windows(&terminated, &[]).await?;
            kernel.settle(&traces).await?;
            tracing::debug!(node = %self.node_id, count = terminated.len(), "Suppressed batch of terminated run");
            return Ok(PreProcess::Terminated(terminated.len()));
        }

        let batch = group.first().and_then(|c| c.batch_id.clone());
        let ids: Vec<String> = group.iter().map(|c| c.id.clone()).collect();
        let claimed = kernel.repo.mark_dispatched(&ids).await?;
        drop(guard);
        if claimed == 0 {
            return Ok(PreProcess::Idle);
        }

        tracing::debug!(
            node = %self.node_id,
            stream = %self.stream_id,
            batch = ?batch,
            count = claimed,
            "Claimed batch"
        );

        if self.role.is_join() {
            while let Processed::Executed(_) = self.process(kernel, Drive::Inline).await? {}
        } else {
            kernel
                .messenger
                .publish(BatchReady::new(&self.stream_id, &self.node_id, batch))
                .await?;
        }
        Ok(PreProcess::Claimed(claimed))
    }

    /// Select, introduce and start executing one ready set
    pub(crate) async fn process(self: &Arc<Self>, kernel: &Arc<Kernel>, drive: Drive) -> Result<Processed> {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return Ok(Processed::Busy);
        };

        let ready = {
            let _guard = kernel.locks.acquire(&self.lock_key(REQUEST_READY)).await?;
            let dispatched: Vec<Context> = kernel
                .repo
                .find_contexts(&self.stream_id, &self.inbound_positions(), ContextStatus::Pending)
                .await?
                .into_iter()
                .filter(|c| c.dispatched)
                .collect();
            if dispatched.is_empty() {
                return Ok(Processed::Idle);
            }
            let candidates = self.select_candidates(kernel, dispatched).await?;
            self.introduce_to_process(kernel, candidates).await?
        };
        if ready.is_empty() {
            return Ok(Processed::Idle);
        }

        let (ready, held) = self.apply_validator(kernel, ready);
        if ready.is_empty() {
            return Ok(Processed::Held(held));
        }

        match drive {
            Drive::Inline => {
                let outcome = self.execute(kernel, ready).await?;
                drop(permit);
                Ok(Processed::Executed(outcome))
            }
            Drive::Spawned => {
                let count = ready.len();
                let subscriber = self.clone();
                let kernel = kernel.clone();
                tokio::spawn(async move {
                    if let Err(e) = subscriber.execute(&kernel, ready).await {
                        tracing::warn!(node = %subscriber.node_id, error = %e, "Batch execution aborted");
                    }
                    drop(permit);
                    subscriber.slot_freed.notify_one();
                });
                Ok(Processed::Submitted(count))
            }
        }
    }

    async fn select_candidates(&self, kernel: &Arc<Kernel>, dispatched: Vec<Context>) -> Result<Vec<Context>> {
        let branches = self.upstream.read().len();
        match self.role {
            Role::Join(mode) => Ok(parallel::select_join_group(mode, branches, dispatched)),
            Role::Accumulate => select_cohort(kernel, dispatched).await,
            _ => Ok(select_batch(dispatched)),
        }
    }

    /// Drop decided EITHER items and mark the rest `Ready` at this node
    ///
    /// Runs under the request-ready lock, so a join claims its EITHER race here.
    async fn introduce_to_process(&self, kernel: &Arc<Kernel>, candidates: Vec<Context>) -> Result<Vec<Context>> {
        let mut decided = HashMap::new();
        let mut ready = Vec::with_capacity(candidates.len());
        let mut dropped = Vec::new();
        for ctx in candidates {
            match parallel::eligibility(kernel.repo.as_ref(), &ctx, &mut decided).await? {
                Eligibility::Eligible => {
                    let mut ctx = ctx.with_status(ContextStatus::Ready);
                    if self.role.is_join() {
                        parallel::reserve(kernel.repo.as_ref(), &mut ctx, &mut decided).await?;
                    }
                    ctx.position = self.node_id.clone();
                    ctx.stream_id = self.stream_id.clone();
                    ready.push(ctx);
                }
                Eligibility::Decided => dropped.push(ctx.with_status(ContextStatus::Archived)),
            }
        }

        kernel.repo.save_contexts(&ready).await?;
        if !dropped.is_empty() {
            kernel.repo.save_contexts(&dropped).await?;
            kernel.rebind_windows(&dropped, &[]).await?;
            kernel.settle(&trace_ids(&dropped)).await?;
            tracing::debug!(node = %self.node_id, count = dropped.len(), "Archived items of a decided race");
        }
        Ok(ready)
    }

    /// Split a ready set into items to execute and items suspended at the block
    fn apply_validator(&self, kernel: &Arc<Kernel>, ready: Vec<Context>) -> (Vec<Context>, usize) {
        let Some(accept) = self.validator.read().clone() else {
            return (ready, 0);
        };
        let Some(block) = self.block() else {
            return (ready, 0);
        };

        let (accepted, rejected): (Vec<Context>, Vec<Context>) =
            ready.into_iter().partition(|c| accept(&c.payload));
        let held = block.hold(rejected);
        if held > 0 {
            tracing::info!(node = %self.node_id, event_id = %block.event_id(), count = held, "Suspended items");
            kernel.emit(FlowEvent::BatchHeld {
                event_id: block.event_id().to_string(),
                count: held,
            });
        }
        (accepted, held)
    }

    /// Run the transform over a ready batch
    pub(crate) async fn execute(&self, kernel: &Arc<Kernel>, batch: Vec<Context>) -> Result<ExecutionOutcome> {
        if batch.len() == 1 && batch[0].is_idle() {
            let archived: Vec<Context> = batch
                .into_iter()
                .map(|c| c.with_status(ContextStatus::Archived))
                .collect();
            kernel.repo.save_contexts(&archived).await?;
            kernel.rebind_windows(&archived, &[]).await?;
            kernel.settle(&trace_ids(&archived)).await?;
            return Ok(ExecutionOutcome::Idle);
        }

        let result = self.apply(&batch).await;

        match result {
            Ok(produced) => {
                let count = self.after_process(kernel, batch, produced).await?;
                Ok(ExecutionOutcome::Produced(count))
            }
            Err(error) => {
                let outcome = self.fail(kernel, batch, Arc::from(error)).await?;
                Ok(ExecutionOutcome::Failed(outcome))
            }
        }
    }

    async fn apply(&self, batch: &[Context]) -> std::result::Result<Vec<Context>, BoxError> {
        match &self.transform {
            Transform::Map(f) => {
                let mut produced = Vec::with_capacity(batch.len());
                for ctx in batch {
                    let value = f(ctx.payload.clone()).await?;
                    produced.push(ctx.generate(value, self.node_id.clone()));
                }
                Ok(produced)
            }
            Transform::Produce(f) => {
                let values = f(batch.iter().map(|c| c.payload.clone()).collect()).await?;
                Ok(match batch.first() {
                    Some(first) => values
                        .into_iter()
                        .map(|v| first.generate(v, self.node_id.clone()))
                        .collect(),
                    None => Vec::new(),
                })
            }
        }
    }

    async fn fail(&self, kernel: &Arc<Kernel>, batch: Vec<Context>, error: SharedError) -> Result<FailureOutcome> {
        let failed: Vec<Context> = batch
            .into_iter()
            .map(|c| c.with_status(ContextStatus::Error))
            .collect();
        kernel.repo.save_contexts(&failed).await?;
        kernel.rebind_windows(&failed, &[]).await?;

        let traces = trace_ids(&failed);
        let failure = NodeFailure::new(
            self.node_id.clone(),
            error.clone(),
            RetryHandle::new(
                Arc::downgrade(kernel),
                self.node_id.clone(),
                self.stream_id.clone(),
                failed,
            ),
        );
        let outcome = deliver_failure(self.hooks.error_handler(), kernel.global_error_handler(), &failure);
        match &outcome {
            FailureOutcome::Handled => {
                tracing::warn!(node = %self.node_id, error = %error, "Transform failed, delivered to handler");
            }
            FailureOutcome::Unhandled(_) => {
                tracing::error!(node = %self.node_id, error = %error, "Transform failed with no error handler");
            }
        }
        kernel.emit(FlowEvent::BatchFailed {
            node: self.node_id.clone(),
            error: error.to_string(),
            outcome: outcome.clone(),
        });
        kernel.settle(&traces).await?;
        Ok(outcome)
    }

    /// Persist a successful hop and queue its outputs for dispatch
    async fn after_process(
        &self,
        kernel: &Arc<Kernel>,
        mut consumed: Vec<Context>,
        mut produced: Vec<Context>,
    ) -> Result<usize> {
        let bridge = consumed
            .iter()
            .find_map(|c| c.to_batch.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let traces: BTreeSet<String> = consumed
            .iter()
            .flat_map(|c| c.trace_ids.iter().cloned())
            .collect();
        let trace_list: Vec<String> = traces.iter().cloned().collect();

        for ctx in consumed.iter_mut() {
            ctx.to_batch = Some(bridge.clone());
            ctx.status = ContextStatus::Archived;
        }
        for ctx in produced.iter_mut() {
            ctx.batch_id = Some(bridge.clone());
            ctx.trace_ids = traces.clone();
            ctx.lineage = Some(self.node_id.clone());
            ctx.stream_id = self.stream_id.clone();
        }

        match self.role {
            Role::Parallel(mode) => parallel::stamp_fan_out(&mut produced, mode),
            Role::Join(_) => {
                let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for ctx in consumed.iter_mut() {
                    if let Some(group) = &ctx.parallel_id {
                        groups.entry(group.clone()).or_default().push(ctx.id.clone());
                        ctx.joined = true;
                    }
                }
                for (group, ids) in &groups {
                    kernel.repo.mark_joined(group, ids).await?;
                }
                for ctx in produced.iter_mut() {
                    ctx.clear_parallel();
                }
            }
            _ => {}
        }

        let terminated = kernel.repo.is_terminated(&trace_list).await?;
        let terminal = kernel.is_terminal(&self.node_id);

        if self.role == Role::Accumulate {
            kernel.rebind_windows(&consumed, &[]).await?;
            let windows: BTreeSet<String> = consumed.iter().filter_map(|c| c.window.clone()).collect();
            let mut fired = windows.is_empty();
            for window in &windows {
                if kernel.repo.fire_window(window).await? {
                    fired = true;
                }
            }
            if !fired {
                tracing::debug!(node = %self.node_id, "Window already fired, discarding outputs");
                produced.clear();
            }
            for ctx in produced.iter_mut() {
                ctx.window = None;
            }
        } else if terminated || terminal {
            kernel.rebind_windows(&consumed, &[]).await?;
        } else {
            kernel.rebind_windows(&consumed, &produced).await?;
        }

        let forward = !terminated && !terminal && !produced.is_empty();
        for ctx in produced.iter_mut() {
            if terminated {
                ctx.status = ContextStatus::Terminated;
            } else if terminal {
                ctx.status = ContextStatus::Archived;
                ctx.position = END.to_string();
                ctx.dispatched = true;
            } else {
                ctx.status = ContextStatus::New;
            }
        }

        kernel.repo.save_contexts(&produced).await?;
        if forward {
            let ids: Vec<String> = produced.iter().map(|c| c.id.clone()).collect();
            kernel.repo.register_in_pool(&trace_list, &ids).await?;
        }
        kernel.repo.save_contexts(&consumed).await?;

        self.hooks.complete(&produced);
        if forward {
            kernel.enqueue_dispatch(&self.node_id, Some(bridge.clone()));
        }
        self.hooks.notify_listeners(&produced);
        kernel.settle(&trace_list).await?;

        tracing::debug!(
            node = %self.node_id,
            batch = %bridge,
            consumed = consumed.len(),
            count = produced.len(),
            terminal,
            "Completed batch"
        );
        kernel.emit(FlowEvent::BatchCompleted {
            node: self.node_id.clone(),
            batch_id: Some(bridge),
            consumed: consumed.len(),
            produced: produced.len(),
        });
        Ok(produced.len())
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .field("upstream", &self.upstream.read().len())
            .field("permits", &self.permits.available_permits())
            .finish()
    }
}

/// Every context sharing the batch id of the oldest one
pub(crate) fn select_batch(items: Vec<Context>) -> Vec<Context> {
    let Some(batch) = items.first().map(|c| c.batch_id.clone()) else {
        return Vec::new();
    };
    items.into_iter().filter(|c| c.batch_id == batch).collect()
}

/// First window cohort whose outstanding items are all present
async fn select_cohort(kernel: &Arc<Kernel>, items: Vec<Context>) -> Result<Vec<Context>> {
    let mut order: Vec<Option<String>> = Vec::new();
    let mut cohorts: HashMap<Option<String>, Vec<Context>> = HashMap::new();
    for ctx in items {
        if !cohorts.contains_key(&ctx.window) {
            order.push(ctx.window.clone());
        }
        cohorts.entry(ctx.window.clone()).or_default().push(ctx);
    }

    for window in order {
        let Some(members) = cohorts.remove(&window) else {
            continue;
        };
        let Some(window_id) = window else {
            return Ok(select_batch(members));
        };
        match kernel.repo.get_window(&window_id).await? {
            Some(token) if token.is_covered_by(members.iter().map(|c| &c.id)) => return Ok(members),
            Some(_) => continue,
            None => return Ok(members),
        }
    }
    Ok(Vec::new())
}

pub(crate) fn trace_ids(contexts: &[Context]) -> Vec<String> {
    contexts
        .iter()
        .flat_map(|c| c.trace_ids.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
