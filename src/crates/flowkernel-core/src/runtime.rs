//! Runtime - owns collaborators, nodes, loops and the dispatch queue
//!
//! A [`Runtime`] is the execution environment of one or more flows. It owns:
//!
//! - the collaborators ([`Repository`], [`LockManager`], [`Messenger`])
//! - the node registry
//! - two loop tasks per node (pre-process and process)
//! - one dispatcher task draining the dispatch queue
//! - the runtime-wide error handler and the lifecycle event channel
//!
//! ```text
//!   Flow::start ──► entry publisher ──► PENDING
//!                                         │
//!        ┌────────────── node loops ──────┘
//!        ▼
//!   pre-process ─► messenger ─► process ─► spawned execute
//!                                              │ after-process
//!                                              ▼
//!                               dispatch queue (trampoline)
//!                                              │
//!                                  dispatcher ─► publisher.offer ─► next node
//! ```
//!
//! Several runtimes built over clones of the same collaborators cooperate on the same
//! graph: each claims batches under the shared locks, so every item is processed once.
//!
//! # Example
//!
//! ```rust
//! use flowkernel_core::Runtime;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::builder().build()?;
//!     let flow = runtime.flow("numbers");
//!     flow.map("inc", |v| Ok(json!(v.as_i64().unwrap_or(0) + 1)))
//!         .map("double", |v| Ok(json!(v.as_i64().unwrap_or(0) * 2)));
//!
//!     let trace = flow.start(vec![json!(10)], None).await?;
//!     runtime.wait_settled(&trace, Duration::from_secs(5)).await?;
//!     assert_eq!(flow.values(&trace).await?, vec![json!(22)]);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use flowkernel_store::{
    Context, ContextStatus, InMemoryLockManager, InMemoryMessenger, InMemoryRepository,
    LockManager, Messenger, Repository, Trace, TraceStatus, TriggerStream,
};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::block::{Block, BlockKind};
use crate::config::RuntimeConfig;
use crate::edge::{edge_id, EdgeOptions, Subscription};
use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::hooks::{ErrorHandler, FlowEvent, NodeFailure};
use crate::node::{Node, NodeId, NodeRef, Role, Transform};
use crate::subscriber::{Drive, PreProcess, Processed};

/// Work item of the dispatch queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Dispatch {
    pub(crate) node: NodeId,
    pub(crate) batch: Option<String>,
}

/// Shared state behind a [`Runtime`]
pub(crate) struct Kernel {
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) config: RuntimeConfig,
    nodes: RwLock<BTreeMap<NodeId, Arc<Node>>>,
    entries: RwLock<HashMap<String, NodeId>>,
    global_error: RwLock<Option<ErrorHandler>>,
    events: broadcast::Sender<FlowEvent>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<Dispatch>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Nodes whose queued outputs the dispatcher gave up on
    stranded: Mutex<BTreeSet<NodeId>>,
}

impl Kernel {
    pub(crate) fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(id).cloned()
    }

    pub(crate) fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Entry node of a stream
    pub(crate) fn entry(&self, stream: &str) -> Option<Arc<Node>> {
        let id = self.entries.read().get(stream).cloned()?;
        self.node(&id)
    }

    pub(crate) fn set_entry(&self, stream: &str, id: &str, replace: bool) {
        let mut entries = self.entries.write();
        if replace || !entries.contains_key(stream) {
            entries.insert(stream.to_string(), id.to_string());
        }
    }

    pub(crate) fn is_terminal(&self, id: &str) -> bool {
        self.node(id).map_or(true, |n| n.is_terminal())
    }

    pub(crate) fn global_error_handler(&self) -> Option<ErrorHandler> {
        self.global_error.read().clone()
    }

    pub(crate) fn emit(&self, event: FlowEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn wake(&self, id: &str) {
        if let Some(node) = self.node(id) {
            node.subscriber().wake();
        }
    }

    pub(crate) fn enqueue_dispatch(&self, node: &str, batch: Option<String>) {
        let item = Dispatch {
            node: node.to_string(),
            batch,
        };
        if self.dispatch_tx.send(item).is_err() {
            tracing::warn!(node = %node, "Dispatch queue closed");
        }
    }

    /// Register a node, suffixing the id when the name is taken
    pub(crate) fn add_node(
        self: &Arc<Self>,
        stream: &str,
        name: &str,
        role: Role,
        transform: Transform,
    ) -> Arc<Node> {
        let mut nodes = self.nodes.write();
        let base = format!("{}:{}", stream, name);
        let mut id = base.clone();
        let mut n = 0;
        while nodes.contains_key(&id) {
            n += 1;
            id = format!("{}#{}", base, n);
        }
        let node = Arc::new(Node::new(
            id.clone(),
            name.to_string(),
            stream.to_string(),
            role,
            transform,
            self.config.concurrency,
        ));
        nodes.insert(id, node.clone());
        node
    }

    /// Connect two nodes
    pub(crate) fn connect(
        self: &Arc<Self>,
        source: &Arc<Node>,
        target: &Arc<Node>,
        options: EdgeOptions,
    ) -> Arc<Subscription> {
        let id = edge_id(
            source.id(),
            target.id(),
            source.publisher().edges_to(target.id()),
        );
        let block = options.block_event.map(|event_id| {
            Arc::new(Block::new(
                event_id,
                target.id().to_string(),
                target.stream().to_string(),
                BlockKind::Filter { edge: id.clone() },
                Arc::downgrade(self),
            ))
        });
        let edge = Subscription::new(
            id.clone(),
            source.id().to_string(),
            target.id().to_string(),
            target.stream().to_string(),
            options.convert,
            options.whether,
            block,
        );
        target.subscriber().add_upstream(id);
        source.publisher().subscribe(edge)
    }

    /// Replace contexts by their successors in every window involved
    pub(crate) async fn rebind_windows(&self, removed: &[Context], added: &[Context]) -> Result<()> {
        let mut changes: BTreeMap<String, (Vec<String>, Vec<String>)> = BTreeMap::new();
        for ctx in removed {
            if let Some(window) = &ctx.window {
                changes.entry(window.clone()).or_default().0.push(ctx.id.clone());
            }
        }
        for ctx in added {
            if let Some(window) = &ctx.window {
                changes.entry(window.clone()).or_default().1.push(ctx.id.clone());
            }
        }
        for (window, (removed, added)) in changes {
            self.repo.rebind_window(&window, &removed, &added).await?;
        }
        Ok(())
    }

    /// Complete every listed running trace that has no live context left
    pub(crate) async fn settle(&self, trace_ids: &[String]) -> Result<()> {
        for id in trace_ids {
            let contexts = self.repo.find_by_trace(id).await?;
            if contexts.iter().any(|c| c.is_live()) {
                continue;
            }
            let status = if contexts.iter().any(|c| c.status == ContextStatus::Error) {
                TraceStatus::Error
            } else {
                TraceStatus::Ready
            };
            if self.repo.complete_trace(id, status).await? {
                tracing::info!(trace = %id, status = ?status, "Run settled");
                self.emit(FlowEvent::TraceSettled {
                    trace_id: id.clone(),
                    status,
                });
            }
        }
        Ok(())
    }

    /// Put settled (but not terminated) traces back to `Running`
    pub(crate) async fn reopen_traces(&self, trace_ids: &[String]) -> Result<()> {
        for id in trace_ids {
            let Some(mut trace) = self.repo.get_trace(id).await? else {
                continue;
            };
            if matches!(trace.status, TraceStatus::Ready | TraceStatus::Error) {
                trace.status = TraceStatus::Running;
                trace.updated_at = chrono::Utc::now();
                self.repo.save_trace(&trace).await?;
            }
        }
        Ok(())
    }

    /// Enqueue one dispatch per batch of outputs waiting at a node
    async fn requeue_outputs(&self, node: &Node) -> Result<usize> {
        let queued = self
            .repo
            .find_contexts(node.stream(), &[node.id().to_string()], ContextStatus::New)
            .await?;
        let batches: BTreeSet<Option<String>> = queued.iter().map(|c| c.batch_id.clone()).collect();
        for batch in batches {
            self.enqueue_dispatch(node.id(), batch);
        }
        Ok(queued.len())
    }

    pub(crate) fn mark_stranded(&self, node: &str) {
        self.stranded.lock().insert(node.to_string());
    }

    /// Requeue outputs of a node the dispatcher gave up on
    pub(crate) async fn sweep_stranded(&self, node: &Node) {
        if !self.stranded.lock().remove(node.id()) {
            return;
        }
        match self.requeue_outputs(node).await {
            Ok(count) => tracing::info!(node = %node.id(), count, "Requeued stranded outputs"),
            Err(e) => {
                tracing::warn!(node = %node.id(), error = %e, "Sweep of stranded outputs failed");
                self.mark_stranded(node.id());
            }
        }
    }

    /// Reload persisted work of a node after a restart
    async fn recover(&self, node: &Node) -> Result<()> {
        let queued = self.requeue_outputs(node).await?;

        let mut blocks: Vec<Arc<Block>> = node.subscriber().block().into_iter().collect();
        blocks.extend(node.publisher().edges().iter().filter_map(|e| e.block().cloned()));
        let mut reloaded = 0;
        for block in blocks {
            let stream = match block.kind() {
                BlockKind::Validator => node.stream().to_string(),
                BlockKind::Filter { .. } => match self.node(block.node()) {
                    Some(target) => target.stream().to_string(),
                    None => continue,
                },
            };
            let held = self
                .repo
                .find_contexts(&stream, &[block.position().to_string()], ContextStatus::Ready)
                .await?;
            reloaded += block.hold(held);
        }

        if queued > 0 || reloaded > 0 {
            tracing::info!(node = %node.id(), queued, held = reloaded, "Recovered persisted work");
        }
        Ok(())
    }
}

/// Builder for [`Runtime`]
///
/// Collaborators default to the in-memory implementations.
#[derive(Default)]
pub struct RuntimeBuilder {
    repository: Option<Arc<dyn Repository>>,
    locks: Option<Arc<dyn LockManager>>,
    messenger: Option<Arc<dyn Messenger>>,
    config: Option<RuntimeConfig>,
}

impl RuntimeBuilder {
    /// Use a repository
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Use a lock manager
    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Use a messenger
    pub fn messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// Use a configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate the configuration and build the runtime
    pub fn build(self) -> Result<Runtime> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let kernel = Kernel {
            repo: self
                .repository
                .unwrap_or_else(|| Arc::new(InMemoryRepository::new())),
            locks: self
                .locks
                .unwrap_or_else(|| Arc::new(InMemoryLockManager::new())),
            messenger: self
                .messenger
                .unwrap_or_else(|| Arc::new(InMemoryMessenger::new())),
            config,
            nodes: RwLock::new(BTreeMap::new()),
            entries: RwLock::new(HashMap::new()),
            global_error: RwLock::new(None),
            events,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            stranded: Mutex::new(BTreeSet::new()),
        };
        Ok(Runtime {
            kernel: Arc::new(kernel),
        })
    }
}

/// Execution environment for flows
#[derive(Clone)]
pub struct Runtime {
    kernel: Arc<Kernel>,
}

impl Runtime {
    /// Start building a runtime
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// In-memory runtime with the default configuration
    pub fn in_memory() -> Result<Self> {
        Self::builder().build()
    }

    pub(crate) fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Configuration in use
    pub fn config(&self) -> &RuntimeConfig {
        &self.kernel.config
    }

    /// Repository in use
    pub fn repository(&self) -> Arc<dyn Repository> {
        self.kernel.repo.clone()
    }

    /// Declare (or extend) a flow
    pub fn flow(&self, stream: impl Into<String>) -> Flow {
        Flow::new(stream.into(), self.clone())
    }

    /// Registered node
    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.kernel.node(id)
    }

    /// Handle on a registered node, for wiring graphs declared elsewhere
    pub fn node_ref(&self, id: &str) -> Result<NodeRef> {
        self.kernel
            .node(id)
            .map(|node| NodeRef::new(node, self.clone()))
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))
    }

    /// Receive lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.kernel.events.subscribe()
    }

    /// Handle failures not handled (or also handled) by a node
    pub fn on_global_error<F>(&self, handler: F)
    where
        F: Fn(&NodeFailure) + Send + Sync + 'static,
    {
        *self.kernel.global_error.write() = Some(Arc::new(handler));
    }

    /// Recover persisted work and start loops for every node not yet running
    ///
    /// Idempotent; [`Flow::start`] calls it.
    pub async fn launch(&self) -> Result<()> {
        if *self.kernel.shutdown.borrow() {
            return Err(FlowError::Shutdown);
        }

        let receiver = self.kernel.dispatch_rx.lock().take();
        if let Some(receiver) = receiver {
            let handle = tokio::spawn(dispatcher(
                self.kernel.clone(),
                receiver,
                self.kernel.shutdown.subscribe(),
            ));
            self.kernel.tasks.lock().push(handle);
        }

        for node in self.kernel.nodes() {
            if !node.mark_launched() {
                continue;
            }
            self.kernel.recover(&node).await?;
            let triggers = self.kernel.messenger.subscribe(node.id()).await?;

            let pre = tokio::spawn(pre_process_loop(
                self.kernel.clone(),
                node.clone(),
                self.kernel.shutdown.subscribe(),
            ));
            let process = tokio::spawn(process_loop(
                self.kernel.clone(),
                node.clone(),
                triggers,
                self.kernel.shutdown.subscribe(),
            ));
            self.kernel.tasks.lock().extend([pre, process]);
            tracing::debug!(node = %node.id(), instance = %self.kernel.config.instance_id, "Launched node loops");
        }
        Ok(())
    }

    /// Stop every loop and wait for them
    ///
    /// Batches already executing on spawned tasks finish on their own.
    pub async fn shutdown(&self) {
        let _ = self.kernel.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.kernel.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Loop task ended abnormally");
            }
        }
        tracing::info!(instance = %self.kernel.config.instance_id, "Runtime shut down");
    }

    /// Block with the given event id, on a node or on an edge
    pub fn get_block(&self, event_id: &str) -> Option<Arc<Block>> {
        for node in self.kernel.nodes() {
            if let Some(block) = node.subscriber().block() {
                if block.event_id() == event_id {
                    return Some(block);
                }
            }
            for edge in node.publisher().edges() {
                if let Some(block) = edge.block() {
                    if block.event_id() == event_id {
                        return Some(block.clone());
                    }
                }
            }
        }
        None
    }

    /// Release everything held at a block, replacing payloads when `payload` is given
    pub async fn resume(&self, event_id: &str, payload: Option<Value>) -> Result<usize> {
        let block = self
            .get_block(event_id)
            .ok_or_else(|| FlowError::UnknownBlock(event_id.to_string()))?;
        block.resume(|_| true, payload).await
    }

    /// Cooperatively terminate a run
    pub async fn terminate(&self, trace_id: &str) -> Result<()> {
        let ids = [trace_id.to_string()];
        self.kernel.repo.mark_terminated(&ids).await?;

        // Held contexts never reach a checkpoint on their own
        for node in self.kernel.nodes() {
            let mut blocks: Vec<Arc<Block>> = node.subscriber().block().into_iter().collect();
            blocks.extend(node.publisher().edges().iter().filter_map(|e| e.block().cloned()));
            for block in blocks {
                block.release_trace(self.kernel(), trace_id).await?;
            }
            node.subscriber().wake();
        }

        tracing::info!(trace = %trace_id, "Run terminated");
        self.kernel.emit(FlowEvent::TraceTerminated {
            trace_id: trace_id.to_string(),
        });
        Ok(())
    }

    /// Load a run
    pub async fn trace(&self, trace_id: &str) -> Result<Option<Trace>> {
        Ok(self.kernel.repo.get_trace(trace_id).await?)
    }

    /// Poll until a run leaves `Running`
    pub async fn wait_settled(&self, trace_id: &str, timeout: Duration) -> Result<Trace> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(trace) = self.kernel.repo.get_trace(trace_id).await? {
                if trace.is_finished() {
                    return Ok(trace);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlowError::Timeout(format!("run {} still running", trace_id)));
            }
            tokio::time::sleep(Duration::from_millis(self.kernel.config.idle_backoff_ms.min(10))).await;
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("instance_id", &self.kernel.config.instance_id)
            .field("nodes", &self.kernel.nodes.read().len())
            .finish()
    }
}

async fn pre_process_loop(kernel: Arc<Kernel>, node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    let subscriber = node.subscriber().clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        match subscriber.pre_process(&kernel).await {
            Ok(PreProcess::Idle) => kernel.sweep_stranded(&node).await,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(node = %node.id(), error = %e, "Pre-processing failed");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = subscriber.woken().notified() => {}
            _ = tokio::time::sleep(kernel.config.idle_delay()) => {}
        }
    }
}

enum Wake {
    Trigger,
    Closed,
    Other,
}

async fn next_trigger(triggers: &mut Option<TriggerStream>) -> Option<()> {
    match triggers {
        Some(stream) => stream.next().await.map(|_| ()),
        None => std::future::pending().await,
    }
}

async fn process_loop(
    kernel: Arc<Kernel>,
    node: Arc<Node>,
    triggers: TriggerStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let subscriber = node.subscriber().clone();
    let mut triggers = Some(triggers);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match subscriber.process(&kernel, Drive::Spawned).await {
            Ok(Processed::Submitted(_)) | Ok(Processed::Held(_)) => continue,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(node = %node.id(), error = %e, "Processing failed");
            }
        }
        let wake = tokio::select! {
            _ = shutdown.changed() => Wake::Other,
            trigger = next_trigger(&mut triggers) => match trigger {
                Some(()) => Wake::Trigger,
                None => Wake::Closed,
            },
            _ = subscriber.slot_freed().notified() => Wake::Other,
            _ = tokio::time::sleep(kernel.config.idle_delay()) => Wake::Other,
        };
        match wake {
            Wake::Closed => {
                tracing::warn!(node = %node.id(), "Trigger stream closed, polling only");
                triggers = None;
            }
            Wake::Trigger | Wake::Other => {}
        }
    }
}

const MAX_DISPATCH_ATTEMPTS: u32 = 3;

/// Drain the dispatch queue, handing each batch to its node's publisher
async fn dispatcher(
    kernel: Arc<Kernel>,
    mut queue: mpsc::UnboundedReceiver<Dispatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: HashMap<Dispatch, u32> = HashMap::new();
    loop {
        let item = tokio::select! {
            _ = shutdown.changed() => None,
            item = queue.recv() => item,
        };
        let Some(item) = item else {
            break;
        };

        let Some(node) = kernel.node(&item.node) else {
            tracing::warn!(node = %item.node, "Dispatch for unknown node dropped");
            continue;
        };
        match node.publisher().dispatch_batch(&kernel, item.batch.as_deref()).await {
            Ok(count) => {
                failures.remove(&item);
                tracing::debug!(node = %item.node, batch = ?item.batch, count, "Dispatch complete");
            }
            Err(e) => {
                let attempts = failures.entry(item.clone()).or_insert(0);
                *attempts += 1;
                tracing::warn!(node = %item.node, batch = ?item.batch, attempt = *attempts, error = %e, "Dispatch failed");
                if *attempts < MAX_DISPATCH_ATTEMPTS {
                    let kernel = kernel.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(kernel.config.idle_delay()).await;
                        kernel.enqueue_dispatch(&item.node, item.batch);
                    });
                } else {
                    // The outputs stay `New`; the node's idle sweep requeues them
                    failures.remove(&item);
                    kernel.mark_stranded(&item.node);
                }
            }
        }
    }
}
