//! Nodes and the chain-building API
//!
//! A [`Node`] is an addressable vertex composed of a [`Publisher`] (outgoing edges,
//! ingestion, dispatch) and a [`Subscriber`] (claiming, executing, persisting). Every
//! node has a [`Role`] deciding how it selects batches and what it does to its outputs:
//!
//! | Role | Transform | Selection | Outputs |
//! |------|-----------|-----------|---------|
//! | `Map` | one value per input | oldest batch | broadcast |
//! | `Produce` | whole batch to many values | oldest batch | broadcast |
//! | `Conditions` | pass-through | oldest batch | first matching edge |
//! | `Parallel` | pass-through | oldest batch | tagged with a fresh group, broadcast |
//! | `Join` | whole group to values | parallel groups | group stripped |
//! | `Accumulate` | whole cohort to values | window cohorts | only when the window fires |
//! | `Block` | pass-through | oldest batch | held until resumed |
//!
//! Graphs are declared through [`NodeRef`] handles:
//!
//! ```rust,ignore
//! let flow = runtime.flow("orders");
//! let parse = flow.map("parse", |v| Ok(v));
//! let route = parse.conditions("route");
//! route.when(|v| v["priority"] == "high").map("expedite", expedite).close();
//! route.when(|_| true).map("standard", standard).close();
//! ```

use flowkernel_store::{Context, ParallelMode};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::block::{Block, BlockKind};
use crate::conditions::Routing;
use crate::edge::{EdgeOptions, PredicateFn, Subscription};
use crate::error::{BoxError, Result};
use crate::hooks::{CompletionFn, ErrorHandler, ListenerFn, NodeFailure};
use crate::publisher::Publisher;
use crate::runtime::Runtime;
use crate::subscriber::Subscriber;

/// Node identifier, `"{stream}:{name}"`
pub type NodeId = String;

/// Future returned by a transform
pub type TransformFuture<T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, BoxError>> + Send>>;

/// One value in, one value out
pub type MapFn = Arc<dyn Fn(Value) -> TransformFuture<Value> + Send + Sync>;

/// A whole batch in, any number of values out
pub type ProduceFn = Arc<dyn Fn(Vec<Value>) -> TransformFuture<Vec<Value>> + Send + Sync>;

/// User function applied by a node
#[derive(Clone)]
pub enum Transform {
    /// Mapping transform
    Map(MapFn),
    /// Producing transform
    Produce(ProduceFn),
}

impl Transform {
    /// Pass values through unchanged
    pub fn identity() -> Self {
        Self::Map(Arc::new(|value: Value| -> TransformFuture<Value> {
            Box::pin(async move { Ok(value) })
        }))
    }

    /// Synchronous mapping transform
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self::Map(Arc::new(move |value: Value| -> TransformFuture<Value> {
            let out = f(value);
            Box::pin(async move { out })
        }))
    }

    /// Asynchronous mapping transform
    pub fn map_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        Self::Map(Arc::new(move |value: Value| -> TransformFuture<Value> {
            Box::pin(f(value))
        }))
    }

    /// Synchronous producing transform
    pub fn produce<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, BoxError> + Send + Sync + 'static,
    {
        Self::Produce(Arc::new(move |values: Vec<Value>| -> TransformFuture<Vec<Value>> {
            let out = f(values);
            Box::pin(async move { out })
        }))
    }

    /// Asynchronous producing transform
    pub fn produce_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<Value>, BoxError>> + Send + 'static,
    {
        Self::Produce(Arc::new(move |values: Vec<Value>| -> TransformFuture<Vec<Value>> {
            Box::pin(f(values))
        }))
    }

    /// Producing transform that folds a batch into one value
    pub fn reduce<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self::produce(move |values| f(values).map(|v| vec![v]))
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(_) => f.write_str("Transform::Map"),
            Self::Produce(_) => f.write_str("Transform::Produce"),
        }
    }
}

/// What a node does with its batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Mapping node
    Map,
    /// Producing node
    Produce,
    /// Exclusive router
    Conditions,
    /// Fan-out
    Parallel(ParallelMode),
    /// Fan-in
    Join(ParallelMode),
    /// Window accumulator
    Accumulate,
    /// Suspends every item
    Block,
}

impl Role {
    pub(crate) fn routing(&self) -> Routing {
        match self {
            Self::Conditions => Routing::Exclusive,
            _ => Routing::Broadcast,
        }
    }

    pub(crate) fn is_join(&self) -> bool {
        matches!(self, Self::Join(_))
    }
}

/// A vertex of the graph
pub struct Node {
    id: NodeId,
    name: String,
    stream: String,
    publisher: Publisher,
    subscriber: Arc<Subscriber>,
    closed: AtomicBool,
    launched: AtomicBool,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        stream: String,
        role: Role,
        transform: Transform,
        concurrency: usize,
    ) -> Self {
        Self {
            publisher: Publisher::new(id.clone(), stream.clone(), role.routing()),
            subscriber: Arc::new(Subscriber::new(
                id.clone(),
                stream.clone(),
                role,
                transform,
                concurrency,
            )),
            id,
            name,
            stream,
            closed: AtomicBool::new(false),
            launched: AtomicBool::new(false),
        }
    }

    /// Node id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name within the stream
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning stream
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Role
    pub fn role(&self) -> Role {
        self.subscriber.role()
    }

    /// Outgoing side
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Incoming side
    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Whether the node was explicitly closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether outputs of this node are final results
    pub fn is_terminal(&self) -> bool {
        self.is_closed() || self.publisher.edges().is_empty()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns `true` the first time it is called
    pub(crate) fn mark_launched(&self) -> bool {
        !self.launched.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("role", &self.role())
            .field("edges", &self.publisher.edges().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle used to declare a graph around one node
#[derive(Clone)]
pub struct NodeRef {
    node: Arc<Node>,
    runtime: Runtime,
}

impl NodeRef {
    pub(crate) fn new(node: Arc<Node>, runtime: Runtime) -> Self {
        Self { node, runtime }
    }

    /// Node id
    pub fn id(&self) -> &str {
        self.node.id()
    }

    /// The node itself
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn attach(&self, name: &str, role: Role, transform: Transform, options: EdgeOptions) -> NodeRef {
        let target = self
            .runtime
            .kernel()
            .add_node(self.node.stream(), name, role, transform);
        self.runtime.kernel().connect(&self.node, &target, options);
        NodeRef::new(target, self.runtime.clone())
    }

    /// Downstream mapping node
    pub fn map<F>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Value) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.attach(name, Role::Map, Transform::map(f), EdgeOptions::new())
    }

    /// Downstream asynchronous mapping node
    pub fn map_async<F, Fut>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        self.attach(name, Role::Map, Transform::map_async(f), EdgeOptions::new())
    }

    /// Downstream producing node
    pub fn produce<F>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, BoxError> + Send + Sync + 'static,
    {
        self.attach(name, Role::Produce, Transform::produce(f), EdgeOptions::new())
    }

    /// Downstream node with an explicit role and transform
    pub fn with_transform(&self, name: &str, role: Role, transform: Transform) -> NodeRef {
        self.attach(name, role, transform, EdgeOptions::new())
    }

    /// Downstream exclusive router
    pub fn conditions(&self, name: &str) -> NodeRef {
        self.attach(name, Role::Conditions, Transform::identity(), EdgeOptions::new())
    }

    /// Downstream fan-out
    pub fn parallel(&self, name: &str, mode: ParallelMode) -> NodeRef {
        self.attach(name, Role::Parallel(mode), Transform::identity(), EdgeOptions::new())
    }

    /// Downstream fan-in folding each group into one value
    ///
    /// Connect the other branches with [`NodeRef::to`].
    pub fn join<F>(&self, name: &str, mode: ParallelMode, f: F) -> NodeRef
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.attach(name, Role::Join(mode), Transform::reduce(f), EdgeOptions::new())
    }

    /// Downstream accumulator folding each window cohort into one value
    pub fn accumulate<F>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.attach(name, Role::Accumulate, Transform::reduce(f), EdgeOptions::new())
    }

    /// Downstream node suspending every item until resumed under `event_id`
    pub fn block(&self, event_id: &str) -> NodeRef {
        let next = self.attach(event_id, Role::Block, Transform::identity(), EdgeOptions::new());
        next.install_validator(event_id, Arc::new(|_: &Value| false));
        next
    }

    /// Hold items rejected by `accept` in a block with `event_id`
    pub fn validate<F>(&self, event_id: &str, accept: F) -> &Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.install_validator(event_id, Arc::new(accept));
        self
    }

    fn install_validator(&self, event_id: &str, accept: PredicateFn) {
        let block = Arc::new(Block::new(
            event_id,
            self.node.id().to_string(),
            self.node.stream().to_string(),
            BlockKind::Validator,
            Arc::downgrade(self.runtime.kernel()),
        ));
        self.node.subscriber().set_validator(accept, block);
    }

    /// Edge to an existing node
    pub fn to(&self, target: &NodeRef) -> Arc<Subscription> {
        self.subscribe(target, EdgeOptions::new())
    }

    /// Conditional edge to an existing node
    pub fn to_when<F>(&self, target: &NodeRef, whether: F) -> Arc<Subscription>
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.subscribe(target, EdgeOptions::new().when(whether))
    }

    /// Edge to an existing node whose matched items wait in a block until resumed
    ///
    /// The block is reachable through [`Subscription::block`] or
    /// [`Runtime::get_block`](crate::Runtime::get_block).
    pub fn to_blocked(&self, target: &NodeRef, event_id: &str) -> Arc<Subscription> {
        self.subscribe(target, EdgeOptions::new().blocked(event_id))
    }

    /// Edge with explicit options
    pub fn subscribe(&self, target: &NodeRef, options: EdgeOptions) -> Arc<Subscription> {
        self.runtime.kernel().connect(&self.node, &target.node, options)
    }

    /// Start a conditional branch
    pub fn when<F>(&self, whether: F) -> Branch
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Branch {
            source: self.clone(),
            options: EdgeOptions::new().when(whether),
        }
    }

    /// Mark outputs of this node as final results
    pub fn close(&self) -> &Self {
        self.node.close();
        self
    }

    /// Handle failures of this node
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(&NodeFailure) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.node.subscriber().hooks().set_error_handler(handler);
        self
    }

    /// Observe every produced batch
    pub fn on_complete<F>(&self, callback: F) -> &Self
    where
        F: Fn(&[Context]) + Send + Sync + 'static,
    {
        let callback: CompletionFn = Arc::new(callback);
        self.node.subscriber().hooks().add_completion(callback);
        self
    }

    /// Observe every produced value
    pub fn register<F>(&self, listener: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let listener: ListenerFn = Arc::new(listener);
        self.node.subscriber().hooks().add_listener(listener);
        self
    }

    /// The node's validator block, if any
    pub fn block_handle(&self) -> Option<Arc<Block>> {
        self.node.subscriber().block()
    }

    /// Redeliver already produced contexts through this node's edges
    pub async fn offer(&self, contexts: Vec<Context>) -> Result<usize> {
        self.node.publisher().offer(self.runtime.kernel(), contexts).await
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.node.id()).finish()
    }
}

/// A conditional edge waiting for its target
pub struct Branch {
    source: NodeRef,
    options: EdgeOptions,
}

impl Branch {
    /// Convert payloads crossing the edge
    pub fn convert<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.options = self.options.convert(f);
        self
    }

    /// Connect to an existing node
    pub fn to(self, target: &NodeRef) -> Arc<Subscription> {
        self.source.subscribe(target, self.options)
    }

    /// Connect to a new mapping node
    pub fn map<F>(self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Value) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.source.attach(name, Role::Map, Transform::map(f), self.options)
    }

    /// Connect to a new producing node
    pub fn produce<F>(self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, BoxError> + Send + Sync + 'static,
    {
        self.source
            .attach(name, Role::Produce, Transform::produce(f), self.options)
    }
}
