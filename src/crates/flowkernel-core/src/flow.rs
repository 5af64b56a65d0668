//! Flows - named streams of nodes with an entry point
//!
//! A [`Flow`] is a handle on one stream of a [`Runtime`]. Nodes created directly on the
//! flow belong to its stream; the first one becomes the entry node that
//! [`Flow::start`] offers payloads to (override with [`Flow::set_entry`]). Nodes of
//! different flows can be connected with [`NodeRef::to`]: contexts crossing into another
//! flow keep their origin stream and only travel back to it.

use flowkernel_store::{Context, ContextStatus, ParallelMode, Repository, Session, END};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::error::{BoxError, FlowError, Result};
use crate::node::{NodeRef, Role, Transform};
use crate::runtime::Runtime;

/// Handle on one stream of a runtime
#[derive(Clone)]
pub struct Flow {
    stream: String,
    runtime: Runtime,
}

impl Flow {
    pub(crate) fn new(stream: String, runtime: Runtime) -> Self {
        Self { stream, runtime }
    }

    /// Stream id
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Runtime the flow lives in
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Create a node in this stream
    pub fn node(&self, name: &str, role: Role, transform: Transform) -> NodeRef {
        let kernel = self.runtime.kernel();
        let node = kernel.add_node(&self.stream, name, role, transform);
        kernel.set_entry(&self.stream, node.id(), false);
        NodeRef::new(node, self.runtime.clone())
    }

    /// Mapping node
    pub fn map<F>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Value) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.node(name, Role::Map, Transform::map(f))
    }

    /// Asynchronous mapping node
    pub fn map_async<F, Fut>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        self.node(name, Role::Map, Transform::map_async(f))
    }

    /// Producing node
    pub fn produce<F>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, BoxError> + Send + Sync + 'static,
    {
        self.node(name, Role::Produce, Transform::produce(f))
    }

    /// Exclusive router
    pub fn conditions(&self, name: &str) -> NodeRef {
        self.node(name, Role::Conditions, Transform::identity())
    }

    /// Fan-out
    pub fn parallel(&self, name: &str, mode: ParallelMode) -> NodeRef {
        self.node(name, Role::Parallel(mode), Transform::identity())
    }

    /// Fan-in; connect its branches with [`NodeRef::to`]
    pub fn join<F>(&self, name: &str, mode: ParallelMode, f: F) -> NodeRef
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.node(name, Role::Join(mode), Transform::reduce(f))
    }

    /// Window accumulator
    pub fn accumulate<F>(&self, name: &str, f: F) -> NodeRef
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.node(name, Role::Accumulate, Transform::reduce(f))
    }

    /// Make `node` the entry point
    pub fn set_entry(&self, node: &NodeRef) -> Result<()> {
        if node.node().stream() != self.stream {
            return Err(FlowError::Validation(format!(
                "node '{}' does not belong to flow '{}'",
                node.id(),
                self.stream
            )));
        }
        self.runtime.kernel().set_entry(&self.stream, node.id(), true);
        Ok(())
    }

    /// Entry node
    pub fn entry(&self) -> Option<NodeRef> {
        self.runtime
            .kernel()
            .entry(&self.stream)
            .map(|node| NodeRef::new(node, self.runtime.clone()))
    }

    /// Start a run; returns its trace id once the payloads are persisted
    ///
    /// Launches the runtime if needed. A fresh session is minted when none is given.
    pub async fn start(&self, payloads: Vec<Value>, session: Option<Session>) -> Result<String> {
        let kernel = self.runtime.kernel();
        let entry = kernel.entry(&self.stream).ok_or_else(|| {
            FlowError::Validation(format!("flow '{}' has no nodes", self.stream))
        })?;
        self.runtime.launch().await?;

        let session = session.unwrap_or_default();
        entry
            .publisher()
            .offer_payloads(kernel, payloads, &session)
            .await
    }

    /// Start a run with a single payload
    pub async fn start_one(&self, payload: Value) -> Result<String> {
        self.start(vec![payload], None).await
    }

    /// Terminal outputs of a run, in production order
    pub async fn results(&self, trace_id: &str) -> Result<Vec<Context>> {
        let repo: Arc<dyn Repository> = self.runtime.repository();
        Ok(repo
            .find_by_trace(trace_id)
            .await?
            .into_iter()
            .filter(|c| c.position == END && c.status == ContextStatus::Archived)
            .collect())
    }

    /// Payloads of [`Flow::results`]
    pub async fn values(&self, trace_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .results(trace_id)
            .await?
            .into_iter()
            .map(|c| c.payload)
            .collect())
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow").field("stream", &self.stream).finish()
    }
}
