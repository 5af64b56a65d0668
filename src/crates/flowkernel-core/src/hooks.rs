//! Failure delivery, completion callbacks and lifecycle events
//!
//! Transforms run on background tasks, so their failures cannot be returned to the
//! caller of [`crate::Flow::start`]. Instead every failed batch produces a
//! [`NodeFailure`] that is delivered to the node-local error handler and then to the
//! runtime-wide handler. Whether anyone saw it is reported explicitly as a
//! [`FailureOutcome`] on [`FlowEvent::BatchFailed`].
//!
//! ```rust,ignore
//! node.on_error(|failure: &NodeFailure| {
//!     tracing::warn!(node = %failure.node(), error = %failure.error(), "retrying");
//!     let retry = failure.retry_handle();
//!     tokio::spawn(async move { retry.retry().await });
//! });
//! ```

use flowkernel_store::{Context, ContextStatus, TraceStatus};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{FlowError, Result};
use crate::node::NodeId;
use crate::runtime::Kernel;

/// Error shared between handlers and events
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Receives failed batches
pub type ErrorHandler = Arc<dyn Fn(&NodeFailure) + Send + Sync>;

/// Receives every produced batch of a node
pub type CompletionFn = Arc<dyn Fn(&[Context]) + Send + Sync>;

/// Receives every produced value of a node
pub type ListenerFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// What happened to a transform failure
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// At least one error handler received it
    Handled,
    /// No handler was registered
    Unhandled(SharedError),
}

impl FailureOutcome {
    /// Whether a handler received the failure
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled)
    }

    /// Turn an unhandled failure of `node` into an error
    pub fn into_result(self, node: &str) -> Result<()> {
        match self {
            Self::Handled => Ok(()),
            Self::Unhandled(error) => Err(FlowError::node_execution(node, error.to_string())),
        }
    }
}

/// Lifecycle events broadcast by a runtime
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A run was ingested
    TraceStarted {
        trace_id: String,
        stream_id: String,
        count: usize,
    },
    /// A node finished a batch
    BatchCompleted {
        node: NodeId,
        batch_id: Option<String>,
        consumed: usize,
        produced: usize,
    },
    /// A node's transform failed
    BatchFailed {
        node: NodeId,
        error: String,
        outcome: FailureOutcome,
    },
    /// Contexts were suspended at a block
    BatchHeld {
        event_id: String,
        count: usize,
    },
    /// Held contexts were released
    Resumed {
        event_id: String,
        count: usize,
    },
    /// A run left `Running`
    TraceSettled {
        trace_id: String,
        status: TraceStatus,
    },
    /// A run was terminated
    TraceTerminated {
        trace_id: String,
    },
}

/// A failed batch, as seen by error handlers
#[derive(Clone)]
pub struct NodeFailure {
    node: NodeId,
    error: SharedError,
    retry: RetryHandle,
}

impl NodeFailure {
    pub(crate) fn new(node: NodeId, error: SharedError, retry: RetryHandle) -> Self {
        Self { node, error, retry }
    }

    /// Node whose transform failed
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The transform error
    pub fn error(&self) -> &SharedError {
        &self.error
    }

    /// The failed contexts
    pub fn contexts(&self) -> &[Context] {
        self.retry.contexts()
    }

    /// Handle that re-runs the failed batch
    pub fn retry_handle(&self) -> RetryHandle {
        self.retry.clone()
    }
}

impl fmt::Debug for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeFailure")
            .field("node", &self.node)
            .field("error", &self.error.to_string())
            .field("contexts", &self.retry.contexts.len())
            .finish()
    }
}

/// Re-runs a failed batch at the node that failed it
///
/// Retrying archives the failed contexts, regenerates them as `Pending` at the node's
/// own position with their original batch id, and reopens their runs. A batch can be
/// retried once; clones share that budget.
#[derive(Clone)]
pub struct RetryHandle {
    kernel: Weak<Kernel>,
    node: NodeId,
    stream: String,
    contexts: Arc<Vec<Context>>,
    used: Arc<AtomicBool>,
}

impl RetryHandle {
    pub(crate) fn new(
        kernel: Weak<Kernel>,
        node: NodeId,
        stream: String,
        contexts: Vec<Context>,
    ) -> Self {
        Self {
            kernel,
            node,
            stream,
            contexts: Arc::new(contexts),
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Node the batch will be re-run at
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The failed contexts
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Whether the batch was already retried
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }

    /// Re-run the batch; returns the ids of the regenerated contexts
    pub async fn retry(&self) -> Result<Vec<String>> {
        let kernel = self.kernel.upgrade().ok_or(FlowError::Shutdown)?;
        if kernel.node(&self.node).is_none() {
            return Err(FlowError::UnknownNode(self.node.clone()));
        }
        if self.used.swap(true, Ordering::SeqCst) {
            tracing::warn!(node = %self.node, "Batch already retried");
            return Ok(Vec::new());
        }

        let mut superseded = Vec::with_capacity(self.contexts.len());
        let mut fresh = Vec::with_capacity(self.contexts.len());
        let mut traces = BTreeSet::new();
        for ctx in self.contexts.iter() {
            let mut next = ctx.generate(ctx.payload.clone(), self.node.clone());
            next.stream_id = self.stream.clone();
            next.status = ContextStatus::Pending;
            fresh.push(next);
            superseded.push(ctx.clone().with_status(ContextStatus::Archived));
            traces.extend(ctx.trace_ids.iter().cloned());
        }

        let traces: Vec<String> = traces.into_iter().collect();
        kernel.repo.save_contexts(&[fresh.as_slice(), superseded.as_slice()].concat()).await?;
        kernel.rebind_windows(&[], &fresh).await?;
        // A rerun finishing before the reopen found the trace still settled
        kernel.reopen_traces(&traces).await?;
        kernel.settle(&traces).await?;
        kernel.wake(&self.node);

        tracing::info!(node = %self.node, count = fresh.len(), "Retrying failed batch");
        Ok(fresh.into_iter().map(|c| c.id).collect())
    }
}

impl fmt::Debug for RetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandle")
            .field("node", &self.node)
            .field("contexts", &self.contexts.len())
            .field("used", &self.is_used())
            .finish()
    }
}

/// Callbacks attached to one node
#[derive(Default)]
pub(crate) struct NodeHooks {
    error_handler: RwLock<Option<ErrorHandler>>,
    completions: RwLock<Vec<CompletionFn>>,
    listeners: RwLock<Vec<ListenerFn>>,
}

impl NodeHooks {
    pub(crate) fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write() = Some(handler);
    }

    pub(crate) fn error_handler(&self) -> Option<ErrorHandler> {
        self.error_handler.read().clone()
    }

    pub(crate) fn add_completion(&self, callback: CompletionFn) {
        self.completions.write().push(callback);
    }

    pub(crate) fn add_listener(&self, listener: ListenerFn) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn complete(&self, produced: &[Context]) {
        let callbacks = self.completions.read().clone();
        for callback in callbacks {
            callback(produced);
        }
    }

    pub(crate) fn notify_listeners(&self, produced: &[Context]) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        for ctx in produced {
            for listener in &listeners {
                listener(&ctx.payload);
            }
        }
    }
}

/// Hand a failure to the local and then the global handler
pub(crate) fn deliver_failure(
    local: Option<ErrorHandler>,
    global: Option<ErrorHandler>,
    failure: &NodeFailure,
) -> FailureOutcome {
    let mut handled = false;
    for handler in [local, global].into_iter().flatten() {
        handler(failure);
        handled = true;
    }
    if handled {
        FailureOutcome::Handled
    } else {
        FailureOutcome::Unhandled(failure.error.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkernel_store::Session;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn failure() -> NodeFailure {
        let error: SharedError = Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let ctx = Context::new("s", "s:a", json!(1), &Session::new());
        NodeFailure::new(
            "s:a".to_string(),
            error,
            RetryHandle::new(Weak::new(), "s:a".to_string(), "s".to_string(), vec![ctx]),
        )
    }

    #[test]
    fn test_unhandled_without_handlers() {
        let outcome = deliver_failure(None, None, &failure());
        match outcome {
            FailureOutcome::Unhandled(err) => assert_eq!(err.to_string(), "boom"),
            FailureOutcome::Handled => panic!("expected unhandled"),
        }
    }

    #[test]
    fn test_local_then_global() {
        let calls = Arc::new(AtomicUsize::new(0));
        let local_calls = calls.clone();
        let global_calls = calls.clone();
        let local: ErrorHandler = Arc::new(move |_| {
            local_calls.fetch_add(1, Ordering::SeqCst);
        });
        let global: ErrorHandler = Arc::new(move |_| {
            global_calls.fetch_add(10, Ordering::SeqCst);
        });

        let outcome = deliver_failure(Some(local), Some(global), &failure());
        assert!(outcome.is_handled());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_retry_after_runtime_dropped() {
        let result = failure().retry_handle().retry().await;
        assert!(matches!(result, Err(FlowError::Shutdown)));
    }

    #[test]
    fn test_listeners_see_each_value() {
        let hooks = NodeHooks::default();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = seen.clone();
        hooks.add_listener(Arc::new(move |v| sink.write().push(v.clone())));

        let session = Session::new();
        let produced = vec![
            Context::new("s", "s:a", json!(1), &session),
            Context::new("s", "s:a", json!(2), &session),
        ];
        hooks.notify_listeners(&produced);
        assert_eq!(*seen.read(), vec![json!(1), json!(2)]);
    }
}
