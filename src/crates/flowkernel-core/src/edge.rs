//! Edges (subscriptions) between nodes
//!
//! A [`Subscription`] connects the publisher side of one node to the subscriber side of
//! another. Each edge carries a payload conversion and a predicate; contexts travelling
//! over it are re-positioned at the edge id, which doubles as an inbound position of the
//! target node.
//!
//! Edge ids are deterministic (`"{source}->{target}"`, with a `#n` suffix for repeated
//! connections) so that several processes building the same graph agree on positions
//! stored in the shared repository.

use flowkernel_store::{Context, ContextStatus};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::block::Block;
use crate::node::NodeId;

/// Payload conversion applied when a context crosses an edge
pub type ConvertFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Predicate deciding whether a payload travels over an edge
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Optional settings for a new edge
#[derive(Clone, Default)]
pub struct EdgeOptions {
    /// Conversion, identity when `None`
    pub convert: Option<ConvertFn>,
    /// Predicate, accept-all when `None`
    pub whether: Option<PredicateFn>,
    /// Hold matched contexts behind a block with this event id
    pub block_event: Option<String>,
}

impl EdgeOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the conversion
    pub fn convert<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.convert = Some(Arc::new(f));
        self
    }

    /// Set the predicate
    pub fn when<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.whether = Some(Arc::new(f));
        self
    }

    /// Suspend matched contexts on the edge until resumed
    pub fn blocked(mut self, event_id: impl Into<String>) -> Self {
        self.block_event = Some(event_id.into());
        self
    }
}

/// Directed connection between two nodes
pub struct Subscription {
    id: String,
    source: NodeId,
    target: NodeId,
    target_stream: String,
    convert: Option<ConvertFn>,
    whether: Option<PredicateFn>,
    block: Option<Arc<Block>>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        source: NodeId,
        target: NodeId,
        target_stream: String,
        convert: Option<ConvertFn>,
        whether: Option<PredicateFn>,
        block: Option<Arc<Block>>,
    ) -> Self {
        Self {
            id,
            source,
            target,
            target_stream,
            convert,
            whether,
            block,
        }
    }

    /// Edge id, also the position of contexts travelling on it
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Upstream node
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Downstream node
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Stream owning the downstream node
    pub fn target_stream(&self) -> &str {
        &self.target_stream
    }

    /// Filter block on this edge, if any
    pub fn block(&self) -> Option<&Arc<Block>> {
        self.block.as_ref()
    }

    /// Event id of the filter block, if any
    pub fn event_id(&self) -> Option<&str> {
        self.block.as_ref().map(|b| b.event_id())
    }

    /// Whether `payload` may travel over this edge
    pub fn accepts(&self, payload: &Value) -> bool {
        self.whether.as_ref().map_or(true, |f| f(payload))
    }

    /// Apply the conversion
    pub fn convert(&self, payload: &Value) -> Value {
        match &self.convert {
            Some(f) => f(payload),
            None => payload.clone(),
        }
    }

    /// Successor of `ctx` waiting on this edge
    ///
    /// Held contexts wait as `Ready` so they stay live without being claimable.
    pub(crate) fn carry(&self, ctx: &Context) -> Context {
        let mut next = ctx.generate(self.convert(&ctx.payload), self.id.clone());
        next.stream_id = self.target_stream.clone();
        next.status = if self.block.is_some() {
            ContextStatus::Ready
        } else {
            ContextStatus::Pending
        };
        next
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("target_stream", &self.target_stream)
            .field("conditional", &self.whether.is_some())
            .field("event_id", &self.event_id())
            .finish()
    }
}

/// Deterministic edge id; `existing` counts earlier edges between the same pair
pub(crate) fn edge_id(source: &str, target: &str, existing: usize) -> String {
    if existing == 0 {
        format!("{}->{}", source, target)
    } else {
        format!("{}->{}#{}", source, target, existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkernel_store::Session;
    use serde_json::json;

    fn edge(options: EdgeOptions) -> Subscription {
        Subscription::new(
            edge_id("s:a", "t:b", 0),
            "s:a".to_string(),
            "t:b".to_string(),
            "t".to_string(),
            options.convert,
            options.whether,
            None,
        )
    }

    #[test]
    fn test_edge_ids_are_deterministic() {
        assert_eq!(edge_id("s:a", "s:b", 0), "s:a->s:b");
        assert_eq!(edge_id("s:a", "s:b", 2), "s:a->s:b#2");
    }

    #[test]
    fn test_defaults_accept_and_pass_through() {
        let e = edge(EdgeOptions::new());
        assert!(e.accepts(&json!(null)));
        assert_eq!(e.convert(&json!({"k": 1})), json!({"k": 1}));
    }

    #[test]
    fn test_carry_repositions_into_target_stream() {
        let e = edge(
            EdgeOptions::new()
                .convert(|v| json!(v.as_i64().unwrap_or(0) * 3))
                .when(|v| v.as_i64().map_or(false, |n| n > 0)),
        );
        assert!(!e.accepts(&json!(-1)));

        let ctx = Context::new("s", "s:a", json!(2), &Session::new()).with_batch("b");
        let next = e.carry(&ctx);
        assert_eq!(next.position, "s:a->t:b");
        assert_eq!(next.stream_id, "t");
        assert_eq!(next.origin_stream, "s");
        assert_eq!(next.payload, json!(6));
        assert_eq!(next.status, ContextStatus::Pending);
        assert_eq!(next.batch_id.as_deref(), Some("b"));
    }
}
