//! Edge selection for outgoing contexts
//!
//! Ordinary nodes broadcast: every edge whose predicate matches receives its own copy.
//! Conditions nodes route exclusively: each context goes to the first matching edge in
//! subscription order and is never broadcast. A context matching nothing resolves.
//!
//! Contexts that entered this stream from another flow only travel back to their origin
//! stream, so a sub-flow called from a parent answers the parent instead of continuing
//! with its own downstream graph.

use flowkernel_store::Context;
use std::sync::Arc;

use crate::edge::Subscription;

/// How a publisher distributes outputs over its edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Routing {
    /// Every matching edge
    #[default]
    Broadcast,
    /// First matching edge only
    Exclusive,
}

/// Pair each context with the edges it travels over
pub(crate) fn route<'a>(
    routing: Routing,
    stream: &str,
    edges: &'a [Arc<Subscription>],
    contexts: &'a [Context],
) -> Vec<(&'a Arc<Subscription>, &'a Context)> {
    let mut routes = Vec::new();
    for ctx in contexts {
        let candidates = edges
            .iter()
            .filter(|edge| ctx.origin_stream == stream || edge.target_stream() == ctx.origin_stream)
            .filter(|edge| edge.accepts(&ctx.payload));
        match routing {
            Routing::Broadcast => routes.extend(candidates.map(|edge| (edge, ctx))),
            Routing::Exclusive => routes.extend(candidates.take(1).map(|edge| (edge, ctx))),
        }
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{edge_id, PredicateFn};
    use flowkernel_store::Session;
    use serde_json::{json, Value};

    fn edge(target: &str, whether: Option<PredicateFn>) -> Arc<Subscription> {
        let stream = target.split(':').next().unwrap_or_default().to_string();
        Arc::new(Subscription::new(
            edge_id("s:c", target, 0),
            "s:c".to_string(),
            target.to_string(),
            stream,
            None,
            whether,
            None,
        ))
    }

    fn parity(even: bool) -> Option<PredicateFn> {
        Some(Arc::new(move |v: &Value| {
            v.as_i64().map_or(false, |n| (n % 2 == 0) == even)
        }))
    }

    fn inputs(values: &[i64]) -> Vec<Context> {
        let session = Session::new();
        values
            .iter()
            .map(|v| Context::new("s", "s:c", json!(v), &session))
            .collect()
    }

    #[test]
    fn test_exclusive_routing_never_broadcasts() {
        let edges = vec![edge("s:even", parity(true)), edge("s:any", None)];
        let contexts = inputs(&[1, 2, 3, 4]);
        let routes = route(Routing::Exclusive, "s", &edges, &contexts);

        assert_eq!(routes.len(), 4);
        let even: Vec<&Value> = routes
            .iter()
            .filter(|(e, _)| e.target() == "s:even")
            .map(|(_, c)| &c.payload)
            .collect();
        assert_eq!(even, vec![&json!(2), &json!(4)]);
    }

    #[test]
    fn test_broadcast_copies_to_every_match() {
        let edges = vec![edge("s:even", parity(true)), edge("s:any", None)];
        let contexts = inputs(&[1, 2]);
        let routes = route(Routing::Broadcast, "s", &edges, &contexts);
        assert_eq!(routes.len(), 3);
    }

    #[test]
    fn test_unmatched_context_resolves() {
        let edges = vec![edge("s:even", parity(true)), edge("s:odd", parity(false))];
        let contexts = vec![Context::new("s", "s:c", json!("text"), &Session::new())];
        assert!(route(Routing::Exclusive, "s", &edges, &contexts).is_empty());
    }

    #[test]
    fn test_foreign_contexts_return_to_origin() {
        let edges = vec![edge("s:next", None), edge("parent:resume", None)];
        let mut ctx = Context::new("parent", "s:c", json!(1), &Session::new());
        ctx.stream_id = "s".to_string();
        let contexts = vec![ctx];

        let routes = route(Routing::Broadcast, "s", &edges, &contexts);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0.target(), "parent:resume");
    }
}
