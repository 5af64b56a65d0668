//! In-memory collaborator backends for development and testing
//!
//! - [`InMemoryRepository`] - contexts, traces and windows in a `tokio::sync::RwLock`
//!   guarded table set; every trait method takes the lock once, which makes the atomic
//!   operations of [`Repository`] trivially atomic
//! - [`InMemoryLockManager`] - one `tokio::sync::Mutex` per [`LockKey`]
//! - [`InMemoryMessenger`] - unbounded channels fanned out per node id
//!
//! All three are cheap to clone; clones share the same underlying state, so two
//! runtimes built from clones behave like two processes sharing one database, one lock
//! service and one broker.
//!
//! **Use for**: unit and integration tests, single-process deployments, demos.
//! **Avoid for**: anything that must survive a restart.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::context::{Context, ContextStatus};
use crate::error::{Result, StoreError};
use crate::trace::{Trace, TraceStatus};
use crate::traits::{
    BatchReady, LockGuard, LockKey, LockManager, Messenger, Repository, TriggerStream,
};
use crate::window::WindowToken;

#[derive(Debug, Default)]
struct Tables {
    seq: u64,
    contexts: HashMap<String, (u64, Context)>,
    traces: HashMap<String, Trace>,
    windows: HashMap<String, WindowToken>,
}

impl Tables {
    fn sorted(&self, keep: impl Fn(&Context) -> bool) -> Vec<Context> {
        let mut rows: Vec<&(u64, Context)> = self
            .contexts
            .values()
            .filter(|(_, ctx)| keep(ctx))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, ctx)| ctx.clone()).collect()
    }
}

/// Thread-safe in-memory repository
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored contexts
    pub async fn context_count(&self) -> usize {
        self.tables.read().await.contexts.len()
    }

    /// Every stored context, in insertion order
    pub async fn all_contexts(&self) -> Vec<Context> {
        self.tables.read().await.sorted(|_| true)
    }

    /// Drop everything (useful for testing)
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        tables.contexts.clear();
        tables.traces.clear();
        tables.windows.clear();
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_contexts(&self, contexts: &[Context]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for ctx in contexts {
            let existing = tables.contexts.get(&ctx.id).map(|(seq, _)| *seq);
            let seq = match existing {
                Some(seq) => seq,
                None => {
                    tables.seq += 1;
                    tables.seq
                }
            };
            tables.contexts.insert(ctx.id.clone(), (seq, ctx.clone()));
        }
        Ok(())
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>> {
        let tables = self.tables.read().await;
        Ok(tables.contexts.get(id).map(|(_, ctx)| ctx.clone()))
    }

    async fn find_contexts(
        &self,
        stream_id: &str,
        positions: &[String],
        status: ContextStatus,
    ) -> Result<Vec<Context>> {
        let tables = self.tables.read().await;
        Ok(tables.sorted(|ctx| {
            ctx.status == status
                && ctx.stream_id == stream_id
                && positions.iter().any(|p| *p == ctx.position)
        }))
    }

    async fn mark_dispatched(&self, ids: &[String]) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let mut claimed = 0;
        for id in ids {
            if let Some((_, ctx)) = tables.contexts.get_mut(id) {
                if ctx.status == ContextStatus::Pending && !ctx.dispatched {
                    ctx.dispatched = true;
                    claimed += 1;
                }
            }
        }
        Ok(claimed)
    }

    async fn find_by_parallel(&self, parallel_id: &str) -> Result<Vec<Context>> {
        let tables = self.tables.read().await;
        Ok(tables.sorted(|ctx| ctx.parallel_id.as_deref() == Some(parallel_id)))
    }

    async fn mark_joined(&self, parallel_id: &str, ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            if let Some((_, ctx)) = tables.contexts.get_mut(id) {
                if ctx.parallel_id.as_deref() == Some(parallel_id) {
                    ctx.joined = true;
                }
            }
        }
        Ok(())
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Context>> {
        let tables = self.tables.read().await;
        Ok(tables.sorted(|ctx| ctx.trace_ids.contains(trace_id)))
    }

    async fn save_trace(&self, trace: &Trace) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.traces.insert(trace.id.clone(), trace.clone());
        Ok(())
    }

    async fn get_trace(&self, id: &str) -> Result<Option<Trace>> {
        Ok(self.tables.read().await.traces.get(id).cloned())
    }

    async fn register_in_pool(&self, trace_ids: &[String], context_ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for trace_id in trace_ids {
            let trace = tables
                .traces
                .get_mut(trace_id)
                .ok_or_else(|| StoreError::NotFound(format!("trace {}", trace_id)))?;
            trace.register(context_ids);
        }
        Ok(())
    }

    async fn is_terminated(&self, trace_ids: &[String]) -> Result<bool> {
        if trace_ids.is_empty() {
            return Ok(false);
        }
        let tables = self.tables.read().await;
        Ok(trace_ids.iter().all(|id| {
            tables
                .traces
                .get(id)
                .map(|trace| trace.is_terminated())
                .unwrap_or(false)
        }))
    }

    async fn mark_terminated(&self, trace_ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in trace_ids {
            let trace = tables
                .traces
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("trace {}", id)))?;
            trace.status = TraceStatus::Terminated;
            trace.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn complete_trace(&self, id: &str, status: TraceStatus) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.traces.get_mut(id) {
            Some(trace) if trace.status == TraceStatus::Running => {
                trace.status = status;
                trace.updated_at = chrono::Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("trace {}", id))),
        }
    }

    async fn save_window(&self, window: &WindowToken) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.windows.insert(window.id.clone(), window.clone());
        Ok(())
    }

    async fn get_window(&self, id: &str) -> Result<Option<WindowToken>> {
        Ok(self.tables.read().await.windows.get(id).cloned())
    }

    async fn rebind_window(
        &self,
        id: &str,
        removed: &[String],
        added: &[String],
    ) -> Result<Option<WindowToken>> {
        let mut tables = self.tables.write().await;
        Ok(tables.windows.get_mut(id).map(|window| {
            window.rebind(removed, added);
            window.clone()
        }))
    }

    async fn fire_window(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .windows
            .get_mut(id)
            .map(|window| window.try_fire())
            .unwrap_or(false))
    }
}

/// In-process lock manager
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockManager {
    locks: Arc<SyncMutex<HashMap<LockKey, Arc<Mutex<()>>>>>,
}

impl InMemoryLockManager {
    /// Create a lock manager with no locks
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys ever locked
    pub fn key_count(&self) -> usize {
        self.locks.lock().len()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, key: &LockKey) -> Result<LockGuard> {
        let lock = self
            .locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let lease = lock.lock_owned().await;
        Ok(LockGuard::new(key.clone(), lease))
    }
}

/// In-process messenger
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessenger {
    listeners: Arc<SyncRwLock<HashMap<String, Vec<mpsc::UnboundedSender<BatchReady>>>>>,
}

impl InMemoryMessenger {
    /// Create a messenger with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live listeners for a node
    pub fn listener_count(&self, node_id: &str) -> usize {
        self.listeners
            .read()
            .get(node_id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Messenger for InMemoryMessenger {
    async fn publish(&self, trigger: BatchReady) -> Result<()> {
        let mut listeners = self.listeners.write();
        if let Some(senders) = listeners.get_mut(&trigger.node_id) {
            senders.retain(|tx| tx.send(trigger.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, node_id: &str) -> Result<TriggerStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .write()
            .entry(node_id.to_string())
            .or_default()
            .push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Session;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn pending(position: &str, batch: &str) -> Context {
        Context::new("s", position, json!(1), &Session::from("sess"))
            .with_status(ContextStatus::Pending)
            .with_batch(batch)
    }

    #[tokio::test]
    async fn test_find_contexts_keeps_insertion_order() {
        let repo = InMemoryRepository::new();
        let a = pending("n", "b1");
        let b = pending("n", "b1");
        let c = pending("other", "b1");
        repo.save_contexts(&[a.clone(), b.clone(), c]).await.unwrap();

        let found = repo
            .find_contexts("s", &["n".to_string()], ContextStatus::Pending)
            .await
            .unwrap();
        assert_eq!(
            found.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            vec![a.id.clone(), b.id.clone()]
        );

        // Updating keeps the original position in the order
        let mut a2 = a.clone();
        a2.payload = json!(2);
        repo.save_contexts(&[a2]).await.unwrap();
        let found = repo
            .find_contexts("s", &["n".to_string()], ContextStatus::Pending)
            .await
            .unwrap();
        assert_eq!(found[0].id, a.id);
        assert_eq!(found[0].payload, json!(2));
    }

    #[tokio::test]
    async fn test_mark_dispatched_claims_once() {
        let repo = InMemoryRepository::new();
        let a = pending("n", "b1");
        repo.save_contexts(&[a.clone()]).await.unwrap();

        assert_eq!(repo.mark_dispatched(&[a.id.clone()]).await.unwrap(), 1);
        assert_eq!(repo.mark_dispatched(&[a.id.clone()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trace_termination_and_completion() {
        let repo = InMemoryRepository::new();
        let t1 = Trace::new("s", "n");
        let t2 = Trace::new("s", "n");
        repo.save_trace(&t1).await.unwrap();
        repo.save_trace(&t2).await.unwrap();

        assert!(!repo.is_terminated(&[]).await.unwrap());
        repo.mark_terminated(&[t1.id.clone()]).await.unwrap();
        assert!(repo.is_terminated(&[t1.id.clone()]).await.unwrap());
        assert!(!repo
            .is_terminated(&[t1.id.clone(), t2.id.clone()])
            .await
            .unwrap());

        assert!(!repo.complete_trace(&t1.id, TraceStatus::Ready).await.unwrap());
        assert!(repo.complete_trace(&t2.id, TraceStatus::Ready).await.unwrap());
        assert_eq!(
            repo.get_trace(&t2.id).await.unwrap().unwrap().status,
            TraceStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_window_operations() {
        let repo = InMemoryRepository::new();
        let window = WindowToken::seeded(vec!["a".to_string()]);
        repo.save_window(&window).await.unwrap();

        let rebound = repo
            .rebind_window(&window.id, &["a".to_string()], &["b".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert!(rebound.todo.contains("b"));
        assert!(!repo.fire_window(&window.id).await.unwrap());

        repo.rebind_window(&window.id, &["b".to_string()], &[])
            .await
            .unwrap();
        assert!(repo.fire_window(&window.id).await.unwrap());
        assert!(!repo.fire_window(&window.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_key() {
        let locks = InMemoryLockManager::new();
        let key = LockKey::new("s", "n", "pre-process");

        let guard = locks.acquire(&key).await.unwrap();
        let contended = tokio::time::timeout(Duration::from_millis(20), locks.acquire(&key)).await;
        assert!(contended.is_err(), "second acquire must wait");

        // A different operation on the same node is independent
        let other = LockKey::new("s", "n", "request-ready");
        let _other_guard = locks.acquire(&other).await.unwrap();

        drop(guard);
        let reacquired = tokio::time::timeout(Duration::from_millis(200), locks.acquire(&key)).await;
        assert!(reacquired.is_ok());
        assert_eq!(locks.key_count(), 2);
    }

    #[tokio::test]
    async fn test_messenger_delivers_to_every_listener() {
        let messenger = InMemoryMessenger::new();
        let mut first = messenger.subscribe("n").await.unwrap();
        let mut second = messenger.subscribe("n").await.unwrap();
        let mut unrelated = messenger.subscribe("m").await.unwrap();

        messenger
            .publish(BatchReady::new("s", "n", Some("b1".to_string())))
            .await
            .unwrap();

        assert_eq!(first.next().await.unwrap().batch_id.as_deref(), Some("b1"));
        assert_eq!(second.next().await.unwrap().node_id, "n");
        let nothing = tokio::time::timeout(Duration::from_millis(20), unrelated.next()).await;
        assert!(nothing.is_err());
        assert_eq!(messenger.listener_count("n"), 2);
    }
}
