//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flowkernel_core::{Block, Runtime, RuntimeConfig};
use flowkernel_store::{
    Context, ContextStatus, InMemoryRepository, Repository, Result, StoreError, Trace,
    TraceStatus, WindowToken,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Route kernel logs to the test output; `RUST_LOG=flowkernel_core=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration with short, deterministic polling
pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_idle_backoff(Duration::from_millis(5))
        .with_jitter(false)
}

pub fn fast_runtime() -> Runtime {
    init_tracing();
    Runtime::builder()
        .config(fast_config())
        .build()
        .expect("valid runtime configuration")
}

/// Values in a stable order for comparisons
pub fn sorted(mut values: Vec<Value>) -> Vec<Value> {
    values.sort_by_key(|v| v.to_string());
    values
}

/// Poll until a block holds exactly `count` contexts
pub async fn wait_held(block: &Arc<Block>, count: usize) {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while block.held_count() != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "block {} holds {} contexts, expected {}",
            block.event_id(),
            block.held_count(),
            count
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until `check` holds
pub async fn wait_until<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// In-memory repository with scripted faults
///
/// Lookups of `New` contexts in one stream can be made to fail, and the first write
/// archiving a context at a given position can be made slow.
#[derive(Default)]
pub struct ScriptedRepository {
    inner: InMemoryRepository,
    failing_lookups: Mutex<Option<(String, usize)>>,
    failed: AtomicUsize,
    slow_archive: Mutex<Option<(String, Duration)>>,
}

impl ScriptedRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` lookups of `New` contexts in `stream`
    pub fn fail_queued_lookups(&self, stream: &str, times: usize) {
        *self.failing_lookups.lock().unwrap() = Some((stream.to_string(), times));
    }

    /// Sleep after the first write that archives a context at `position`
    pub fn stall_archive_at(&self, position: &str, delay: Duration) {
        *self.slow_archive.lock().unwrap() = Some((position.to_string(), delay));
    }

    /// Lookups failed so far
    pub fn failed_lookups(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, stream_id: &str, status: ContextStatus) -> bool {
        if status != ContextStatus::New {
            return false;
        }
        let mut failing = self.failing_lookups.lock().unwrap();
        match failing.as_mut() {
            Some((stream, remaining)) if stream == stream_id && *remaining > 0 => {
                *remaining -= 1;
                self.failed.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn archive_delay(&self, contexts: &[Context]) -> Option<Duration> {
        let mut slow = self.slow_archive.lock().unwrap();
        let hit = slow.as_ref().map_or(false, |(position, _)| {
            contexts
                .iter()
                .any(|c| c.status == ContextStatus::Archived && &c.position == position)
        });
        if hit {
            slow.take().map(|(_, delay)| delay)
        } else {
            None
        }
    }
}

#[async_trait]
impl Repository for ScriptedRepository {
    async fn save_contexts(&self, contexts: &[Context]) -> Result<()> {
        self.inner.save_contexts(contexts).await?;
        if let Some(delay) = self.archive_delay(contexts) {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>> {
        self.inner.get_context(id).await
    }

    async fn find_contexts(
        &self,
        stream_id: &str,
        positions: &[String],
        status: ContextStatus,
    ) -> Result<Vec<Context>> {
        if self.injected_failure(stream_id, status) {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.find_contexts(stream_id, positions, status).await
    }

    async fn mark_dispatched(&self, ids: &[String]) -> Result<usize> {
        self.inner.mark_dispatched(ids).await
    }

    async fn find_by_parallel(&self, parallel_id: &str) -> Result<Vec<Context>> {
        self.inner.find_by_parallel(parallel_id).await
    }

    async fn mark_joined(&self, parallel_id: &str, ids: &[String]) -> Result<()> {
        self.inner.mark_joined(parallel_id, ids).await
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Context>> {
        self.inner.find_by_trace(trace_id).await
    }

    async fn save_trace(&self, trace: &Trace) -> Result<()> {
        self.inner.save_trace(trace).await
    }

    async fn get_trace(&self, id: &str) -> Result<Option<Trace>> {
        self.inner.get_trace(id).await
    }

    async fn register_in_pool(&self, trace_ids: &[String], context_ids: &[String]) -> Result<()> {
        self.inner.register_in_pool(trace_ids, context_ids).await
    }

    async fn is_terminated(&self, trace_ids: &[String]) -> Result<bool> {
        self.inner.is_terminated(trace_ids).await
    }

    async fn mark_terminated(&self, trace_ids: &[String]) -> Result<()> {
        self.inner.mark_terminated(trace_ids).await
    }

    async fn complete_trace(&self, id: &str, status: TraceStatus) -> Result<bool> {
        self.inner.complete_trace(id, status).await
    }

    async fn save_window(&self, window: &WindowToken) -> Result<()> {
        self.inner.save_window(window).await
    }

    async fn get_window(&self, id: &str) -> Result<Option<WindowToken>> {
        self.inner.get_window(id).await
    }

    async fn rebind_window(
        &self,
        id: &str,
        removed: &[String],
        added: &[String],
    ) -> Result<Option<WindowToken>> {
        self.inner.rebind_window(id, removed, added).await
    }

    async fn fire_window(&self, id: &str) -> Result<bool> {
        self.inner.fire_window(id).await
    }
}

/// Runtime over a scripted repository
pub fn scripted_runtime(repo: &Arc<ScriptedRepository>, config: RuntimeConfig) -> Runtime {
    init_tracing();
    Runtime::builder()
        .repository(repo.clone())
        .config(config)
        .build()
        .expect("valid runtime configuration")
}
