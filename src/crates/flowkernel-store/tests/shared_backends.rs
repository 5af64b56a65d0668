//! Integration tests for backends shared between cooperating instances
//!
//! Clones of the in-memory backends stand in for two processes talking to the same
//! database and lock service.

use flowkernel_store::{
    Context, ContextStatus, InMemoryLockManager, InMemoryRepository, LockKey, LockManager,
    Repository, Session,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Two workers racing to claim the same pending batch under the same lock key must
/// split the batch without overlap.
#[tokio::test]
async fn test_concurrent_claims_never_overlap() {
    let repo = InMemoryRepository::new();
    let locks = InMemoryLockManager::new();
    let session = Session::new();

    let batch: Vec<Context> = (0..50)
        .map(|i| {
            Context::new("s", "node", json!(i), &session)
                .with_status(ContextStatus::Pending)
                .with_batch(format!("b{}", i % 5))
        })
        .collect();
    repo.save_contexts(&batch).await.unwrap();

    let claimed = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for _ in 0..2 {
        let repo = repo.clone();
        let locks = locks.clone();
        let claimed = claimed.clone();
        workers.push(tokio::spawn(async move {
            let key = LockKey::new("s", "node", "pre-process");
            loop {
                let _guard = locks.acquire(&key).await.unwrap();
                let pending: Vec<Context> = repo
                    .find_contexts("s", &["node".to_string()], ContextStatus::Pending)
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|c| !c.dispatched)
                    .collect();
                let Some(first) = pending.first() else {
                    break;
                };
                let ids: Vec<String> = pending
                    .iter()
                    .filter(|c| c.batch_id == first.batch_id)
                    .map(|c| c.id.clone())
                    .collect();
                let n = repo.mark_dispatched(&ids).await.unwrap();
                assert_eq!(n, ids.len(), "a claimed batch was already dispatched");
                claimed.fetch_add(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(claimed.load(Ordering::SeqCst), 50);
}

#[tokio::test]
async fn test_clones_share_state() {
    let repo = InMemoryRepository::new();
    let other = repo.clone();

    let ctx = Context::new("s", "node", json!("x"), &Session::new());
    repo.save_contexts(&[ctx.clone()]).await.unwrap();

    assert_eq!(other.get_context(&ctx.id).await.unwrap(), Some(ctx));
    assert_eq!(other.context_count().await, 1);

    other.clear().await;
    assert_eq!(repo.context_count().await, 0);
}
