use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowkernel_store::{
    Context, ContextStatus, InMemoryRepository, Repository, Session, WindowToken,
};
use serde_json::json;

fn pending_batch(n: usize) -> Vec<Context> {
    let session = Session::new();
    (0..n)
        .map(|i| {
            Context::new("bench", "bench:a->bench:b", json!(i), &session)
                .with_status(ContextStatus::Pending)
                .with_batch("batch-1")
        })
        .collect()
}

fn save_and_claim_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("save and claim 100 contexts", |b| {
        b.to_async(&runtime).iter(|| async {
            let repo = InMemoryRepository::new();
            let batch = pending_batch(100);
            repo.save_contexts(black_box(&batch)).await.unwrap();

            let found = repo
                .find_contexts(
                    "bench",
                    &["bench:a->bench:b".to_string()],
                    ContextStatus::Pending,
                )
                .await
                .unwrap();
            let ids: Vec<String> = found.iter().map(|c| c.id.clone()).collect();
            repo.mark_dispatched(black_box(&ids)).await.unwrap();
        });
    });
}

fn window_rebind_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("window rebind chain", |b| {
        b.to_async(&runtime).iter(|| async {
            let repo = InMemoryRepository::new();
            let window = WindowToken::seeded(["c0".to_string()]);
            repo.save_window(&window).await.unwrap();

            for i in 0..50 {
                let removed = [format!("c{}", i)];
                let added = [format!("c{}", i + 1)];
                repo.rebind_window(&window.id, &removed, &added).await.unwrap();
            }
            repo.rebind_window(&window.id, &["c50".to_string()], &[])
                .await
                .unwrap();
            black_box(repo.fire_window(&window.id).await.unwrap());
        });
    });
}

criterion_group!(benches, save_and_claim_benchmark, window_rebind_benchmark);
criterion_main!(benches);
