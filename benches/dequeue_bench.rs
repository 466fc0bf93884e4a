//! Benchmarks for the orchestrator hot paths.
//!
//! Benchmarks cover:
//! - Dequeue under a group concurrency ceiling
//! - Dequeue across many groups
//! - Timeout sweeps over a large active set
//! - Event bus publish with and without debouncing

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use prometheus_orchestrator::core::{
    DequeueRequest, EventBus, EventBusConfig, Store, TaskEvent, TaskId, TaskProps, TaskState,
};
use prometheus_orchestrator::infra::store::InMemoryStore;
use serde_json::json;
use tokio::runtime::Runtime;

// ============================================================================
// Helper Functions
// ============================================================================

async fn seeded_store(tasks: u64, groups: u64, ceiling: u32) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let now = Utc::now();
    for i in 0..tasks {
        let props = TaskProps::new(format!("job-{i}"), format!("group-{}", i % groups), json!({ "i": i }))
            .with_group_max_concurrency(ceiling);
        store.create_task(props, now).await.unwrap();
    }
    store
}

// ============================================================================
// Dequeue Benchmarks
// ============================================================================

fn bench_dequeue_with_ceiling(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequeue_with_ceiling");

    for size in [100_u64, 1_000, 5_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let store = seeded_store(size, 1, 10).await;
                let claimed = store
                    .dequeue(&DequeueRequest::new("group-0", 100), Utc::now())
                    .await
                    .unwrap();
                black_box(claimed);
            });
        });
    }
    group.finish();
}

fn bench_dequeue_random_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequeue_random_groups");

    for groups in [10_u64, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(groups), &groups, |b, &groups| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let store = seeded_store(2_000, groups, 0).await;
                let mut rng = rand::rng();
                for _ in 0..50 {
                    let key = format!("group-{}", rng.random_range(0..groups));
                    let claimed = store
                        .dequeue(&DequeueRequest::new(key, 5), Utc::now())
                        .await
                        .unwrap();
                    black_box(claimed);
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Timeout Benchmarks
// ============================================================================

fn bench_expire_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("expire_sweep");

    for size in [1_000_u64, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let store = seeded_store(size, 10, 0).await;
                let later = Utc::now() + TimeDelta::minutes(5);
                let expired = store.expire_timed_out(later).await.unwrap();
                black_box(expired);
            });
        });
    }
    group.finish();
}

// ============================================================================
// Event Bus Benchmarks
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_publish");

    for window_ms in [0_u64, 100] {
        group.bench_with_input(
            BenchmarkId::new("debounce_ms", window_ms),
            &window_ms,
            |b, &window_ms| {
                b.to_async(Runtime::new().unwrap()).iter(|| async move {
                    let bus = EventBus::local(EventBusConfig {
                        debounce_window: Duration::from_millis(window_ms),
                        ..EventBusConfig::default()
                    });
                    let _rx = bus.subscribe("task:created:bench");
                    for _ in 0..1_000 {
                        bus.publish(TaskEvent {
                            task_id: TaskId::new(),
                            group_key: "bench".into(),
                            state: TaskState::Created,
                            last_error: None,
                        })
                        .await;
                    }
                    black_box(bus.stats());
                    bus.shutdown();
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    dequeue_benches,
    bench_dequeue_with_ceiling,
    bench_dequeue_random_groups
);

criterion_group!(timeout_benches, bench_expire_sweep);

criterion_group!(event_benches, bench_publish);

criterion_main!(dequeue_benches, timeout_benches, event_benches);
