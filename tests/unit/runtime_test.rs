//! Tests for runtime adapters

use std::sync::Arc;

use prometheus_orchestrator::builders::OrchestratorBuilder;
use prometheus_orchestrator::config::OrchestratorConfig;
use prometheus_orchestrator::core::completed_event;
use prometheus_orchestrator::core::TaskId;
use prometheus_orchestrator::infra::store::InMemoryStore;
use tokio::sync::broadcast::error::RecvError;

#[tokio::test]
async fn test_runtime_starts_every_daemon() {
    let built = OrchestratorBuilder::new()
        .store(Arc::new(InMemoryStore::new()))
        .build()
        .unwrap();
    let (_orchestrator, runtime) = built.start();
    assert_eq!(runtime.running(), 3);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_runtime_without_cleanup() {
    let mut cfg = OrchestratorConfig::default();
    cfg.cleanup.enabled = false;
    let built = OrchestratorBuilder::new()
        .config(cfg)
        .store(Arc::new(InMemoryStore::new()))
        .build()
        .unwrap();
    let (_orchestrator, runtime) = built.start();
    assert_eq!(runtime.running(), 2);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_subscriptions() {
    let built = OrchestratorBuilder::new()
        .store(Arc::new(InMemoryStore::new()))
        .build()
        .unwrap();
    let (orchestrator, runtime) = built.start();
    let mut rx = orchestrator.bus().subscribe(&completed_event(TaskId::new()));

    tokio::time::timeout(std::time::Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("daemons should stop promptly");
    assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
}
