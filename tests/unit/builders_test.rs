//! Tests for builder helpers

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use prometheus_orchestrator::builders::OrchestratorBuilder;
use prometheus_orchestrator::config::OrchestratorConfig;
use prometheus_orchestrator::core::{
    ScheduleRequest, ScheduledId, SchedulerError, TaskProps, TaskState,
};
use prometheus_orchestrator::infra::store::InMemoryStore;
use prometheus_orchestrator::infra::transport::InMemoryTransport;
use prometheus_orchestrator::util::ManualClock;
use serde_json::json;

#[test]
fn test_build_requires_store() {
    let result = OrchestratorBuilder::new().build();
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}

#[test]
fn test_build_rejects_invalid_config() {
    let mut cfg = OrchestratorConfig::default();
    cfg.timeouts.tick_interval_ms = 0;
    let result = OrchestratorBuilder::new()
        .config(cfg)
        .store(Arc::new(InMemoryStore::new()))
        .build();
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}

#[test]
fn test_cleanup_worker_follows_config() {
    let built = OrchestratorBuilder::new()
        .store(Arc::new(InMemoryStore::new()))
        .build()
        .unwrap();
    assert!(built.daemons.cleanup.is_some());

    let mut cfg = OrchestratorConfig::default();
    cfg.cleanup.enabled = false;
    let built = OrchestratorBuilder::new()
        .config(cfg)
        .store(Arc::new(InMemoryStore::new()))
        .build()
        .unwrap();
    assert!(built.daemons.cleanup.is_none());
}

#[tokio::test]
async fn test_built_orchestrator_uses_injected_clock() {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let built = OrchestratorBuilder::new()
        .store(Arc::new(InMemoryStore::new()))
        .transport(InMemoryTransport::new(8_000))
        .clock(Arc::new(ManualClock::new(start)))
        .build()
        .unwrap();
    let orchestrator = built.orchestrator;
    assert!(orchestrator.bus().is_connected());

    let id = orchestrator
        .schedule(ScheduleRequest::Immediate(TaskProps::new("t", "sync", json!({}))))
        .await
        .unwrap();
    let ScheduledId::Task(id) = id else {
        panic!("expected a task id");
    };
    let task = orchestrator.get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Created);
    assert_eq!(task.created_at, start);
    assert_eq!(task.starts_after, start);
}
