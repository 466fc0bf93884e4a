//! Integration tests for local and cross-process event delivery.

use std::sync::Arc;
use std::time::Duration;

use prometheus_orchestrator::core::{
    completed_event, created_event, EventBus, EventBusConfig, TaskEvent, TaskId, TaskState,
};
use prometheus_orchestrator::infra::transport::{InMemoryTransport, DEFAULT_MAX_PAYLOAD_BYTES};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

// ============================================================================
// Helpers
// ============================================================================

fn config(window_ms: u64) -> EventBusConfig {
    EventBusConfig {
        debounce_window: Duration::from_millis(window_ms),
        ..EventBusConfig::default()
    }
}

fn event(state: TaskState, group: &str) -> TaskEvent {
    TaskEvent {
        task_id: TaskId::new(),
        group_key: group.to_owned(),
        state,
        last_error: None,
    }
}

/// Two buses on one hub, as two processes sharing a database would be.
fn pair(max_payload_bytes: usize) -> (Arc<EventBus>, Arc<EventBus>, Arc<InMemoryTransport>) {
    let hub = InMemoryTransport::new(max_payload_bytes);
    let a = EventBus::with_transport(config(20), hub.clone());
    let b = EventBus::with_transport(config(20), hub.attach());
    a.start();
    b.start();
    (a, b, hub)
}

async fn recv_within(
    rx: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    within: Duration,
) -> Option<TaskEvent> {
    tokio::time::timeout(within, rx.recv()).await.ok()?.ok()
}

// ============================================================================
// Debounce
// ============================================================================

#[tokio::test]
async fn test_created_burst_collapses_to_one_emission() {
    let bus = EventBus::local(config(50));
    let mut rx = bus.subscribe(&created_event("sync"));

    let mut last = None;
    for _ in 0..10 {
        let e = event(TaskState::Created, "sync");
        last = Some(e.task_id);
        bus.publish(e).await;
    }
    assert_eq!(bus.pending_debounces(), 1);

    let delivered = recv_within(&mut rx, Duration::from_secs(1)).await.unwrap();
    assert_eq!(Some(delivered.task_id), last);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    let stats = bus.stats();
    assert_eq!(stats.published, 10);
    assert_eq!(stats.debounced, 9);
    assert_eq!(stats.local_deliveries, 1);
    assert_eq!(bus.pending_debounces(), 0);
}

#[tokio::test]
async fn test_debounce_is_per_group_prefix() {
    let bus = EventBus::local(config(30));
    let mut tenant = bus.subscribe(&created_event("tenant"));
    let mut other = bus.subscribe(&created_event("billing"));

    bus.publish(event(TaskState::Created, "tenant:1")).await;
    bus.publish(event(TaskState::Created, "tenant:2")).await;
    bus.publish(event(TaskState::Created, "billing")).await;

    assert!(recv_within(&mut tenant, Duration::from_secs(1)).await.is_some());
    assert!(recv_within(&mut other, Duration::from_secs(1)).await.is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(tenant.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(bus.stats().debounced, 1);
}

#[tokio::test]
async fn test_terminal_events_are_not_debounced() {
    let bus = EventBus::local(config(10_000));
    let e = event(TaskState::Failed, "sync");
    let mut rx = bus.subscribe(&completed_event(e.task_id));
    bus.publish(e.clone()).await;
    assert_eq!(rx.try_recv().unwrap(), e);
}

#[tokio::test]
async fn test_zero_window_disables_debounce() {
    let bus = EventBus::local(config(0));
    let mut rx = bus.subscribe(&created_event("sync"));
    bus.publish(event(TaskState::Created, "sync")).await;
    bus.publish(event(TaskState::Created, "sync")).await;
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_ok());
    assert_eq!(bus.pending_debounces(), 0);
}

// ============================================================================
// Cross-process delivery
// ============================================================================

#[tokio::test]
async fn test_event_reaches_other_process() {
    let (a, b, _hub) = pair(DEFAULT_MAX_PAYLOAD_BYTES);
    let e = event(TaskState::Succeeded, "sync");
    let mut remote = b.subscribe(&completed_event(e.task_id));
    let mut local = a.subscribe(&completed_event(e.task_id));

    a.publish(e.clone()).await;

    assert_eq!(recv_within(&mut remote, Duration::from_secs(1)).await, Some(e.clone()));
    assert_eq!(local.try_recv().unwrap(), e);
    // the publisher ignores its own echo from the transport
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(local.try_recv(), Err(TryRecvError::Empty)));

    assert_eq!(a.stats().remote_sent, 1);
    assert_eq!(a.stats().remote_received, 0);
    assert_eq!(b.stats().remote_received, 1);
}

#[tokio::test]
async fn test_oversized_payload_falls_back_to_local() {
    let (a, b, _hub) = pair(256);
    let mut e = event(TaskState::Failed, "sync");
    e.last_error = Some("e".repeat(1_000));
    let mut remote = b.subscribe(&completed_event(e.task_id));
    let mut local = a.subscribe(&completed_event(e.task_id));

    a.publish(e.clone()).await;

    assert_eq!(local.try_recv().unwrap(), e);
    assert!(recv_within(&mut remote, Duration::from_millis(200)).await.is_none());
    let stats = a.stats();
    assert_eq!(stats.oversized_fallbacks, 1);
    assert_eq!(stats.remote_sent, 0);
}

#[tokio::test]
async fn test_disconnected_transport_delivers_locally() {
    let hub = InMemoryTransport::new(DEFAULT_MAX_PAYLOAD_BYTES);
    let a = EventBus::with_transport(config(20), hub.clone());
    let b = EventBus::with_transport(config(20), hub.attach());
    a.start();
    b.start();
    hub.set_connected(false);
    assert!(!a.is_connected());
    assert!(b.is_connected());

    let e = event(TaskState::Cancelled, "sync");
    let mut local = a.subscribe(&completed_event(e.task_id));
    let mut remote = b.subscribe(&completed_event(e.task_id));
    a.publish(e.clone()).await;

    assert_eq!(local.try_recv().unwrap(), e);
    assert!(recv_within(&mut remote, Duration::from_millis(200)).await.is_none());
    assert_eq!(a.stats().remote_sent, 0);
}

#[tokio::test]
async fn test_shutdown_drops_pending_and_closes_channels() {
    let bus = EventBus::local(config(10_000));
    let mut rx = bus.subscribe(&created_event("sync"));
    bus.publish(event(TaskState::Created, "sync")).await;
    assert_eq!(bus.pending_debounces(), 1);

    bus.shutdown();
    assert_eq!(bus.pending_debounces(), 0);
    assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
}
