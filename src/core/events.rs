//! Task lifecycle event bus.
//!
//! Events are fanned out to subscribers of this process directly and, when a
//! [`NotificationTransport`] is attached, to every other process listening on
//! the same transport. Delivery is best effort: anything waiting on an event
//! must also verify state against the store.
//!
//! Event names:
//! - `task:created:<group prefix>` where the prefix is the group key up to the
//!   first `:`. Bursts on the same name are debounced.
//! - `task:started:<task id>`
//! - `task:completed:<task id>` for every terminal state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::error::Result;
use crate::core::task::{Task, TaskId, TaskState};

/// Separator between a group key's prefix and the rest of it.
pub const GROUP_PREFIX_SEPARATOR: char = ':';

/// Cross-process publish/subscribe primitive with a bounded payload size.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Publish a payload to every listener, including this process.
    async fn notify(&self, payload: &str) -> Result<()>;

    /// Receive payloads published by any process.
    fn subscribe(&self) -> broadcast::Receiver<String>;

    /// Largest payload, in bytes, the transport accepts.
    fn max_payload_bytes(&self) -> usize;

    /// Whether the transport is currently able to publish and receive.
    fn is_connected(&self) -> bool;
}

/// A task lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// The task.
    pub task_id: TaskId,
    /// Its group.
    pub group_key: String,
    /// The state it entered.
    pub state: TaskState,
    /// Error recorded with a non-successful terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskEvent {
    /// Event describing the task's current state.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            group_key: task.group_key.clone(),
            state: task.state,
            last_error: task.last_error.clone(),
        }
    }

    /// The event name this event is published under.
    #[must_use]
    pub fn name(&self) -> String {
        match self.state {
            TaskState::Created => created_event(&self.group_key),
            TaskState::Started => started_event(self.task_id),
            _ => completed_event(self.task_id),
        }
    }
}

/// Name of the debounced "new work" event for a group.
#[must_use]
pub fn created_event(group_key: &str) -> String {
    let prefix = group_key
        .split(GROUP_PREFIX_SEPARATOR)
        .next()
        .unwrap_or(group_key);
    format!("task:created:{prefix}")
}

/// Name of the event fired when a task is dequeued.
#[must_use]
pub fn started_event(task_id: TaskId) -> String {
    format!("task:started:{task_id}")
}

/// Name of the event fired when a task terminates.
#[must_use]
pub fn completed_event(task_id: TaskId) -> String {
    format!("task:completed:{task_id}")
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    event: String,
    task: TaskEvent,
}

/// Event bus tuning.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Window over which `created` events of one name collapse into one.
    /// Zero disables debouncing.
    pub debounce_window: Duration,
    /// Buffer of each local subscription channel.
    pub local_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(100),
            local_capacity: 256,
        }
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Events handed to [`EventBus::publish`].
    pub published: u64,
    /// Events delivered to at least one local channel.
    pub local_deliveries: u64,
    /// Envelopes sent through the transport.
    pub remote_sent: u64,
    /// Envelopes received from other processes.
    pub remote_received: u64,
    /// `created` events absorbed by a pending debounce.
    pub debounced: u64,
    /// Events kept local because they exceeded the transport's payload limit.
    pub oversized_fallbacks: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    local_deliveries: AtomicU64,
    remote_sent: AtomicU64,
    remote_received: AtomicU64,
    debounced: AtomicU64,
    oversized_fallbacks: AtomicU64,
}

struct PendingEmission {
    latest: TaskEvent,
    timer: Option<JoinHandle<()>>,
}

/// Local and cross-process fan-out of [`TaskEvent`]s.
pub struct EventBus {
    instance_id: Uuid,
    config: EventBusConfig,
    transport: Option<Arc<dyn NotificationTransport>>,
    channels: Mutex<HashMap<String, broadcast::Sender<TaskEvent>>>,
    pending: Mutex<HashMap<String, PendingEmission>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl EventBus {
    /// Bus with in-process delivery only.
    #[must_use]
    pub fn local(config: EventBusConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Bus that also fans out through `transport`. Call [`EventBus::start`]
    /// to begin receiving remote events.
    #[must_use]
    pub fn with_transport(
        config: EventBusConfig,
        transport: Arc<dyn NotificationTransport>,
    ) -> Arc<Self> {
        Self::build(config, Some(transport))
    }

    fn build(
        config: EventBusConfig,
        transport: Option<Arc<dyn NotificationTransport>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: Uuid::new_v4(),
            config,
            transport,
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Identity used to drop this bus's own echoes from the transport.
    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Spawn the task relaying transport payloads to local subscribers.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) {
        let Some(transport) = &self.transport else {
            return;
        };
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        let mut rx = transport.subscribe();
        let bus = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        let Some(bus) = bus.upgrade() else { break };
                        bus.on_remote(&payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagged behind transport");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("event listener stopped");
        }));
    }

    /// Subscribe to one event name.
    #[must_use]
    pub fn subscribe(&self, event: &str) -> broadcast::Receiver<TaskEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(event.to_owned())
            .or_insert_with(|| broadcast::channel(self.config.local_capacity.max(1)).0)
            .subscribe()
    }

    /// Publish an event. `created` events are debounced per name; everything
    /// else is emitted immediately.
    pub async fn publish(self: &Arc<Self>, event: TaskEvent) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if event.state == TaskState::Created && !self.config.debounce_window.is_zero() {
            self.debounce(event);
            return;
        }
        self.emit(event).await;
    }

    fn debounce(self: &Arc<Self>, event: TaskEvent) {
        let name = event.name();
        let mut pending = self.pending.lock();
        if let Some(slot) = pending.get_mut(&name) {
            slot.latest = event;
            self.counters.debounced.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let bus: Weak<Self> = Arc::downgrade(self);
        let window = self.config.debounce_window;
        let key = name.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(bus) = bus.upgrade() else { return };
            let flushed = bus.pending.lock().remove(&key);
            if let Some(slot) = flushed {
                bus.emit(slot.latest).await;
            }
        });
        pending.insert(
            name,
            PendingEmission {
                latest: event,
                timer: Some(timer),
            },
        );
    }

    async fn emit(&self, event: TaskEvent) {
        let name = event.name();
        self.deliver_local(&name, &event);

        let Some(transport) = &self.transport else {
            return;
        };
        if !transport.is_connected() {
            debug!(event = %name, "transport disconnected, delivered locally only");
            return;
        }
        let envelope = Envelope {
            origin: self.instance_id,
            event: name,
            task: event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(event = %envelope.event, error = %e, "failed to encode event");
                return;
            }
        };
        let max = transport.max_payload_bytes();
        if payload.len() > max {
            self.counters
                .oversized_fallbacks
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                event = %envelope.event,
                size = payload.len(),
                max,
                "event payload too large for transport, delivered locally only"
            );
            return;
        }
        match transport.notify(&payload).await {
            Ok(()) => {
                self.counters.remote_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!(event = %envelope.event, error = %e, "failed to notify transport"),
        }
    }

    fn on_remote(&self, payload: &str) {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed event payload");
                return;
            }
        };
        if envelope.origin == self.instance_id {
            return;
        }
        self.counters.remote_received.fetch_add(1, Ordering::Relaxed);
        self.deliver_local(&envelope.event, &envelope.task);
    }

    fn deliver_local(&self, name: &str, event: &TaskEvent) {
        let mut channels = self.channels.lock();
        let Some(tx) = channels.get(name) else {
            return;
        };
        if tx.send(event.clone()).is_ok() {
            self.counters
                .local_deliveries
                .fetch_add(1, Ordering::Relaxed);
        } else {
            // every receiver is gone
            channels.remove(name);
        }
    }

    /// Number of `created` names with a pending debounced emission.
    #[must_use]
    pub fn pending_debounces(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether remote delivery is currently possible.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            local_deliveries: self.counters.local_deliveries.load(Ordering::Relaxed),
            remote_sent: self.counters.remote_sent.load(Ordering::Relaxed),
            remote_received: self.counters.remote_received.load(Ordering::Relaxed),
            debounced: self.counters.debounced.load(Ordering::Relaxed),
            oversized_fallbacks: self.counters.oversized_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Stop the listener, drop pending debounced emissions, and close every
    /// local subscription.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        for (_, slot) in self.pending.lock().drain() {
            if let Some(timer) = slot.timer {
                timer.abort();
            }
        }
        self.channels.lock().clear();
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
