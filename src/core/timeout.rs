//! Timeout monitor: expires tasks that missed one of their deadlines.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::core::error::Result;
use crate::core::events::{EventBus, TaskEvent};
use crate::core::retry::RetryEngine;
use crate::core::store::{ExpiredTask, Store};
use crate::core::task::{Task, TaskState};
use crate::util::clock::{secs, Clock};

/// Which deadline a task missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// Never dequeued.
    CreatedToStartedTimeout,
    /// Executor stopped heartbeating.
    HeartbeatTimeout,
    /// Ran too long.
    StartedToCompletedTimeout,
}

impl ExpiryReason {
    /// Value stored in `last_error`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreatedToStartedTimeout => "created_to_started_timeout_exceeded",
            Self::HeartbeatTimeout => "heartbeat_timeout_exceeded",
            Self::StartedToCompletedTimeout => "started_to_completed_timeout_exceeded",
        }
    }
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The deadline `task` has missed at `now`, if any.
///
/// A created task's clock starts when it becomes eligible, so a delayed retry
/// is not expired before it could ever be dequeued.
#[must_use]
pub fn expiry_reason(task: &Task, now: DateTime<Utc>) -> Option<ExpiryReason> {
    match task.state {
        TaskState::Created
            if lapsed(task.starts_after, task.timeouts.created_to_started_secs, now) =>
        {
            Some(ExpiryReason::CreatedToStartedTimeout)
        }
        TaskState::Started if lapsed(task.last_heartbeat_at, task.timeouts.heartbeat_secs, now) => {
            Some(ExpiryReason::HeartbeatTimeout)
        }
        TaskState::Started
            if lapsed(
                task.last_state_transition_at,
                task.timeouts.started_to_completed_secs,
                now,
            ) =>
        {
            Some(ExpiryReason::StartedToCompletedTimeout)
        }
        _ => None,
    }
}

/// A deadline past the end of time never lapses.
fn lapsed(since: DateTime<Utc>, timeout_secs: u32, now: DateTime<Utc>) -> bool {
    since
        .checked_add_signed(secs(timeout_secs))
        .is_some_and(|deadline| deadline < now)
}

/// Periodic sweep over every non-terminated task.
pub struct TimeoutMonitor {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    retry: RetryEngine,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl TimeoutMonitor {
    /// Create a monitor ticking every `interval`.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        retry: RetryEngine,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            retry,
            clock,
            interval,
        }
    }

    /// Run one sweep; returns what it expired.
    pub async fn tick(&self) -> Result<Vec<ExpiredTask>> {
        let expired = self.store.expire_timed_out(self.clock.now()).await?;
        for item in &expired {
            info!(
                task_id = %item.task.id,
                group_key = %item.task.group_key,
                reason = %item.reason,
                "task expired"
            );
            if let Err(e) = self.retry.on_terminal(&item.task).await {
                error!(task_id = %item.task.id, error = %e, "failed to schedule retry for expired task");
            }
            self.bus.publish(TaskEvent::from_task(&item.task)).await;
        }
        Ok(expired)
    }

    /// Sweep until `shutdown` flips to true. Errors are logged and the next
    /// tick proceeds.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(expired) => debug!(count = expired.len(), "timeout sweep done"),
                        Err(e) => error!(error = %e, "timeout sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("timeout monitor stopped");
    }
}
