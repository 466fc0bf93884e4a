//! Retry policy and successor creation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::core::error::Result;
use crate::core::events::{EventBus, TaskEvent};
use crate::core::store::Store;
use crate::core::task::{Task, TaskProps, TaskState};
use crate::util::clock::{saturating_add, to_time_delta, Clock};

/// When and how failed tasks are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Treat `EXPIRED` like `FAILED` for retry eligibility.
    pub retry_expired: bool,
    /// Delay before the first retry; zero retries immediately.
    pub base_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_expired: false,
            base_delay: Duration::ZERO,
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (1-based): `base * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() || attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Whether a task that just terminated in its current state gets a successor.
    #[must_use]
    pub const fn should_retry(&self, task: &Task) -> bool {
        let eligible_state = match task.state {
            TaskState::Failed => true,
            TaskState::Expired => self.retry_expired,
            _ => false,
        };
        eligible_state && task.retry_count < task.retry_max
    }

    /// Props of the successor of `task`, or `None` when the failure is final.
    #[must_use]
    pub fn successor(&self, task: &Task, now: DateTime<Utc>) -> Option<TaskProps> {
        if !self.should_retry(task) {
            return None;
        }
        let attempt = task.retry_count + 1;
        Some(TaskProps {
            name: task.name.clone(),
            group_key: task.group_key.clone(),
            group_max_concurrency: task.group_max_concurrency,
            payload: task.payload.clone(),
            retry_max: task.retry_max,
            retry_count: attempt,
            retry_key: Some(task.retry_key.clone()),
            starts_after: Some(saturating_add(now, to_time_delta(self.delay_for(attempt)))),
            timeouts: task.timeouts,
            schedule_id: task.schedule_id,
        })
    }
}

/// Applies a [`RetryPolicy`] to tasks that just reached a terminal state.
#[derive(Clone)]
pub struct RetryEngine {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RetryEngine {
    /// Create an engine.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            policy,
        }
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Create the successor of `task` if the policy allows one. Must only be
    /// called once per actual terminal transition.
    pub async fn on_terminal(&self, task: &Task) -> Result<Option<Task>> {
        let Some(props) = self.policy.successor(task, self.clock.now()) else {
            return Ok(None);
        };
        let successor = self.store.create_task(props, self.clock.now()).await?;
        info!(
            task_id = %task.id,
            successor_id = %successor.id,
            retry_key = %successor.retry_key,
            attempt = successor.retry_count,
            "retry scheduled"
        );
        self.bus.publish(TaskEvent::from_task(&successor)).await;
        Ok(Some(successor))
    }
}
