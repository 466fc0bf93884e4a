//! Task data model and lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::{Result, SchedulerError};
use crate::core::schedule::ScheduleId;
use crate::util::clock::secs;

/// Time-sortable task identifier (UUIDv7). Ordering by id is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SchedulerError::Validation(format!("invalid task id `{s}`: {e}")))
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting to be dequeued.
    Created,
    /// Claimed by an executor.
    Started,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// A deadline passed before completion.
    Expired,
    /// Cancelled by a caller.
    Cancelled,
}

impl TaskState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Created,
        Self::Started,
        Self::Succeeded,
        Self::Failed,
        Self::Expired,
        Self::Cancelled,
    ];

    /// Whether the state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match self {
            Self::Created => matches!(to, Self::Started | Self::Cancelled | Self::Expired),
            Self::Started => matches!(
                to,
                Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired
            ),
            _ => false,
        }
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| SchedulerError::Backend(format!("unknown task state `{s}`")))
    }
}

/// Per-task deadlines, copied into each task at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeouts {
    /// Max seconds between becoming eligible and being dequeued.
    pub created_to_started_secs: u32,
    /// Max seconds between dequeue and a terminal report.
    pub started_to_completed_secs: u32,
    /// Max seconds between heartbeats while started.
    pub heartbeat_secs: u32,
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            created_to_started_secs: 30,
            started_to_completed_secs: 30,
            heartbeat_secs: 60,
        }
    }
}

impl TaskTimeouts {
    /// Reject zero deadlines.
    pub fn validate(&self) -> Result<()> {
        if self.created_to_started_secs == 0 {
            return Err(SchedulerError::Validation(
                "created_to_started timeout must be greater than 0".into(),
            ));
        }
        if self.started_to_completed_secs == 0 {
            return Err(SchedulerError::Validation(
                "started_to_completed timeout must be greater than 0".into(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(SchedulerError::Validation(
                "heartbeat timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// A single dispatchable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier.
    pub id: TaskId,
    /// Informative name; not unique.
    pub name: String,
    /// Concurrency domain.
    pub group_key: String,
    /// Cap on simultaneously started tasks in the group; 0 is unlimited.
    pub group_max_concurrency: u32,
    /// Current state.
    pub state: TaskState,
    /// Set once the task reaches a terminal state.
    pub terminated: bool,
    /// Opaque data for the executor.
    pub payload: Value,
    /// Output reported on success.
    pub output: Option<Value>,
    /// Error reported on failure, expiry or cancellation.
    pub last_error: Option<String>,
    /// Shared by every task of a retry chain.
    pub retry_key: String,
    /// Attempts before this one.
    pub retry_count: u32,
    /// Attempt ceiling.
    pub retry_max: u32,
    /// Executor holding the task.
    pub owner_key: Option<String>,
    /// Originating schedule.
    pub schedule_id: Option<ScheduleId>,
    /// Earliest dequeue instant.
    pub starts_after: DateTime<Utc>,
    /// Deadlines.
    pub timeouts: TaskTimeouts,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Instant of the last state change.
    pub last_state_transition_at: DateTime<Utc>,
    /// Instant of the last heartbeat.
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh `CREATED` task from validated props.
    #[must_use]
    pub fn from_props(props: TaskProps, now: DateTime<Utc>) -> Self {
        let id = TaskId::new();
        Self {
            id,
            name: props.name,
            group_key: props.group_key,
            group_max_concurrency: props.group_max_concurrency,
            state: TaskState::Created,
            terminated: false,
            payload: props.payload,
            output: None,
            last_error: None,
            retry_key: props.retry_key.unwrap_or_else(|| id.to_string()),
            retry_count: props.retry_count,
            retry_max: props.retry_max,
            owner_key: None,
            schedule_id: props.schedule_id,
            starts_after: props.starts_after.unwrap_or(now),
            timeouts: props.timeouts,
            created_at: now,
            last_state_transition_at: now,
            last_heartbeat_at: now,
        }
    }

    /// Apply a transition in place. Callers must have checked
    /// [`TaskState::can_transition_to`].
    pub fn apply(&mut self, transition: &TaskTransition, now: DateTime<Utc>) {
        self.state = transition.to;
        self.terminated = transition.to.is_terminal();
        self.last_state_transition_at = now;
        if let Some(output) = &transition.output {
            self.output = Some(output.clone());
        }
        if let Some(error) = &transition.error {
            self.last_error = Some(error.clone());
        }
    }
}

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProps {
    /// Informative name.
    pub name: String,
    /// Concurrency domain.
    pub group_key: String,
    /// Group ceiling; 0 is unlimited.
    #[serde(default)]
    pub group_max_concurrency: u32,
    /// Opaque executor payload.
    #[serde(default)]
    pub payload: Value,
    /// Retry ceiling.
    #[serde(default)]
    pub retry_max: u32,
    /// Attempts so far; non-zero only for retry successors.
    #[serde(default)]
    pub retry_count: u32,
    /// Chain key; defaults to the new task's id.
    #[serde(default)]
    pub retry_key: Option<String>,
    /// Earliest dequeue instant; defaults to creation time.
    #[serde(default)]
    pub starts_after: Option<DateTime<Utc>>,
    /// Deadlines.
    #[serde(default)]
    pub timeouts: TaskTimeouts,
    /// Originating schedule.
    #[serde(default)]
    pub schedule_id: Option<ScheduleId>,
}

impl TaskProps {
    /// Props with default retry and timeout settings.
    pub fn new(name: impl Into<String>, group_key: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            group_key: group_key.into(),
            group_max_concurrency: 0,
            payload,
            retry_max: 0,
            retry_count: 0,
            retry_key: None,
            starts_after: None,
            timeouts: TaskTimeouts::default(),
            schedule_id: None,
        }
    }

    /// Set the group ceiling.
    #[must_use]
    pub const fn with_group_max_concurrency(mut self, max: u32) -> Self {
        self.group_max_concurrency = max;
        self
    }

    /// Set the retry ceiling.
    #[must_use]
    pub const fn with_retry_max(mut self, max: u32) -> Self {
        self.retry_max = max;
        self
    }

    /// Set the deadlines.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: TaskTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Delay eligibility.
    #[must_use]
    pub const fn with_starts_after(mut self, at: DateTime<Utc>) -> Self {
        self.starts_after = Some(at);
        self
    }

    /// Check caller-supplied values.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::Validation("task name must not be empty".into()));
        }
        validate_group_key(&self.group_key)?;
        if self.retry_count > self.retry_max {
            return Err(SchedulerError::Validation(format!(
                "retry_count {} exceeds retry_max {}",
                self.retry_count, self.retry_max
            )));
        }
        if matches!(&self.retry_key, Some(key) if key.trim().is_empty()) {
            return Err(SchedulerError::Validation("retry_key must not be empty".into()));
        }
        if let Some(at) = self.starts_after {
            if at
                .checked_add_signed(secs(self.timeouts.created_to_started_secs))
                .is_none()
            {
                return Err(SchedulerError::Validation(format!(
                    "starts_after {at} is out of range"
                )));
            }
        }
        self.timeouts.validate()
    }
}

pub(crate) fn validate_group_key(group_key: &str) -> Result<()> {
    if group_key.trim().is_empty() {
        return Err(SchedulerError::Validation("group_key must not be empty".into()));
    }
    if group_key.len() > 255 {
        return Err(SchedulerError::Validation(
            "group_key must be at most 255 characters".into(),
        ));
    }
    Ok(())
}

/// A requested state change.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    /// Target state.
    pub to: TaskState,
    /// Output to record.
    pub output: Option<Value>,
    /// Error to record.
    pub error: Option<String>,
}

impl TaskTransition {
    /// `STARTED -> SUCCEEDED` with output.
    #[must_use]
    pub const fn succeed(output: Value) -> Self {
        Self {
            to: TaskState::Succeeded,
            output: Some(output),
            error: None,
        }
    }

    /// `STARTED -> FAILED` with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            to: TaskState::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    /// `* -> CANCELLED` with a reason.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            to: TaskState::Cancelled,
            output: None,
            error: Some(reason.into()),
        }
    }
}

/// Result of a transition attempt that did not error.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The task moved to the requested state.
    Applied(Task),
    /// The task was already terminal; nothing changed.
    AlreadyTerminal(Task),
}

impl TransitionOutcome {
    /// The task as it now stands.
    #[must_use]
    pub fn task(&self) -> &Task {
        match self {
            Self::Applied(task) | Self::AlreadyTerminal(task) => task,
        }
    }

    /// Consume and return the task.
    #[must_use]
    pub fn into_task(self) -> Task {
        match self {
            Self::Applied(task) | Self::AlreadyTerminal(task) => task,
        }
    }
}

/// Decide what a transition request means for a task in its current state.
///
/// Shared by every store so the idempotency rules stay identical.
pub fn check_transition(task: &Task, to: TaskState) -> Result<bool> {
    if task.terminated && to.is_terminal() {
        return Ok(false);
    }
    if task.state.can_transition_to(to) {
        Ok(true)
    } else {
        Err(SchedulerError::InvalidTransition {
            from: task.state,
            to,
        })
    }
}

/// Filter for task searches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Restrict to these ids.
    pub ids: Option<Vec<TaskId>>,
    /// Restrict to one group.
    pub group_key: Option<String>,
    /// Restrict to these states.
    pub states: Option<Vec<TaskState>>,
    /// Restrict to one schedule.
    pub schedule_id: Option<ScheduleId>,
    /// Restrict to one retry chain.
    pub retry_key: Option<String>,
    /// Restrict to one attempt within a chain.
    pub retry_count: Option<u32>,
    /// Maximum rows; defaults to [`TaskFilter::DEFAULT_LIMIT`].
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Row cap when no limit is given.
    pub const DEFAULT_LIMIT: usize = 100;

    /// Effective row cap.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Whether `task` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&task.id))
            && self
                .group_key
                .as_ref()
                .is_none_or(|group| *group == task.group_key)
            && self
                .states
                .as_ref()
                .is_none_or(|states| states.contains(&task.state))
            && self
                .schedule_id
                .is_none_or(|id| task.schedule_id == Some(id))
            && self
                .retry_key
                .as_ref()
                .is_none_or(|key| *key == task.retry_key)
            && self.retry_count.is_none_or(|count| count == task.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_table() {
        assert!(TaskState::Created.can_transition_to(TaskState::Started));
        assert!(TaskState::Created.can_transition_to(TaskState::Expired));
        assert!(!TaskState::Created.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Created.can_transition_to(TaskState::Failed));
        assert!(TaskState::Started.can_transition_to(TaskState::Failed));
        assert!(!TaskState::Started.can_transition_to(TaskState::Created));
        for terminal in [
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Expired,
            TaskState::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for to in TaskState::ALL {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_check_transition_is_idempotent_on_terminal() {
        let now = Utc::now();
        let mut task = Task::from_props(TaskProps::new("t", "g", json!({})), now);
        task.apply(&TaskTransition::cancel("stop"), now);
        assert!(!check_transition(&task, TaskState::Succeeded).unwrap());
        assert!(check_transition(&task, TaskState::Started).is_err());
    }

    #[test]
    fn test_retry_key_defaults_to_id() {
        let task = Task::from_props(TaskProps::new("t", "g", json!(null)), Utc::now());
        assert_eq!(task.retry_key, task.id.to_string());
        assert_eq!(task.starts_after, task.created_at);
    }

    #[test]
    fn test_props_validation() {
        assert!(TaskProps::new("", "g", json!({})).validate().is_err());
        assert!(TaskProps::new("t", " ", json!({})).validate().is_err());
        let zero = TaskTimeouts {
            heartbeat_secs: 0,
            ..TaskTimeouts::default()
        };
        assert!(TaskProps::new("t", "g", json!({}))
            .with_timeouts(zero)
            .validate()
            .is_err());
        assert!(TaskProps::new("t", "g", json!({})).validate().is_ok());
    }

    #[test]
    fn test_far_future_start_is_rejected() {
        let props = TaskProps::new("t", "g", json!({})).with_starts_after(DateTime::<Utc>::MAX_UTC);
        assert!(matches!(props.validate(), Err(SchedulerError::Validation(_))));
        let soon = TaskProps::new("t", "g", json!({}))
            .with_starts_after(Utc::now() + chrono::TimeDelta::days(365));
        assert!(soon.validate().is_ok());
    }
}
