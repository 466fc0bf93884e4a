//! Recurring task templates.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::{Result, SchedulerError};
use crate::core::task::{validate_group_key, TaskId, TaskProps, TaskTimeouts};
use crate::util::clock::{saturating_add, to_time_delta};

/// Schedule identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Schedule lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleState {
    /// Producing tasks.
    Started,
    /// Temporarily not producing tasks.
    Paused,
    /// Soft-deleted.
    Deleted,
}

impl ScheduleState {
    /// Whether the state machine allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Started, Self::Paused | Self::Deleted)
                | (Self::Paused, Self::Started | Self::Deleted)
        )
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STARTED" => Ok(Self::Started),
            "PAUSED" => Ok(Self::Paused),
            "DELETED" => Ok(Self::Deleted),
            other => Err(SchedulerError::Backend(format!(
                "unknown schedule state `{other}`"
            ))),
        }
    }
}

/// A recurring template that periodically produces tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Identifier.
    pub id: ScheduleId,
    /// Unique name.
    pub name: String,
    /// Current state.
    pub state: ScheduleState,
    /// Instant the schedule becomes active.
    pub starts_at: DateTime<Utc>,
    /// Interval between runs.
    pub frequency: Duration,
    /// Template copied into each task.
    pub payload: Value,
    /// Concurrency domain of generated tasks.
    pub group_key: String,
    /// Group ceiling of generated tasks.
    pub group_max_concurrency: u32,
    /// Retry ceiling of generated tasks.
    pub retry_max: u32,
    /// Deadlines of generated tasks.
    pub timeouts: TaskTimeouts,
    /// Last task produced.
    pub last_scheduled_task_id: Option<TaskId>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete instant.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Build a `STARTED` schedule from validated props.
    #[must_use]
    pub fn from_props(props: ScheduleProps, now: DateTime<Utc>) -> Self {
        Self {
            id: ScheduleId::new(),
            name: props.name,
            state: ScheduleState::Started,
            starts_at: props.starts_at.unwrap_or(now),
            frequency: props.frequency,
            payload: props.payload,
            group_key: props.group_key,
            group_max_concurrency: props.group_max_concurrency,
            retry_max: props.retry_max,
            timeouts: props.timeouts,
            last_scheduled_task_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Next instant the schedule should run, given when its last task became
    /// eligible. Without a previous run the schedule waits one full period
    /// after `starts_at`.
    #[must_use]
    pub fn next_due_at(&self, last_run_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let reference = last_run_at.unwrap_or(self.starts_at);
        saturating_add(reference, to_time_delta(self.frequency))
    }

    /// Whether a task should be materialized at `now`.
    #[must_use]
    pub fn is_due(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.state == ScheduleState::Started
            && self.starts_at <= now
            && self.next_due_at(last_run_at) <= now
    }

    /// Props for the task this schedule produces at `now`. The name carries
    /// the creation timestamp so it stays informative across runs.
    #[must_use]
    pub fn task_props(&self, now: DateTime<Utc>) -> TaskProps {
        TaskProps {
            name: format!(
                "{}:{}",
                self.name,
                now.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            group_key: self.group_key.clone(),
            group_max_concurrency: self.group_max_concurrency,
            payload: self.payload.clone(),
            retry_max: self.retry_max,
            retry_count: 0,
            retry_key: None,
            starts_after: Some(now),
            timeouts: self.timeouts,
            schedule_id: Some(self.id),
        }
    }
}

/// Caller-supplied fields for a new schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleProps {
    /// Unique name.
    pub name: String,
    /// Interval between runs.
    pub frequency: Duration,
    /// Template payload.
    #[serde(default)]
    pub payload: Value,
    /// Concurrency domain.
    pub group_key: String,
    /// Group ceiling; 0 is unlimited.
    #[serde(default)]
    pub group_max_concurrency: u32,
    /// Retry ceiling.
    #[serde(default)]
    pub retry_max: u32,
    /// Deadlines.
    #[serde(default)]
    pub timeouts: TaskTimeouts,
    /// Activation instant; defaults to creation time.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
}

impl ScheduleProps {
    /// Props with default retry and timeout settings.
    pub fn new(
        name: impl Into<String>,
        group_key: impl Into<String>,
        frequency: Duration,
        payload: Value,
    ) -> Self {
        Self {
            name: name.into(),
            frequency,
            payload,
            group_key: group_key.into(),
            group_max_concurrency: 0,
            retry_max: 0,
            timeouts: TaskTimeouts::default(),
            starts_at: None,
        }
    }

    /// Check caller-supplied values.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "schedule name must not be empty".into(),
            ));
        }
        validate_frequency(self.frequency)?;
        validate_group_key(&self.group_key)?;
        self.timeouts.validate()
    }
}

fn validate_frequency(frequency: Duration) -> Result<()> {
    if frequency < Duration::from_secs(1) {
        return Err(SchedulerError::Validation(
            "schedule frequency must be at least one second".into(),
        ));
    }
    Ok(())
}

/// Mutable fields of an existing schedule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleUpdate {
    /// New interval.
    pub frequency: Option<Duration>,
    /// New template payload.
    pub payload: Option<Value>,
}

impl ScheduleUpdate {
    /// Check the new values.
    pub fn validate(&self) -> Result<()> {
        if let Some(frequency) = self.frequency {
            validate_frequency(frequency)?;
        }
        if self.frequency.is_none() && self.payload.is_none() {
            return Err(SchedulerError::Validation("empty schedule update".into()));
        }
        Ok(())
    }

    /// Apply onto a schedule.
    pub fn apply(&self, schedule: &mut Schedule, now: DateTime<Utc>) {
        if let Some(frequency) = self.frequency {
            schedule.frequency = frequency;
        }
        if let Some(payload) = &self.payload {
            schedule.payload = payload.clone();
        }
        schedule.updated_at = now;
    }
}

/// Move `schedule` to `to`, stamping audit fields.
pub fn apply_schedule_transition(
    schedule: &mut Schedule,
    to: ScheduleState,
    now: DateTime<Utc>,
) -> Result<()> {
    if !schedule.state.can_transition_to(to) {
        return Err(SchedulerError::InvalidScheduleTransition {
            from: schedule.state,
            to,
        });
    }
    schedule.state = to;
    schedule.updated_at = now;
    if to == ScheduleState::Deleted {
        schedule.deleted_at = Some(now);
    }
    Ok(())
}

/// Filter for schedule searches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleFilter {
    /// Restrict to these names.
    pub names: Option<Vec<String>>,
    /// Restrict to these states.
    pub states: Option<Vec<ScheduleState>>,
    /// Maximum rows; defaults to 100.
    pub limit: Option<usize>,
}

impl ScheduleFilter {
    /// Effective row cap.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(100)
    }

    /// Whether `schedule` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, schedule: &Schedule) -> bool {
        self.names
            .as_ref()
            .is_none_or(|names| names.contains(&schedule.name))
            && self
                .states
                .as_ref()
                .is_none_or(|states| states.contains(&schedule.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn hourly(now: DateTime<Utc>) -> Schedule {
        Schedule::from_props(
            ScheduleProps::new("sync-a", "sync", Duration::from_secs(3600), json!({"a": 1})),
            now,
        )
    }

    #[test]
    fn test_not_due_before_first_period() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let schedule = hourly(t0);
        assert!(!schedule.is_due(None, t0));
        assert!(!schedule.is_due(None, t0 + chrono::TimeDelta::minutes(59)));
        assert!(schedule.is_due(None, t0 + chrono::TimeDelta::hours(1)));
    }

    #[test]
    fn test_due_relative_to_last_run() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let schedule = hourly(t0);
        let last = t0 + chrono::TimeDelta::hours(1);
        assert!(!schedule.is_due(Some(last), last + chrono::TimeDelta::seconds(1)));
        assert!(schedule.is_due(Some(last), last + chrono::TimeDelta::hours(1)));
    }

    #[test]
    fn test_paused_is_never_due() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut schedule = hourly(t0);
        apply_schedule_transition(&mut schedule, ScheduleState::Paused, t0).unwrap();
        assert!(!schedule.is_due(None, t0 + chrono::TimeDelta::days(1)));
    }

    #[test]
    fn test_schedule_transitions() {
        let now = Utc::now();
        let mut schedule = hourly(now);
        assert!(apply_schedule_transition(&mut schedule, ScheduleState::Started, now).is_err());
        apply_schedule_transition(&mut schedule, ScheduleState::Deleted, now).unwrap();
        assert_eq!(schedule.deleted_at, Some(now));
        assert!(apply_schedule_transition(&mut schedule, ScheduleState::Started, now).is_err());
    }

    #[test]
    fn test_task_props_name_is_timestamped() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let props = hourly(t0).task_props(t0);
        assert_eq!(props.name, "sync-a:2024-01-01T00:00:00.000Z");
        assert_eq!(props.starts_after, Some(t0));
    }

    #[test]
    fn test_frequency_validation() {
        let props = ScheduleProps::new("s", "g", Duration::from_millis(10), json!({}));
        assert!(props.validate().is_err());
    }
}
