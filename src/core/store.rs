//! Persistence contract for tasks and schedules.
//!
//! Implementations own every transactional guarantee the orchestrator relies
//! on: a dequeue never exceeds a group's ceiling, a timeout sweep expires a
//! task at most once, and a scheduling tick runs under a store-wide advisory
//! lock. Callers pass `now` explicitly so behaviour follows the caller's clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::error::Result;
use crate::core::schedule::{
    Schedule, ScheduleFilter, ScheduleId, ScheduleProps, ScheduleState, ScheduleUpdate,
};
use crate::core::task::{Task, TaskFilter, TaskId, TaskProps, TaskTransition, TransitionOutcome};
use crate::core::timeout::ExpiryReason;

/// Arguments of a dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeueRequest {
    /// Group to claim from.
    pub group_key: String,
    /// Maximum tasks to claim.
    pub limit: usize,
    /// Executor identity recorded on claimed tasks.
    pub owner_key: Option<String>,
    /// How long to wait for new work when nothing is eligible.
    pub wait: Option<Duration>,
}

impl DequeueRequest {
    /// Non-waiting request without an owner.
    pub fn new(group_key: impl Into<String>, limit: usize) -> Self {
        Self {
            group_key: group_key.into(),
            limit,
            owner_key: None,
            wait: None,
        }
    }

    /// Record `owner` on claimed tasks.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_key = Some(owner.into());
        self
    }

    /// Long-poll for up to `wait` when the group is empty.
    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

/// A task expired by a timeout sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredTask {
    /// The task after expiry.
    pub task: Task,
    /// Which deadline it missed.
    pub reason: ExpiryReason,
}

/// A schedule whose task could not be created during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFailure {
    /// The schedule.
    pub schedule_id: ScheduleId,
    /// Schedule name, for logs.
    pub schedule_name: String,
    /// What went wrong.
    pub error: String,
}

/// Outcome of one scheduling tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulingTick {
    /// Another process holds the scheduling lock.
    LockNotGranted,
    /// The tick ran.
    Completed {
        /// Tasks materialized from due schedules.
        created: Vec<Task>,
        /// Per-schedule failures; the rest of the batch still committed.
        failures: Vec<ScheduleFailure>,
    },
}

/// Rows removed by a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Terminated tasks removed.
    pub tasks_deleted: usize,
    /// Soft-deleted schedules removed.
    pub schedules_deleted: usize,
}

/// Transactional storage of tasks and schedules.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new `CREATED` task.
    async fn create_task(&self, props: TaskProps, now: DateTime<Utc>) -> Result<Task>;

    /// Fetch a task.
    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Tasks matching `filter`, ordered by id.
    async fn search_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Record executor liveness. Terminal tasks are returned unchanged.
    async fn heartbeat(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task>;

    /// Atomically move a task along the state machine.
    async fn transition_task(
        &self,
        id: TaskId,
        transition: TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome>;

    /// Claim eligible tasks of a group without exceeding its ceiling.
    async fn dequeue(&self, request: &DequeueRequest, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Expire every task past one of its deadlines.
    async fn expire_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>>;

    /// Insert a new `STARTED` schedule; the name must be unused.
    async fn create_schedule(&self, props: ScheduleProps, now: DateTime<Utc>) -> Result<Schedule>;

    /// Fetch a schedule by id.
    async fn get_schedule(&self, id: ScheduleId) -> Result<Schedule>;

    /// Fetch a schedule by name.
    async fn get_schedule_by_name(&self, name: &str) -> Result<Schedule>;

    /// Schedules matching `filter`, ordered by id.
    async fn search_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>>;

    /// Pause, resume, or soft-delete.
    async fn transition_schedule(
        &self,
        id: ScheduleId,
        to: ScheduleState,
        now: DateTime<Utc>,
    ) -> Result<Schedule>;

    /// Change frequency or payload of a live schedule.
    async fn update_schedule(
        &self,
        id: ScheduleId,
        update: &ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Schedule>;

    /// Materialize a task from a schedule right away, outside the tick.
    async fn trigger_schedule(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<Task>;

    /// One scheduling tick under the store-wide advisory lock.
    async fn materialize_due_schedules(&self, now: DateTime<Utc>) -> Result<SchedulingTick>;

    /// Hard-delete terminated tasks eligible before `tasks_before` that no
    /// schedule points at, and soft-deleted schedules deleted before
    /// `schedules_before`, at most `batch_size` of each.
    async fn cleanup(
        &self,
        tasks_before: DateTime<Utc>,
        schedules_before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<CleanupReport>;
}
