//! In-memory store for development and tests.
//!
//! A single mutex stands in for the database transaction, so every operation
//! is atomic. The scheduling advisory lock is emulated separately so tests can
//! hold it and observe a contending tick being turned away.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::concurrency::available_slots;
use crate::core::error::{Result, SchedulerError};
use crate::core::schedule::{
    apply_schedule_transition, Schedule, ScheduleFilter, ScheduleId, ScheduleProps, ScheduleState,
    ScheduleUpdate,
};
use crate::core::store::{
    CleanupReport, DequeueRequest, ExpiredTask, ScheduleFailure, SchedulingTick, Store,
};
use crate::core::task::{
    check_transition, Task, TaskFilter, TaskId, TaskProps, TaskState, TaskTransition,
    TransitionOutcome,
};
use crate::core::timeout::expiry_reason;

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskId, Task>,
    schedules: BTreeMap<ScheduleId, Schedule>,
}

impl State {
    fn insert_task(&mut self, props: TaskProps, now: DateTime<Utc>) -> Task {
        let task = Task::from_props(props, now);
        self.tasks.insert(task.id, task.clone());
        task
    }

    fn last_run_at(&self, schedule: &Schedule) -> Option<DateTime<Utc>> {
        schedule
            .last_scheduled_task_id
            .and_then(|id| self.tasks.get(&id))
            .map(|task| task.starts_after)
    }

    fn schedule_mut(&mut self, id: ScheduleId) -> Result<&mut Schedule> {
        self.schedules
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::ScheduleNotFound(id.to_string()))
    }
}

/// Holds the emulated scheduling lock until dropped.
pub struct SchedulingLockGuard<'a> {
    lock: &'a AtomicBool,
}

impl Drop for SchedulingLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release);
    }
}

/// Task and schedule storage backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    scheduling_lock: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the scheduling lock, as a tick would. Returns `None` when
    /// another holder has it.
    pub fn try_scheduling_lock(&self) -> Option<SchedulingLockGuard<'_>> {
        self.scheduling_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SchedulingLockGuard {
                lock: &self.scheduling_lock,
            })
    }

    /// Number of stored tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, props: TaskProps, now: DateTime<Utc>) -> Result<Task> {
        Ok(self.state.lock().insert_task(props, now))
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.state
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    async fn search_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .take(filter.effective_limit())
            .cloned()
            .collect())
    }

    async fn heartbeat(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound(id))?;
        if !task.terminated {
            task.last_heartbeat_at = now;
        }
        Ok(task.clone())
    }

    async fn transition_task(
        &self,
        id: TaskId,
        transition: TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound(id))?;
        if !check_transition(task, transition.to)? {
            return Ok(TransitionOutcome::AlreadyTerminal(task.clone()));
        }
        task.apply(&transition, now);
        Ok(TransitionOutcome::Applied(task.clone()))
    }

    async fn dequeue(&self, request: &DequeueRequest, now: DateTime<Utc>) -> Result<Vec<Task>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        let in_group = |task: &&Task| task.group_key == request.group_key;
        let started = state
            .tasks
            .values()
            .filter(in_group)
            .filter(|task| task.state == TaskState::Started)
            .count();
        let eligible: Vec<(TaskId, u32)> = state
            .tasks
            .values()
            .filter(in_group)
            .filter(|task| task.state == TaskState::Created && task.starts_after <= now)
            .map(|task| (task.id, task.group_max_concurrency))
            .collect();
        let Some(&(_, ceiling)) = eligible.first() else {
            return Ok(Vec::new());
        };
        let take = available_slots(ceiling, started, request.limit);

        let mut claimed = Vec::with_capacity(take);
        for (id, _) in eligible.into_iter().take(take) {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.state = TaskState::Started;
                task.last_state_transition_at = now;
                task.last_heartbeat_at = now;
                if let Some(owner) = &request.owner_key {
                    task.owner_key = Some(owner.clone());
                }
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn expire_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        for task in state.tasks.values_mut().filter(|task| !task.terminated) {
            if let Some(reason) = expiry_reason(task, now) {
                task.apply(
                    &TaskTransition {
                        to: TaskState::Expired,
                        output: None,
                        error: Some(reason.to_string()),
                    },
                    now,
                );
                expired.push(ExpiredTask {
                    task: task.clone(),
                    reason,
                });
            }
        }
        Ok(expired)
    }

    async fn create_schedule(&self, props: ScheduleProps, now: DateTime<Utc>) -> Result<Schedule> {
        let mut state = self.state.lock();
        if state.schedules.values().any(|s| s.name == props.name) {
            return Err(SchedulerError::DuplicateSchedule(props.name));
        }
        let schedule = Schedule::from_props(props, now);
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.state
            .lock()
            .schedules
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::ScheduleNotFound(id.to_string()))
    }

    async fn get_schedule_by_name(&self, name: &str) -> Result<Schedule> {
        self.state
            .lock()
            .schedules
            .values()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| SchedulerError::ScheduleNotFound(name.to_owned()))
    }

    async fn search_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        Ok(self
            .state
            .lock()
            .schedules
            .values()
            .filter(|s| filter.matches(s))
            .take(filter.effective_limit())
            .cloned()
            .collect())
    }

    async fn transition_schedule(
        &self,
        id: ScheduleId,
        to: ScheduleState,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let mut state = self.state.lock();
        let schedule = state.schedule_mut(id)?;
        apply_schedule_transition(schedule, to, now)?;
        Ok(schedule.clone())
    }

    async fn update_schedule(
        &self,
        id: ScheduleId,
        update: &ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let mut state = self.state.lock();
        let schedule = state.schedule_mut(id)?;
        if schedule.state == ScheduleState::Deleted {
            return Err(SchedulerError::Validation(format!(
                "schedule {id} is deleted"
            )));
        }
        update.apply(schedule, now);
        Ok(schedule.clone())
    }

    async fn trigger_schedule(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<Task> {
        let mut state = self.state.lock();
        let props = {
            let schedule = state.schedule_mut(id)?;
            if schedule.state == ScheduleState::Deleted {
                return Err(SchedulerError::Validation(format!(
                    "schedule {id} is deleted"
                )));
            }
            schedule.task_props(now)
        };
        let task = state.insert_task(props, now);
        let schedule = state.schedule_mut(id)?;
        schedule.last_scheduled_task_id = Some(task.id);
        schedule.updated_at = now;
        Ok(task)
    }

    async fn materialize_due_schedules(&self, now: DateTime<Utc>) -> Result<SchedulingTick> {
        let Some(_lock) = self.try_scheduling_lock() else {
            return Ok(SchedulingTick::LockNotGranted);
        };
        let mut state = self.state.lock();
        let due: Vec<ScheduleId> = state
            .schedules
            .values()
            .filter(|s| s.is_due(state.last_run_at(s), now))
            .map(|s| s.id)
            .collect();

        let mut created = Vec::with_capacity(due.len());
        let mut failures = Vec::new();
        for id in due {
            let schedule = state.schedule_mut(id)?;
            let props = schedule.task_props(now);
            if let Err(e) = props.validate() {
                failures.push(ScheduleFailure {
                    schedule_id: id,
                    schedule_name: schedule.name.clone(),
                    error: e.to_string(),
                });
                continue;
            }
            let task = state.insert_task(props, now);
            let schedule = state.schedule_mut(id)?;
            schedule.last_scheduled_task_id = Some(task.id);
            schedule.updated_at = now;
            created.push(task);
        }
        Ok(SchedulingTick::Completed { created, failures })
    }

    async fn cleanup(
        &self,
        tasks_before: DateTime<Utc>,
        schedules_before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<CleanupReport> {
        let mut state = self.state.lock();
        let referenced: HashSet<TaskId> = state
            .schedules
            .values()
            .filter_map(|s| s.last_scheduled_task_id)
            .collect();
        let stale_tasks: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.terminated && t.starts_after < tasks_before)
            .filter(|t| !referenced.contains(&t.id))
            .map(|t| t.id)
            .take(batch_size)
            .collect();
        for id in &stale_tasks {
            state.tasks.remove(id);
        }

        let stale_schedules: Vec<ScheduleId> = state
            .schedules
            .values()
            .filter(|s| s.state == ScheduleState::Deleted)
            .filter(|s| s.deleted_at.is_some_and(|at| at < schedules_before))
            .map(|s| s.id)
            .take(batch_size)
            .collect();
        for id in &stale_schedules {
            state.schedules.remove(id);
            state.tasks.retain(|_, task| task.schedule_id != Some(*id));
        }

        Ok(CleanupReport {
            tasks_deleted: stale_tasks.len(),
            schedules_deleted: stale_schedules.len(),
        })
    }
}
