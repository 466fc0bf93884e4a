//! Client façade used by callers and by the executor fleet.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::core::error::{Result, SchedulerError};
use crate::core::events::{completed_event, created_event, EventBus, TaskEvent};
use crate::core::retry::RetryEngine;
use crate::core::schedule::{
    Schedule, ScheduleFilter, ScheduleId, ScheduleProps, ScheduleState, ScheduleUpdate,
};
use crate::core::store::{DequeueRequest, Store};
use crate::core::task::{
    validate_group_key, Task, TaskFilter, TaskId, TaskProps, TaskState, TaskTransition,
    TransitionOutcome,
};
use crate::util::clock::Clock;

/// What to schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleRequest {
    /// A one-off task, eligible right away or at `starts_after`.
    Immediate(TaskProps),
    /// A recurring schedule.
    Recurring(ScheduleProps),
}

/// Id returned by [`Orchestrator::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledId {
    /// A task was created.
    Task(TaskId),
    /// A schedule was created.
    Schedule(ScheduleId),
}

/// Waiting behaviour of [`Orchestrator::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteSettings {
    /// How often the store is re-read in case an event was missed.
    pub poll_interval: Duration,
    /// Deadline used when the caller gives none.
    pub default_timeout: Duration,
}

impl Default for ExecuteSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(300),
        }
    }
}

enum Settled {
    Done(Result<Value>),
    Follow(TaskId),
    Pending,
}

/// Entry point for scheduling, executing and reporting on tasks.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    retry: RetryEngine,
    clock: Arc<dyn Clock>,
    execute: ExecuteSettings,
}

impl Orchestrator {
    /// Assemble a façade over shared components.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        retry: RetryEngine,
        clock: Arc<dyn Clock>,
        execute: ExecuteSettings,
    ) -> Self {
        Self {
            store,
            bus,
            retry,
            clock,
            execute,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The event bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Validate and persist a task or schedule.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduledId> {
        match request {
            ScheduleRequest::Immediate(props) => {
                let task = self.create_task(props).await?;
                Ok(ScheduledId::Task(task.id))
            }
            ScheduleRequest::Recurring(props) => {
                props.validate()?;
                let schedule = self.store.create_schedule(props, self.clock.now()).await?;
                info!(schedule_id = %schedule.id, name = %schedule.name, "schedule created");
                Ok(ScheduledId::Schedule(schedule.id))
            }
        }
    }

    async fn create_task(&self, props: TaskProps) -> Result<Task> {
        props.validate()?;
        let task = self.store.create_task(props, self.clock.now()).await?;
        debug!(task_id = %task.id, group_key = %task.group_key, "task created");
        self.bus.publish(TaskEvent::from_task(&task)).await;
        Ok(task)
    }

    /// Create a task and wait until it, or the last task of its retry chain,
    /// terminates. Returns the output on success.
    ///
    /// Waiting wakes on the task's completion event and re-reads the store
    /// every poll interval, so a lost notification only costs latency.
    /// Dropping the future stops waiting without touching the task.
    pub async fn execute(&self, props: TaskProps, timeout: Option<Duration>) -> Result<Value> {
        let deadline =
            tokio::time::Instant::now() + timeout.unwrap_or(self.execute.default_timeout);
        let task = self.create_task(props).await?;
        let mut current = task.id;
        let mut events = Some(self.bus.subscribe(&completed_event(current)));
        let mut missing_successor = None;

        loop {
            let task = self.store.get_task(current).await?;
            if task.terminated {
                match self.settle(&task, &mut missing_successor).await? {
                    Settled::Done(result) => return result,
                    Settled::Follow(next) => {
                        debug!(task_id = %current, successor_id = %next, "following retry");
                        current = next;
                        events = Some(self.bus.subscribe(&completed_event(current)));
                        continue;
                    }
                    Settled::Pending => {}
                }
            }

            tokio::select! {
                received = next_event(&mut events) => {
                    if matches!(received, Err(broadcast::error::RecvError::Closed)) {
                        events = None;
                    }
                }
                () = tokio::time::sleep(self.execute.poll_interval) => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(SchedulerError::ExecuteTimeout(current));
                }
            }
        }
    }

    /// Outcome of a terminated task. A retry successor that is not there yet
    /// is waited for once; if it is still missing on the next look the chain
    /// ends with this task's error.
    async fn settle(&self, task: &Task, missing_successor: &mut Option<TaskId>) -> Result<Settled> {
        match task.state {
            TaskState::Succeeded => Ok(Settled::Done(Ok(task
                .output
                .clone()
                .unwrap_or(Value::Null)))),
            TaskState::Failed | TaskState::Expired if self.retry.policy().should_retry(task) => {
                if let Some(next) = self.successor_of(task).await? {
                    return Ok(Settled::Follow(next.id));
                }
                if missing_successor.replace(task.id) == Some(task.id) {
                    warn!(task_id = %task.id, retry_key = %task.retry_key, "retry successor missing, giving up");
                    return Ok(Settled::Done(Err(terminal_error(task))));
                }
                Ok(Settled::Pending)
            }
            _ => Ok(Settled::Done(Err(terminal_error(task)))),
        }
    }

    async fn successor_of(&self, task: &Task) -> Result<Option<Task>> {
        let mut found = self
            .store
            .search_tasks(&TaskFilter {
                retry_key: Some(task.retry_key.clone()),
                retry_count: Some(task.retry_count + 1),
                limit: Some(1),
                ..TaskFilter::default()
            })
            .await?;
        Ok(found.pop())
    }

    /// Claim up to `limit` tasks of `group_key`.
    pub async fn dequeue(&self, group_key: &str, limit: usize) -> Result<Vec<Task>> {
        self.dequeue_with(DequeueRequest::new(group_key, limit))
            .await
    }

    /// Claim tasks, optionally long-polling for new work.
    pub async fn dequeue_with(&self, request: DequeueRequest) -> Result<Vec<Task>> {
        validate_group_key(&request.group_key)?;
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut created = request
            .wait
            .map(|_| self.bus.subscribe(&created_event(&request.group_key)));

        let tasks = self.claim(&request).await?;
        let Some(wait) = request.wait else {
            return Ok(tasks);
        };
        if !tasks.is_empty() {
            return Ok(tasks);
        }
        tokio::select! {
            _ = next_event(&mut created) => {}
            () = tokio::time::sleep(wait) => {}
        }
        self.claim(&request).await
    }

    async fn claim(&self, request: &DequeueRequest) -> Result<Vec<Task>> {
        let tasks = self.store.dequeue(request, self.clock.now()).await?;
        for task in &tasks {
            self.bus.publish(TaskEvent::from_task(task)).await;
        }
        Ok(tasks)
    }

    /// Record that the executor holding `task_id` is alive.
    pub async fn heartbeat(&self, task_id: TaskId) -> Result<Task> {
        self.store.heartbeat(task_id, self.clock.now()).await
    }

    /// Report success. A task that already terminated is returned unchanged.
    pub async fn succeed(&self, task_id: TaskId, output: Value) -> Result<Task> {
        self.finish(task_id, TaskTransition::succeed(output)).await
    }

    /// Report failure; may create a retry successor. A task that already
    /// terminated is returned unchanged and no successor is created.
    pub async fn fail(&self, task_id: TaskId, error: impl Into<String>) -> Result<Task> {
        self.finish(task_id, TaskTransition::fail(error)).await
    }

    /// Cancel a created or started task.
    pub async fn cancel(&self, task_id: TaskId, reason: impl Into<String>) -> Result<Task> {
        self.finish(task_id, TaskTransition::cancel(reason)).await
    }

    async fn finish(&self, task_id: TaskId, transition: TaskTransition) -> Result<Task> {
        let to = transition.to;
        let task = match self
            .store
            .transition_task(task_id, transition, self.clock.now())
            .await?
        {
            TransitionOutcome::Applied(task) => task,
            TransitionOutcome::AlreadyTerminal(task) => {
                debug!(task_id = %task.id, state = %task.state, requested = %to, "task already terminated");
                return Ok(task);
            }
        };
        // successor first so a woken waiter can already find it
        if let Err(e) = self.retry.on_terminal(&task).await {
            error!(task_id = %task.id, error = %e, "failed to schedule retry");
        }
        self.bus.publish(TaskEvent::from_task(&task)).await;
        Ok(task)
    }

    /// Fetch a task.
    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        self.store.get_task(task_id).await
    }

    /// Tasks matching `filter`.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.search_tasks(filter).await
    }

    /// Fetch a schedule by name.
    pub async fn get_schedule(&self, name: &str) -> Result<Schedule> {
        self.store.get_schedule_by_name(name).await
    }

    /// Fetch a schedule by id.
    pub async fn get_schedule_by_id(&self, id: ScheduleId) -> Result<Schedule> {
        self.store.get_schedule(id).await
    }

    /// Schedules matching `filter`.
    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        self.store.search_schedules(filter).await
    }

    /// Stop producing tasks.
    pub async fn pause_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.transition_schedule(id, ScheduleState::Paused).await
    }

    /// Resume producing tasks.
    pub async fn resume_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.transition_schedule(id, ScheduleState::Started).await
    }

    /// Soft-delete.
    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.transition_schedule(id, ScheduleState::Deleted).await
    }

    async fn transition_schedule(&self, id: ScheduleId, to: ScheduleState) -> Result<Schedule> {
        let schedule = self
            .store
            .transition_schedule(id, to, self.clock.now())
            .await?;
        info!(schedule_id = %id, state = %schedule.state, "schedule transitioned");
        Ok(schedule)
    }

    /// Change frequency or payload.
    pub async fn update_schedule(&self, id: ScheduleId, update: ScheduleUpdate) -> Result<Schedule> {
        update.validate()?;
        self.store
            .update_schedule(id, &update, self.clock.now())
            .await
    }

    /// Run a schedule now instead of waiting for its next due time.
    pub async fn trigger_schedule(&self, id: ScheduleId) -> Result<Task> {
        let task = self.store.trigger_schedule(id, self.clock.now()).await?;
        self.bus.publish(TaskEvent::from_task(&task)).await;
        Ok(task)
    }
}

fn terminal_error(task: &Task) -> SchedulerError {
    let reason = task.last_error.clone().unwrap_or_default();
    match task.state {
        TaskState::Cancelled => SchedulerError::TaskCancelled {
            task_id: task.id,
            reason,
        },
        TaskState::Expired => SchedulerError::TaskExpired {
            task_id: task.id,
            reason,
        },
        _ => SchedulerError::TaskFailed {
            task_id: task.id,
            error: reason,
        },
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<TaskEvent>>,
) -> std::result::Result<TaskEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
