//! Core scheduling abstractions: data model, state machine, engines and workers.

pub mod cleanup;
pub mod concurrency;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod retry;
pub mod schedule;
pub mod scheduling;
pub mod store;
pub mod task;
pub mod timeout;

pub use cleanup::CleanupWorker;
pub use concurrency::available_slots;
pub use error::{AppResult, Result, SchedulerError};
pub use events::{
    completed_event, created_event, started_event, EventBus, EventBusConfig, EventBusStats,
    NotificationTransport, TaskEvent,
};
pub use orchestrator::{ExecuteSettings, Orchestrator, ScheduleRequest, ScheduledId};
pub use retry::{RetryEngine, RetryPolicy};
pub use schedule::{
    Schedule, ScheduleFilter, ScheduleId, ScheduleProps, ScheduleState, ScheduleUpdate,
};
pub use scheduling::SchedulingWorker;
pub use store::{
    CleanupReport, DequeueRequest, ExpiredTask, ScheduleFailure, SchedulingTick, Store,
};
pub use task::{
    Task, TaskFilter, TaskId, TaskProps, TaskState, TaskTimeouts, TaskTransition,
    TransitionOutcome,
};
pub use timeout::{expiry_reason, ExpiryReason, TimeoutMonitor};
