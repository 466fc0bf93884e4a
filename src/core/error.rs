//! Error types for orchestrator operations.

use thiserror::Error;

use crate::core::schedule::ScheduleState;
use crate::core::task::{TaskId, TaskState};

/// Errors produced by orchestrator components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A task or schedule specification was rejected.
    #[error("validation error: {0}")]
    Validation(String),
    /// No task exists with the given id.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// No schedule exists with the given id or name.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),
    /// A live schedule already uses this name.
    #[error("duplicate schedule name: {0}")]
    DuplicateSchedule(String),
    /// The task state machine does not allow this move.
    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },
    /// The schedule state machine does not allow this move.
    #[error("invalid schedule transition from {from} to {to}")]
    InvalidScheduleTransition {
        /// Current state.
        from: ScheduleState,
        /// Requested state.
        to: ScheduleState,
    },
    /// An executed task ended in `FAILED`.
    #[error("task {task_id} failed: {error}")]
    TaskFailed {
        /// The last task of the retry chain.
        task_id: TaskId,
        /// The task's `last_error`.
        error: String,
    },
    /// An executed task ended in `EXPIRED`.
    #[error("task {task_id} expired: {reason}")]
    TaskExpired {
        /// The expired task.
        task_id: TaskId,
        /// Which deadline was exceeded.
        reason: String,
    },
    /// An executed task ended in `CANCELLED`.
    #[error("task {task_id} cancelled: {reason}")]
    TaskCancelled {
        /// The cancelled task.
        task_id: TaskId,
        /// Reason given by the canceller.
        reason: String,
    },
    /// `execute` gave up waiting before the task terminated.
    #[error("timed out waiting for task {0}")]
    ExecuteTimeout(TaskId),
    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Database driver failure.
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),
}

impl SchedulerError {
    /// Whether the error describes a task that reached a non-successful
    /// terminal state, as opposed to a failure of the orchestrator itself.
    #[must_use]
    pub const fn is_task_outcome(&self) -> bool {
        matches!(
            self,
            Self::TaskFailed { .. } | Self::TaskExpired { .. } | Self::TaskCancelled { .. }
        )
    }
}

/// Library result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = std::result::Result<T, anyhow::Error>;
