//! Tests for error types

use prometheus_orchestrator::core::{SchedulerError, TaskId, TaskState};

#[test]
fn test_validation_error_display() {
    let err = SchedulerError::Validation("group_key must not be empty".into());
    assert_eq!(err.to_string(), "validation error: group_key must not be empty");
}

#[test]
fn test_invalid_transition_display() {
    let err = SchedulerError::InvalidTransition {
        from: TaskState::Succeeded,
        to: TaskState::Started,
    };
    assert_eq!(
        err.to_string(),
        "invalid task transition from SUCCEEDED to STARTED"
    );
}

#[test]
fn test_task_failed_carries_error() {
    let id = TaskId::new();
    let err = SchedulerError::TaskFailed {
        task_id: id,
        error: "x".into(),
    };
    assert!(err.to_string().ends_with(": x"));
    assert!(err.to_string().contains(&id.to_string()));
}

#[test]
fn test_task_outcome_classification() {
    let id = TaskId::new();
    assert!(SchedulerError::TaskFailed { task_id: id, error: String::new() }.is_task_outcome());
    assert!(SchedulerError::TaskExpired { task_id: id, reason: String::new() }.is_task_outcome());
    assert!(SchedulerError::TaskCancelled { task_id: id, reason: String::new() }.is_task_outcome());
    assert!(!SchedulerError::TaskNotFound(id).is_task_outcome());
    assert!(!SchedulerError::ExecuteTimeout(id).is_task_outcome());
    assert!(!SchedulerError::Backend("down".into()).is_task_outcome());
}

#[test]
fn test_serialization_error_conversion() {
    let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: SchedulerError = parse.into();
    assert!(matches!(err, SchedulerError::Serialization(_)));
}

#[test]
fn test_into_anyhow() {
    fn fails() -> prometheus_orchestrator::core::AppResult<()> {
        Err(SchedulerError::Config("missing url".into()).into())
    }
    let err = fails().unwrap_err();
    assert_eq!(err.to_string(), "config error: missing url");
}
