//! Smoke tests against a live Postgres. Run with
//! `DATABASE_URL=postgres://... cargo test -- --ignored`.

#![cfg(feature = "postgres")]

use std::time::Duration;

use chrono::Utc;
use prometheus_orchestrator::core::{
    DequeueRequest, ScheduleProps, SchedulingTick, SchedulerError, Store, TaskFilter, TaskProps,
    TaskState, TaskTransition, TransitionOutcome,
};
use prometheus_orchestrator::infra::store::postgres::SCHEDULING_LOCK_KEY;
use prometheus_orchestrator::infra::store::PostgresStore;
use serde_json::json;
use uuid::Uuid;

async fn store() -> PostgresStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PostgresStore::connect(&url, 5).await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_dequeue_respects_ceiling() {
    let store = store().await;
    let group = unique("ceiling");
    let now = Utc::now();
    for _ in 0..5 {
        store
            .create_task(
                TaskProps::new("t", &group, json!({})).with_group_max_concurrency(2),
                now,
            )
            .await
            .unwrap();
    }
    let first = store.dequeue(&DequeueRequest::new(&group, 10), now).await.unwrap();
    assert_eq!(first.len(), 2);
    let second = store.dequeue(&DequeueRequest::new(&group, 10), now).await.unwrap();
    assert!(second.is_empty());

    let created = store
        .search_tasks(&TaskFilter {
            group_key: Some(group.clone()),
            states: Some(vec![TaskState::Created]),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(created.len(), 3);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_terminal_transition_idempotent() {
    let store = store().await;
    let group = unique("terminal");
    let now = Utc::now();
    store.create_task(TaskProps::new("t", &group, json!({})), now).await.unwrap();
    let task = store
        .dequeue(&DequeueRequest::new(&group, 1), now)
        .await
        .unwrap()
        .remove(0);

    let applied = store
        .transition_task(task.id, TaskTransition::succeed(json!(1)), now)
        .await
        .unwrap();
    assert!(matches!(applied, TransitionOutcome::Applied(_)));
    let again = store
        .transition_task(task.id, TaskTransition::fail("late"), now)
        .await
        .unwrap();
    assert!(matches!(again, TransitionOutcome::AlreadyTerminal(ref t) if t.state == TaskState::Succeeded));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_schedule_materialization_and_lock() {
    let store = store().await;
    let name = unique("hourly");
    let start = Utc::now() - chrono::TimeDelta::hours(2);
    let mut props = ScheduleProps::new(&name, unique("reports"), Duration::from_secs(3600), json!({}));
    props.starts_at = Some(start);
    let schedule = store.create_schedule(props.clone(), start).await.unwrap();

    let dup = store.create_schedule(props, start).await.unwrap_err();
    assert!(matches!(dup, SchedulerError::DuplicateSchedule(_)));

    let mut holder = store.pool().acquire().await.unwrap();
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(SCHEDULING_LOCK_KEY)
        .execute(&mut *holder)
        .await
        .unwrap();
    assert!(matches!(
        store.materialize_due_schedules(Utc::now()).await.unwrap(),
        SchedulingTick::LockNotGranted
    ));
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(SCHEDULING_LOCK_KEY)
        .execute(&mut *holder)
        .await
        .unwrap();
    drop(holder);

    let tick = store.materialize_due_schedules(Utc::now()).await.unwrap();
    let SchedulingTick::Completed { created, .. } = tick else {
        panic!("lock should be free");
    };
    assert!(created.iter().any(|t| t.schedule_id == Some(schedule.id)));

    let refreshed = store.get_schedule(schedule.id).await.unwrap();
    assert!(refreshed.last_scheduled_task_id.is_some());
}
