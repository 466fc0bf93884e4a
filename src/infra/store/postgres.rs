//! Postgres-backed store.
//!
//! Tables live in the `orchestrator` schema. Dequeue claims rows with
//! `FOR UPDATE SKIP LOCKED` under a per-group transaction lock, the scheduling
//! tick runs under `pg_try_advisory_xact_lock`, and sweeps are single
//! `UPDATE ... WHERE` statements.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Acquire, FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::core::concurrency::{available_slots, group_lock_name};
use crate::core::error::{Result, SchedulerError};
use crate::core::schedule::{
    Schedule, ScheduleFilter, ScheduleId, ScheduleProps, ScheduleState, ScheduleUpdate,
};
use crate::core::store::{
    CleanupReport, DequeueRequest, ExpiredTask, ScheduleFailure, SchedulingTick, Store,
};
use crate::core::task::{
    check_transition, Task, TaskFilter, TaskId, TaskProps, TaskState, TaskTimeouts,
    TaskTransition, TransitionOutcome,
};
use crate::core::timeout::ExpiryReason;

/// Advisory lock key held for the duration of a scheduling tick.
pub const SCHEDULING_LOCK_KEY: i64 = 5_003_001;

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    payload: Json<Value>,
    group_key: String,
    group_max_concurrency: i32,
    retry_max: i32,
    retry_count: i32,
    retry_key: String,
    owner_key: Option<String>,
    starts_after: DateTime<Utc>,
    created_to_started_timeout_secs: i32,
    started_to_completed_timeout_secs: i32,
    heartbeat_timeout_secs: i32,
    created_at: DateTime<Utc>,
    state: String,
    last_state_transition_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    output: Option<Json<Value>>,
    last_error: Option<String>,
    terminated: bool,
    schedule_id: Option<Uuid>,
}

#[derive(Debug, FromRow)]
struct ScheduleRow {
    id: Uuid,
    name: String,
    state: String,
    starts_at: DateTime<Utc>,
    frequency_ms: i64,
    payload: Json<Value>,
    group_key: String,
    group_max_concurrency: i32,
    retry_max: i32,
    created_to_started_timeout_secs: i32,
    started_to_completed_timeout_secs: i32,
    heartbeat_timeout_secs: i32,
    last_scheduled_task_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| SchedulerError::Backend(format!("negative value in column `{column}`")))
}

fn to_i32(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| SchedulerError::Validation(format!("`{field}` is too large")))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn frequency_ms(frequency: Duration) -> Result<i64> {
    i64::try_from(frequency.as_millis())
        .map_err(|_| SchedulerError::Validation("frequency is too large".into()))
}

impl TryFrom<TaskRow> for Task {
    type Error = SchedulerError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: TaskId(row.id),
            name: row.name,
            group_key: row.group_key,
            group_max_concurrency: to_u32(row.group_max_concurrency, "group_max_concurrency")?,
            state: row.state.parse()?,
            terminated: row.terminated,
            payload: row.payload.0,
            output: row.output.map(|json| json.0),
            last_error: row.last_error,
            retry_key: row.retry_key,
            retry_count: to_u32(row.retry_count, "retry_count")?,
            retry_max: to_u32(row.retry_max, "retry_max")?,
            owner_key: row.owner_key,
            schedule_id: row.schedule_id.map(ScheduleId),
            starts_after: row.starts_after,
            timeouts: TaskTimeouts {
                created_to_started_secs: to_u32(
                    row.created_to_started_timeout_secs,
                    "created_to_started_timeout_secs",
                )?,
                started_to_completed_secs: to_u32(
                    row.started_to_completed_timeout_secs,
                    "started_to_completed_timeout_secs",
                )?,
                heartbeat_secs: to_u32(row.heartbeat_timeout_secs, "heartbeat_timeout_secs")?,
            },
            created_at: row.created_at,
            last_state_transition_at: row.last_state_transition_at,
            last_heartbeat_at: row.last_heartbeat_at,
        })
    }
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = SchedulerError;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        let frequency_ms = u64::try_from(row.frequency_ms)
            .map_err(|_| SchedulerError::Backend("negative schedule frequency".into()))?;
        Ok(Self {
            id: ScheduleId(row.id),
            name: row.name,
            state: row.state.parse()?,
            starts_at: row.starts_at,
            frequency: Duration::from_millis(frequency_ms),
            payload: row.payload.0,
            group_key: row.group_key,
            group_max_concurrency: to_u32(row.group_max_concurrency, "group_max_concurrency")?,
            retry_max: to_u32(row.retry_max, "retry_max")?,
            timeouts: TaskTimeouts {
                created_to_started_secs: to_u32(
                    row.created_to_started_timeout_secs,
                    "created_to_started_timeout_secs",
                )?,
                started_to_completed_secs: to_u32(
                    row.started_to_completed_timeout_secs,
                    "started_to_completed_timeout_secs",
                )?,
                heartbeat_secs: to_u32(row.heartbeat_timeout_secs, "heartbeat_timeout_secs")?,
            },
            last_scheduled_task_id: row.last_scheduled_task_id.map(TaskId),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn tasks_from_rows(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

fn state_names(states: &[TaskState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_owned()).collect()
}

const INSERT_TASK: &str = r"
INSERT INTO orchestrator.tasks (
    id, name, payload, group_key, group_max_concurrency, retry_max, retry_count, retry_key,
    owner_key, starts_after, created_to_started_timeout_secs, started_to_completed_timeout_secs,
    heartbeat_timeout_secs, created_at, state, last_state_transition_at, last_heartbeat_at,
    output, last_error, terminated, schedule_id
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
RETURNING *";

async fn insert_task(
    conn: &mut sqlx::PgConnection,
    props: TaskProps,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = Task::from_props(props, now);
    let row: TaskRow = sqlx::query_as(INSERT_TASK)
        .bind(task.id.0)
        .bind(&task.name)
        .bind(Json(&task.payload))
        .bind(&task.group_key)
        .bind(to_i32(task.group_max_concurrency, "group_max_concurrency")?)
        .bind(to_i32(task.retry_max, "retry_max")?)
        .bind(to_i32(task.retry_count, "retry_count")?)
        .bind(&task.retry_key)
        .bind(&task.owner_key)
        .bind(task.starts_after)
        .bind(to_i32(task.timeouts.created_to_started_secs, "created_to_started_secs")?)
        .bind(to_i32(task.timeouts.started_to_completed_secs, "started_to_completed_secs")?)
        .bind(to_i32(task.timeouts.heartbeat_secs, "heartbeat_secs")?)
        .bind(task.created_at)
        .bind(task.state.as_str())
        .bind(task.last_state_transition_at)
        .bind(task.last_heartbeat_at)
        .bind(task.output.as_ref().map(Json))
        .bind(&task.last_error)
        .bind(task.terminated)
        .bind(task.schedule_id.map(|id| id.0))
        .fetch_one(conn)
        .await?;
    Task::try_from(row)
}

/// Task and schedule storage in Postgres.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// The connection pool, shared with the notification transport.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns SQL migration statements for the orchestrator schema.
    #[must_use]
    pub fn migrations() -> &'static [&'static str] {
        &[
            "CREATE SCHEMA IF NOT EXISTS orchestrator",
            r"
CREATE TABLE IF NOT EXISTS orchestrator.schedules (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    starts_at TIMESTAMPTZ NOT NULL,
    frequency_ms BIGINT NOT NULL,
    payload JSONB NOT NULL,
    group_key TEXT NOT NULL,
    group_max_concurrency INTEGER NOT NULL DEFAULT 0,
    retry_max INTEGER NOT NULL DEFAULT 0,
    created_to_started_timeout_secs INTEGER NOT NULL,
    started_to_completed_timeout_secs INTEGER NOT NULL,
    heartbeat_timeout_secs INTEGER NOT NULL,
    last_scheduled_task_id UUID,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    deleted_at TIMESTAMPTZ
)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_schedules_name ON orchestrator.schedules (name)",
            "CREATE INDEX IF NOT EXISTS idx_schedules_state_starts_at ON orchestrator.schedules (state, starts_at)",
            r"
CREATE TABLE IF NOT EXISTS orchestrator.tasks (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    payload JSONB NOT NULL,
    group_key TEXT NOT NULL,
    group_max_concurrency INTEGER NOT NULL DEFAULT 0,
    retry_max INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    retry_key TEXT NOT NULL,
    owner_key TEXT,
    starts_after TIMESTAMPTZ NOT NULL,
    created_to_started_timeout_secs INTEGER NOT NULL,
    started_to_completed_timeout_secs INTEGER NOT NULL,
    heartbeat_timeout_secs INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    state TEXT NOT NULL,
    last_state_transition_at TIMESTAMPTZ NOT NULL,
    last_heartbeat_at TIMESTAMPTZ NOT NULL,
    output JSONB,
    last_error TEXT,
    terminated BOOLEAN NOT NULL DEFAULT FALSE,
    schedule_id UUID REFERENCES orchestrator.schedules (id) ON DELETE CASCADE
)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_group_key_state ON orchestrator.tasks (group_key, state, starts_after)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_retry_key ON orchestrator.tasks (retry_key)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_schedule_id ON orchestrator.tasks (schedule_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_active ON orchestrator.tasks (state) WHERE terminated = FALSE",
        ]
    }

    /// Apply [`PostgresStore::migrations`]. Statements are idempotent.
    pub async fn migrate(&self) -> Result<()> {
        for statement in Self::migrations() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_task(
        conn: &mut sqlx::PgConnection,
        id: TaskId,
        lock: bool,
    ) -> Result<Option<Task>> {
        let sql = if lock {
            "SELECT * FROM orchestrator.tasks WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT * FROM orchestrator.tasks WHERE id = $1"
        };
        let row: Option<TaskRow> = sqlx::query_as(sql).bind(id.0).fetch_optional(conn).await?;
        row.map(Task::try_from).transpose()
    }

    async fn fetch_schedule(
        tx: &mut Transaction<'_, Postgres>,
        id: ScheduleId,
    ) -> Result<Schedule> {
        let row: Option<ScheduleRow> =
            sqlx::query_as("SELECT * FROM orchestrator.schedules WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut **tx)
                .await?;
        row.map(Schedule::try_from)
            .transpose()?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(id.to_string()))
    }

    async fn set_last_scheduled(
        conn: &mut sqlx::PgConnection,
        schedule_id: ScheduleId,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orchestrator.schedules SET last_scheduled_task_id = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(schedule_id.0)
        .bind(task_id.0)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_task(&self, props: TaskProps, now: DateTime<Utc>) -> Result<Task> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut conn, props, now).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_task(&mut conn, id, false)
            .await?
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    async fn search_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let ids: Option<Vec<Uuid>> = filter
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0).collect());
        let states: Option<Vec<String>> = filter.states.as_deref().map(state_names);
        let retry_count = filter
            .retry_count
            .map(|count| to_i32(count, "retry_count"))
            .transpose()?;
        let rows: Vec<TaskRow> = sqlx::query_as(
            r"
SELECT * FROM orchestrator.tasks
WHERE ($1::uuid[] IS NULL OR id = ANY($1))
  AND ($2::text IS NULL OR group_key = $2)
  AND ($3::text[] IS NULL OR state = ANY($3))
  AND ($4::uuid IS NULL OR schedule_id = $4)
  AND ($5::text IS NULL OR retry_key = $5)
  AND ($6::integer IS NULL OR retry_count = $6)
ORDER BY id
LIMIT $7",
        )
        .bind(ids)
        .bind(&filter.group_key)
        .bind(states)
        .bind(filter.schedule_id.map(|id| id.0))
        .bind(&filter.retry_key)
        .bind(retry_count)
        .bind(to_i64(filter.effective_limit()))
        .fetch_all(&self.pool)
        .await?;
        tasks_from_rows(rows)
    }

    async fn heartbeat(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE orchestrator.tasks SET last_heartbeat_at = $2 WHERE id = $1 AND terminated = FALSE RETURNING *",
        )
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Task::try_from(row),
            None => self.get_task(id).await,
        }
    }

    async fn transition_task(
        &self,
        id: TaskId,
        transition: TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let task = Self::fetch_task(&mut tx, id, true)
            .await?
            .ok_or(SchedulerError::TaskNotFound(id))?;
        if !check_transition(&task, transition.to)? {
            tx.rollback().await?;
            return Ok(TransitionOutcome::AlreadyTerminal(task));
        }
        let row: TaskRow = sqlx::query_as(
            r"
UPDATE orchestrator.tasks
SET state = $2,
    terminated = $3,
    last_state_transition_at = $4,
    output = COALESCE($5, output),
    last_error = COALESCE($6, last_error)
WHERE id = $1
RETURNING *",
        )
        .bind(id.0)
        .bind(transition.to.as_str())
        .bind(transition.to.is_terminal())
        .bind(now)
        .bind(transition.output.map(Json))
        .bind(transition.error)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(TransitionOutcome::Applied(Task::try_from(row)?))
    }

    async fn dequeue(&self, request: &DequeueRequest, now: DateTime<Utc>) -> Result<Vec<Task>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(group_lock_name(&request.group_key))
            .execute(&mut *tx)
            .await?;

        let started: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orchestrator.tasks WHERE group_key = $1 AND state = 'STARTED'",
        )
        .bind(&request.group_key)
        .fetch_one(&mut *tx)
        .await?;
        let ceiling: Option<i32> = sqlx::query_scalar(
            r"
SELECT group_max_concurrency FROM orchestrator.tasks
WHERE group_key = $1 AND state = 'CREATED' AND starts_after <= $2
ORDER BY id
LIMIT 1",
        )
        .bind(&request.group_key)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(ceiling) = ceiling else {
            tx.rollback().await?;
            return Ok(Vec::new());
        };
        let take = available_slots(
            to_u32(ceiling, "group_max_concurrency")?,
            usize::try_from(started).unwrap_or(usize::MAX),
            request.limit,
        );
        if take == 0 {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows: Vec<TaskRow> = sqlx::query_as(
            r"
WITH picked AS (
    SELECT id FROM orchestrator.tasks
    WHERE group_key = $1 AND state = 'CREATED' AND starts_after <= $2
    ORDER BY id
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE orchestrator.tasks t
SET state = 'STARTED',
    last_state_transition_at = $2,
    last_heartbeat_at = $2,
    owner_key = COALESCE($4, t.owner_key)
FROM picked
WHERE t.id = picked.id
RETURNING t.*",
        )
        .bind(&request.group_key)
        .bind(now)
        .bind(to_i64(take))
        .bind(&request.owner_key)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut tasks = tasks_from_rows(rows)?;
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    async fn expire_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r"
WITH expired AS (
    SELECT id,
        CASE
            WHEN state = 'CREATED' THEN $2
            WHEN last_heartbeat_at + heartbeat_timeout_secs * INTERVAL '1 second' < $1 THEN $3
            ELSE $4
        END AS reason
    FROM orchestrator.tasks
    WHERE terminated = FALSE
      AND (
        (state = 'CREATED' AND starts_after + created_to_started_timeout_secs * INTERVAL '1 second' < $1)
        OR (state = 'STARTED' AND last_heartbeat_at + heartbeat_timeout_secs * INTERVAL '1 second' < $1)
        OR (state = 'STARTED' AND last_state_transition_at + started_to_completed_timeout_secs * INTERVAL '1 second' < $1)
      )
    FOR UPDATE SKIP LOCKED
)
UPDATE orchestrator.tasks t
SET state = 'EXPIRED',
    terminated = TRUE,
    last_state_transition_at = $1,
    last_error = expired.reason
FROM expired
WHERE t.id = expired.id
RETURNING t.*",
        )
        .bind(now)
        .bind(ExpiryReason::CreatedToStartedTimeout.as_str())
        .bind(ExpiryReason::HeartbeatTimeout.as_str())
        .bind(ExpiryReason::StartedToCompletedTimeout.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut expired = Vec::with_capacity(rows.len());
        for task in tasks_from_rows(rows)? {
            let reason = match task.last_error.as_deref() {
                Some(r) if r == ExpiryReason::CreatedToStartedTimeout.as_str() => {
                    ExpiryReason::CreatedToStartedTimeout
                }
                Some(r) if r == ExpiryReason::HeartbeatTimeout.as_str() => {
                    ExpiryReason::HeartbeatTimeout
                }
                _ => ExpiryReason::StartedToCompletedTimeout,
            };
            expired.push(ExpiredTask { task, reason });
        }
        Ok(expired)
    }

    async fn create_schedule(&self, props: ScheduleProps, now: DateTime<Utc>) -> Result<Schedule> {
        let schedule = Schedule::from_props(props, now);
        let inserted: std::result::Result<ScheduleRow, sqlx::Error> = sqlx::query_as(
            r"
INSERT INTO orchestrator.schedules (
    id, name, state, starts_at, frequency_ms, payload, group_key, group_max_concurrency,
    retry_max, created_to_started_timeout_secs, started_to_completed_timeout_secs,
    heartbeat_timeout_secs, last_scheduled_task_id, created_at, updated_at, deleted_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL, $13, $13, NULL)
RETURNING *",
        )
        .bind(schedule.id.0)
        .bind(&schedule.name)
        .bind(schedule.state.as_str())
        .bind(schedule.starts_at)
        .bind(frequency_ms(schedule.frequency)?)
        .bind(Json(&schedule.payload))
        .bind(&schedule.group_key)
        .bind(to_i32(schedule.group_max_concurrency, "group_max_concurrency")?)
        .bind(to_i32(schedule.retry_max, "retry_max")?)
        .bind(to_i32(schedule.timeouts.created_to_started_secs, "created_to_started_secs")?)
        .bind(to_i32(schedule.timeouts.started_to_completed_secs, "started_to_completed_secs")?)
        .bind(to_i32(schedule.timeouts.heartbeat_secs, "heartbeat_secs")?)
        .bind(now)
        .fetch_one(&self.pool)
        .await;
        match inserted {
            Ok(row) => Schedule::try_from(row),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(SchedulerError::DuplicateSchedule(schedule.name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        let row: Option<ScheduleRow> =
            sqlx::query_as("SELECT * FROM orchestrator.schedules WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Schedule::try_from)
            .transpose()?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(id.to_string()))
    }

    async fn get_schedule_by_name(&self, name: &str) -> Result<Schedule> {
        let row: Option<ScheduleRow> =
            sqlx::query_as("SELECT * FROM orchestrator.schedules WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Schedule::try_from)
            .transpose()?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(name.to_owned()))
    }

    async fn search_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let states: Option<Vec<String>> = filter
            .states
            .as_ref()
            .map(|states| states.iter().map(|s| s.as_str().to_owned()).collect());
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r"
SELECT * FROM orchestrator.schedules
WHERE ($1::text[] IS NULL OR name = ANY($1))
  AND ($2::text[] IS NULL OR state = ANY($2))
ORDER BY id
LIMIT $3",
        )
        .bind(&filter.names)
        .bind(states)
        .bind(to_i64(filter.effective_limit()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn transition_schedule(
        &self,
        id: ScheduleId,
        to: ScheduleState,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_schedule(&mut tx, id).await?;
        if !current.state.can_transition_to(to) {
            tx.rollback().await?;
            return Err(SchedulerError::InvalidScheduleTransition {
                from: current.state,
                to,
            });
        }
        let row: ScheduleRow = sqlx::query_as(
            r"
UPDATE orchestrator.schedules
SET state = $2,
    updated_at = $3,
    deleted_at = CASE WHEN $2 = 'DELETED' THEN $3 ELSE deleted_at END
WHERE id = $1
RETURNING *",
        )
        .bind(id.0)
        .bind(to.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Schedule::try_from(row)
    }

    async fn update_schedule(
        &self,
        id: ScheduleId,
        update: &ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_schedule(&mut tx, id).await?;
        if current.state == ScheduleState::Deleted {
            tx.rollback().await?;
            return Err(SchedulerError::Validation(format!("schedule {id} is deleted")));
        }
        let frequency = update.frequency.map(frequency_ms).transpose()?;
        let row: ScheduleRow = sqlx::query_as(
            r"
UPDATE orchestrator.schedules
SET frequency_ms = COALESCE($2, frequency_ms),
    payload = COALESCE($3, payload),
    updated_at = $4
WHERE id = $1
RETURNING *",
        )
        .bind(id.0)
        .bind(frequency)
        .bind(update.payload.as_ref().map(Json))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Schedule::try_from(row)
    }

    async fn trigger_schedule(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let schedule = Self::fetch_schedule(&mut tx, id).await?;
        if schedule.state == ScheduleState::Deleted {
            tx.rollback().await?;
            return Err(SchedulerError::Validation(format!("schedule {id} is deleted")));
        }
        let task = insert_task(&mut tx, schedule.task_props(now), now).await?;
        Self::set_last_scheduled(&mut tx, id, task.id, now).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn materialize_due_schedules(&self, now: DateTime<Utc>) -> Result<SchedulingTick> {
        let mut tx = self.pool.begin().await?;
        let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(SCHEDULING_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;
        if !granted {
            tx.rollback().await?;
            return Ok(SchedulingTick::LockNotGranted);
        }

        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r"
SELECT s.* FROM orchestrator.schedules s
LEFT JOIN orchestrator.tasks t ON t.id = s.last_scheduled_task_id
WHERE s.state = 'STARTED'
  AND s.starts_at <= $1
  AND COALESCE(t.starts_after, s.starts_at) + s.frequency_ms * INTERVAL '1 millisecond' <= $1
ORDER BY s.id
FOR UPDATE OF s",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut created = Vec::with_capacity(rows.len());
        let mut failures = Vec::new();
        for row in rows {
            let schedule = Schedule::try_from(row)?;
            let props = schedule.task_props(now);
            let attempt = async {
                props.validate()?;
                let mut savepoint = Acquire::begin(&mut tx).await?;
                let task = insert_task(&mut savepoint, props, now).await?;
                Self::set_last_scheduled(&mut savepoint, schedule.id, task.id, now).await?;
                savepoint.commit().await?;
                Ok::<Task, SchedulerError>(task)
            }
            .await;
            match attempt {
                Ok(task) => created.push(task),
                Err(e) => failures.push(ScheduleFailure {
                    schedule_id: schedule.id,
                    schedule_name: schedule.name.clone(),
                    error: e.to_string(),
                }),
            }
        }
        tx.commit().await?;
        Ok(SchedulingTick::Completed { created, failures })
    }

    async fn cleanup(
        &self,
        tasks_before: DateTime<Utc>,
        schedules_before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<CleanupReport> {
        let limit = to_i64(batch_size);
        let tasks = sqlx::query(
            r"
DELETE FROM orchestrator.tasks
WHERE id IN (
    SELECT t.id FROM orchestrator.tasks t
    WHERE t.terminated = TRUE
      AND t.starts_after < $1
      AND NOT EXISTS (
        SELECT 1 FROM orchestrator.schedules s WHERE s.last_scheduled_task_id = t.id
      )
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)",
        )
        .bind(tasks_before)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        let schedules = sqlx::query(
            r"
DELETE FROM orchestrator.schedules
WHERE id IN (
    SELECT id FROM orchestrator.schedules
    WHERE state = 'DELETED' AND deleted_at < $1
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)",
        )
        .bind(schedules_before)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(CleanupReport {
            tasks_deleted: usize::try_from(tasks.rows_affected()).unwrap_or(usize::MAX),
            schedules_deleted: usize::try_from(schedules.rows_affected()).unwrap_or(usize::MAX),
        })
    }
}
