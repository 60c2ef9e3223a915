//! PostgreSQL [`Store`] implementation.
//!
//! Uses raw `sqlx::query`/`query_as` (not the compile-time `query!` macro,
//! since this crate ships without a live database for `cargo sqlx prepare` to
//! check against) over the three tables in `migrations/` (SPEC_FULL §3.5):
//! `workflow_executions`, `history_events`, `activity_tasks`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{ActivityOutcome, NewActivityTask, Store, StoreError};
use crate::model::{
    ActivityTask, HistoryEvent, HistoryEventType, TaskStatus, WorkflowExecution, WorkflowStatus,
    SPECIAL_POS,
};

/// PostgreSQL-backed [`Store`], built on a shared connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled migrations against `pool`. Call once at startup.
    pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }
}

fn workflow_status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "PENDING",
        WorkflowStatus::Running => "RUNNING",
        WorkflowStatus::Completed => "COMPLETED",
        WorkflowStatus::Failed => "FAILED",
        WorkflowStatus::Canceled => "CANCELED",
        WorkflowStatus::TimedOut => "TIMED_OUT",
    }
}

fn parse_workflow_status(s: &str) -> WorkflowStatus {
    match s {
        "PENDING" => WorkflowStatus::Pending,
        "RUNNING" => WorkflowStatus::Running,
        "COMPLETED" => WorkflowStatus::Completed,
        "FAILED" => WorkflowStatus::Failed,
        "CANCELED" => WorkflowStatus::Canceled,
        "TIMED_OUT" => WorkflowStatus::TimedOut,
        other => unreachable!("unknown workflow status persisted: {other}"),
    }
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "QUEUED",
        TaskStatus::Running => "RUNNING",
        TaskStatus::Completed => "COMPLETED",
        TaskStatus::Failed => "FAILED",
        TaskStatus::TimedOut => "TIMED_OUT",
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "QUEUED" => TaskStatus::Queued,
        "RUNNING" => TaskStatus::Running,
        "COMPLETED" => TaskStatus::Completed,
        "FAILED" => TaskStatus::Failed,
        "TIMED_OUT" => TaskStatus::TimedOut,
        other => unreachable!("unknown task status persisted: {other}"),
    }
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<WorkflowExecution, StoreError> {
    Ok(WorkflowExecution {
        id: row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_name: row.try_get("workflow_name").map_err(|e| StoreError::Database(e.to_string()))?,
        input: row.try_get("input").map_err(|e| StoreError::Database(e.to_string()))?,
        status: parse_workflow_status(row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?),
        result: row.try_get("result").map_err(|e| StoreError::Database(e.to_string()))?,
        error: row.try_get("error").map_err(|e| StoreError::Database(e.to_string()))?,
        started_at: row.try_get("started_at").map_err(|e| StoreError::Database(e.to_string()))?,
        finished_at: row.try_get("finished_at").map_err(|e| StoreError::Database(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| StoreError::Database(e.to_string()))?,
        expires_at: row.try_get("expires_at").map_err(|e| StoreError::Database(e.to_string()))?,
        parent: row.try_get("parent").map_err(|e| StoreError::Database(e.to_string()))?,
        parent_pos: row.try_get("parent_pos").map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<HistoryEvent, StoreError> {
    let type_str: String = row.try_get("type").map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(HistoryEvent {
        id: row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?,
        execution: row.try_get("execution").map_err(|e| StoreError::Database(e.to_string()))?,
        r#type: parse_event_type(&type_str),
        pos: row.try_get("pos").map_err(|e| StoreError::Database(e.to_string()))?,
        details: row.try_get("details").map_err(|e| StoreError::Database(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

fn parse_event_type(s: &str) -> HistoryEventType {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .unwrap_or_else(|_| unreachable!("unknown history event type persisted: {s}"))
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<ActivityTask, StoreError> {
    Ok(ActivityTask {
        id: row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?,
        execution: row.try_get("execution").map_err(|e| StoreError::Database(e.to_string()))?,
        activity_name: row.try_get("activity_name").map_err(|e| StoreError::Database(e.to_string()))?,
        pos: row.try_get("pos").map_err(|e| StoreError::Database(e.to_string()))?,
        args: row.try_get("args").map_err(|e| StoreError::Database(e.to_string()))?,
        kwargs: row.try_get("kwargs").map_err(|e| StoreError::Database(e.to_string()))?,
        status: parse_task_status(row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?),
        after_time: row.try_get("after_time").map_err(|e| StoreError::Database(e.to_string()))?,
        expires_at: row.try_get("expires_at").map_err(|e| StoreError::Database(e.to_string()))?,
        attempt: row.try_get::<i32, _>("attempt").map_err(|e| StoreError::Database(e.to_string()))? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(|e| StoreError::Database(e.to_string()))? as u32,
        retry_policy: row.try_get("retry_policy").map_err(|e| StoreError::Database(e.to_string()))?,
        heartbeat_timeout: row.try_get("heartbeat_timeout").map_err(|e| StoreError::Database(e.to_string()))?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(|e| StoreError::Database(e.to_string()))?,
        heartbeat_details: row.try_get("heartbeat_details").map_err(|e| StoreError::Database(e.to_string()))?,
        result: row.try_get("result").map_err(|e| StoreError::Database(e.to_string()))?,
        error: row.try_get("error").map_err(|e| StoreError::Database(e.to_string()))?,
        started_at: row.try_get("started_at").map_err(|e| StoreError::Database(e.to_string()))?,
        finished_at: row.try_get("finished_at").map_err(|e| StoreError::Database(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, execution))]
    async fn create_workflow(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_name, input, status, started_at, updated_at, expires_at, parent, parent_pos, runnable)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, true)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.workflow_name)
        .bind(&execution.input)
        .bind(workflow_status_str(execution.status))
        .bind(execution.started_at)
        .bind(execution.updated_at)
        .bind(execution.expires_at)
        .bind(execution.parent)
        .bind(execution.parent_pos)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create workflow: {e}");
            StoreError::Database(e.to_string())
        })?;
        debug!(execution = %execution.id, "created workflow execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        row_to_execution(&row)
    }

    #[instrument(skip(self))]
    async fn claim_workflow(
        &self,
        lease: std::time::Duration,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let now = Utc::now();
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET runnable = false, leased_until = $1
            WHERE id = (
                SELECT id FROM workflow_executions
                WHERE runnable = true
                  AND status IN ('PENDING', 'RUNNING')
                  AND (leased_until IS NULL OR leased_until <= $2)
                ORDER BY updated_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(row_to_execution).transpose()
    }

    #[instrument(skip(self))]
    async fn release_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflow_executions SET leased_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_runnable_if_active(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET runnable = true
            WHERE id = $1 AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'RUNNING', updated_at = now()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_activity_by_pos(&self, execution: Uuid, pos: i64) -> Result<Option<ActivityTask>, StoreError> {
        let row = sqlx::query("SELECT * FROM activity_tasks WHERE execution = $1 AND pos = $2")
            .bind(execution)
            .bind(pos)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self, result))]
    async fn finish_workflow(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2, result = $3, error = $4, finished_at = now(), updated_at = now()
            WHERE id = $1
              AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELED', 'TIMED_OUT')
            "#,
        )
        .bind(id)
        .bind(workflow_status_str(status))
        .bind(&result)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_workflow_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_executions
            WHERE status = 'RUNNING' AND expires_at IS NOT NULL AND expires_at <= $1
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn active_children(&self, parent: Uuid) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_executions
            WHERE parent = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELED', 'TIMED_OUT')
            "#,
        )
        .bind(parent)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self, details))]
    async fn append_event(
        &self,
        execution: Uuid,
        event_type: HistoryEventType,
        pos: i64,
        details: serde_json::Value,
    ) -> Result<HistoryEvent, StoreError> {
        let type_str = event_type.as_str();
        if pos == SPECIAL_POS {
            let row = sqlx::query(
                r#"
                INSERT INTO history_events (execution, type, pos, details)
                VALUES ($1, $2, $3, $4)
                RETURNING *
                "#,
            )
            .bind(execution)
            .bind(type_str)
            .bind(pos)
            .bind(&details)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            return row_to_event(&row);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO history_events (execution, type, pos, details)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (execution, pos, type) DO UPDATE SET execution = EXCLUDED.execution
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(execution)
        .bind(type_str)
        .bind(pos)
        .bind(&details)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let inserted: bool = row.try_get("inserted").map_err(|e| StoreError::Database(e.to_string()))?;
        let stored = row_to_event(&row)?;
        if !inserted && stored.details != details {
            return Err(StoreError::NonDeterministicReplay {
                execution,
                pos,
                event_type,
            });
        }
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, execution: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM history_events
            WHERE execution = $1
            ORDER BY (pos = $2), pos, id
            "#,
        )
        .bind(execution)
        .bind(SPECIAL_POS)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self, task))]
    async fn schedule_activity(&self, task: NewActivityTask) -> Result<ActivityTask, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO activity_tasks
                (id, execution, activity_name, pos, args, kwargs, status,
                 after_time, expires_at, attempt, max_attempts, retry_policy,
                 heartbeat_timeout, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'QUEUED', $7, $8, 0, $9, $10, $11, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(task.execution)
        .bind(&task.activity_name)
        .bind(task.pos)
        .bind(&task.args)
        .bind(&task.kwargs)
        .bind(task.after_time)
        .bind(task.expires_at)
        .bind(task.max_attempts as i32)
        .bind(&task.retry_policy)
        .bind(task.heartbeat_timeout)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_task(&row)
    }

    #[instrument(skip(self))]
    async fn get_activity(&self, id: Uuid) -> Result<ActivityTask, StoreError> {
        let row = sqlx::query("SELECT * FROM activity_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(id))?;
        row_to_task(&row)
    }

    #[instrument(skip(self))]
    async fn claim_due_activities(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE activity_tasks
            SET status = 'RUNNING', started_at = COALESCE(started_at, $1), updated_at = $1
            WHERE id IN (
                SELECT id FROM activity_tasks
                WHERE status = 'QUEUED' AND after_time <= $1
                ORDER BY after_time
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self, result))]
    async fn complete_activity(&self, id: Uuid, result: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE activity_tasks
            SET status = 'COMPLETED', result = $2, finished_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&result)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_activity(
        &self,
        id: Uuid,
        error: String,
        outcome: ActivityOutcome,
    ) -> Result<(), StoreError> {
        match outcome {
            ActivityOutcome::Retry { retry_at } => {
                sqlx::query(
                    r#"
                    UPDATE activity_tasks
                    SET status = 'QUEUED', error = $2, attempt = attempt + 1,
                        after_time = $3, started_at = NULL, updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&error)
                .bind(retry_at)
                .execute(&self.pool)
                .await
            }
            ActivityOutcome::Exhausted => {
                sqlx::query(
                    r#"
                    UPDATE activity_tasks
                    SET status = 'FAILED', error = $2, finished_at = now(), updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&error)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_activity(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE activity_tasks
            SET status = 'FAILED', error = $2, finished_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(crate::model::ErrorCode::WorkflowCanceled.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, details))]
    async fn heartbeat_activity(
        &self,
        id: Uuid,
        details: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE activity_tasks
            SET heartbeat_at = now(), heartbeat_details = COALESCE($2, heartbeat_details)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&details)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_activity_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM activity_tasks
            WHERE status = 'RUNNING' AND expires_at IS NOT NULL AND expires_at <= $1
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn due_heartbeat_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM activity_tasks
            WHERE status = 'RUNNING'
              AND heartbeat_timeout IS NOT NULL
              AND (EXTRACT(EPOCH FROM ($1 - COALESCE(heartbeat_at, started_at))) > heartbeat_timeout)
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn due_queued_activity_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM activity_tasks
            WHERE status = 'QUEUED' AND expires_at IS NOT NULL AND expires_at <= $1
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn set_activity_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE activity_tasks
            SET status = $2, error = COALESCE($3, error), finished_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(task_status_str(status))
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn queued_activities_for_execution(&self, execution: Uuid) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query("SELECT * FROM activity_tasks WHERE execution = $1 AND status = 'QUEUED'")
            .bind(execution)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }
}
