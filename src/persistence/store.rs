//! The `Store` trait (C2): the single persistence seam every other
//! component — `ReplayContext`, the Stepper, the activity runner, and the
//! Dispatcher — talks to. Two implementations exist: [`InMemoryStore`] for
//! tests and [`PostgresStore`] for production.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{ActivityTask, HistoryEvent, HistoryEventType, TaskStatus, WorkflowExecution, WorkflowStatus};

/// Errors surfaced by a [`Store`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow execution not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("activity task not found: {0}")]
    TaskNotFound(Uuid),

    /// Raised by `append_event` when a non-special-slot event at the same
    /// `(execution, pos, type)` already exists with different `details` —
    /// a replay-determinism violation (SPEC_FULL §3.2).
    #[error("history slot {execution}/{pos} ({event_type:?}) already recorded with different details")]
    NonDeterministicReplay {
        execution: Uuid,
        pos: i64,
        event_type: HistoryEventType,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A new activity task, as scheduled by the Stepper. `id`/`status`/timestamps
/// are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewActivityTask {
    pub execution: Uuid,
    pub activity_name: String,
    pub pos: i64,
    pub args: Value,
    pub kwargs: Value,
    pub after_time: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    pub retry_policy: Value,
    pub heartbeat_timeout: Option<f64>,
}

/// Outcome of a failed activity attempt, decided by the caller (which holds
/// the `RetryPolicy`) and applied atomically by the store.
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    /// Retry budget remains: requeue for another attempt at `retry_at`.
    Retry { retry_at: DateTime<Utc> },
    /// No more retries (or a non-retryable error): terminal failure.
    Exhausted,
}

/// Persistence seam for the durable execution engine.
///
/// Implementations must be safe for concurrent access from multiple
/// processes (Postgres) or multiple tasks within one process (in-memory).
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ---- workflow executions -------------------------------------------

    /// Insert a brand-new execution, already in `Pending`/`Running` status.
    async fn create_workflow(&self, execution: WorkflowExecution) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    /// Atomically claim one execution that has unreplayed history and is not
    /// already leased to another stepper. Uses `SELECT ... FOR UPDATE SKIP
    /// LOCKED` under Postgres; `lease` bounds how long the claim holds if the
    /// claiming process dies without releasing it.
    async fn claim_workflow(
        &self,
        lease: Duration,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Release a lease taken by `claim_workflow`, after the Stepper has
    /// consumed all currently-visible history. If new events arrived for
    /// this execution while it was leased, it is marked runnable again so a
    /// subsequent `claim_workflow` will pick it back up.
    async fn release_workflow(&self, id: Uuid) -> Result<(), StoreError>;

    /// Mark a running execution as having unreplayed history, making it
    /// eligible for `claim_workflow`. A no-op if the execution is already
    /// terminal — terminal executions never run again (SPEC_FULL §3.1).
    async fn mark_runnable_if_active(&self, id: Uuid) -> Result<(), StoreError>;

    /// Move a freshly claimed `Pending` execution to `Running`, once its
    /// first step has appended `WORKFLOW_STARTED`. A no-op for anything
    /// already `Running` or terminal.
    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError>;

    /// Move an execution to a terminal status. Idempotent: calling this on
    /// an already-terminal execution is a no-op (sticky terminal states).
    async fn finish_workflow(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Executions still `Running` whose `expires_at` has passed.
    async fn due_workflow_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// All non-terminal children of `parent`, for cascading cancellation.
    async fn active_children(&self, parent: Uuid) -> Result<Vec<WorkflowExecution>, StoreError>;

    // ---- history events --------------------------------------------------

    /// Append one history event. Idempotent at `(execution, pos, type)`
    /// except when `pos == SPECIAL_POS`, where every append is a distinct
    /// out-of-band record. Returns the stored row — on a duplicate insert
    /// this is the *existing* row, letting callers detect a replay that
    /// disagrees with recorded `details` (see [`StoreError::NonDeterministicReplay`]).
    async fn append_event(
        &self,
        execution: Uuid,
        event_type: HistoryEventType,
        pos: i64,
        details: Value,
    ) -> Result<HistoryEvent, StoreError>;

    /// Full ordered history for replay, oldest first by `(pos, id)` with
    /// `SPECIAL_POS` records sorted by `id` after everything else.
    async fn load_events(&self, execution: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    // ---- activity tasks ---------------------------------------------------

    async fn schedule_activity(&self, task: NewActivityTask) -> Result<ActivityTask, StoreError>;

    async fn get_activity(&self, id: Uuid) -> Result<ActivityTask, StoreError>;

    /// Look up the activity task occupying `(execution, pos)`, if any —
    /// used to cascade a `cancel_activity` history marker into an actual
    /// store-level cancellation of the in-flight task.
    async fn find_activity_by_pos(&self, execution: Uuid, pos: i64) -> Result<Option<ActivityTask>, StoreError>;

    /// Activities still `Queued` with `after_time <= now`, claimed
    /// (`Queued` -> `Running`) atomically as part of the read.
    async fn claim_due_activities(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError>;

    async fn complete_activity(&self, id: Uuid, result: Value) -> Result<(), StoreError>;

    /// Apply a failed attempt. `Retry` requeues at `retry_at` with
    /// `attempt += 1` and status back to `Queued`; `Exhausted` moves the
    /// task to `Failed` permanently.
    async fn fail_activity(
        &self,
        id: Uuid,
        error: String,
        outcome: ActivityOutcome,
    ) -> Result<(), StoreError>;

    async fn cancel_activity(&self, id: Uuid) -> Result<(), StoreError>;

    async fn heartbeat_activity(&self, id: Uuid, details: Option<Value>) -> Result<(), StoreError>;

    /// `Running` tasks whose schedule-to-close `expires_at` has passed.
    async fn due_activity_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError>;

    /// Still-`Queued` tasks whose schedule-to-close `expires_at` has passed
    /// before ever being claimed (SPEC_FULL §4.7 (0), first bullet — distinct
    /// from [`Store::due_activity_timeouts`], which only covers `Running`
    /// tasks).
    async fn due_queued_activity_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError>;

    /// `Running` tasks with a `heartbeat_timeout` whose last heartbeat (or
    /// `started_at`, if none yet) is older than the configured window.
    async fn due_heartbeat_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError>;

    /// Set `status` on an activity directly (used by the Dispatcher to mark
    /// timed-out tasks `TimedOut` without going through the retry path).
    async fn set_activity_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Still-`Queued` tasks belonging to `execution` — used when a workflow
    /// terminates (cancel, timeout) to fail every task that will now never
    /// be claimed (SPEC_FULL §3.1, §4.8).
    async fn queued_activities_for_execution(&self, execution: Uuid) -> Result<Vec<ActivityTask>, StoreError>;
}
