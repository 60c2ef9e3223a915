//! The three persistent entities of the durable execution engine:
//! [`WorkflowExecution`], [`HistoryEvent`], and [`ActivityTask`].
//!
//! See `SPEC_FULL.md` §3 for the data model this module implements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Out-of-band history slot: cancel/signal/timeout markers that are not a
/// replay-deterministic call position.
pub const SPECIAL_POS: i64 = i64::MAX;

/// The slot of the terminal `workflow_completed`/`workflow_failed` event.
pub const FINAL_POS: i64 = i64::MAX - 1;

/// Reserved activity name for the durable timer implementation ([`sleep`]).
///
/// [`sleep`]: crate::workflow::ReplayContext::sleep
pub const SLEEP_ACTIVITY_NAME: &str = "__sleep__";

/// Lifecycle status of a [`WorkflowExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    TimedOut,
}

impl WorkflowStatus {
    /// Terminal statuses are sticky: once reached, no further status change
    /// or activity-outcome append is permitted (SPEC_FULL §3.1).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }
}

/// Lifecycle status of an [`ActivityTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

/// Stable error codes persisted into `error` text columns (SPEC_FULL §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ActivityFailed,
    ActivityTimeout,
    WorkflowTimeout,
    WorkflowCanceled,
    WorkflowNotRunnable,
    HeartbeatTimeout,
    ParentCanceled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActivityFailed => "activity_failed",
            Self::ActivityTimeout => "activity_timeout",
            Self::WorkflowTimeout => "workflow_timeout",
            Self::WorkflowCanceled => "workflow_canceled",
            Self::WorkflowNotRunnable => "workflow_not_runnable",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ParentCanceled => "parent_canceled",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable workflow run.
///
/// `parent`/`parent_pos` are a weak back-reference, not an owning edge — see
/// SPEC_FULL §3.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_name: String,
    pub input: Value,
    pub status: WorkflowStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent: Option<Uuid>,
    pub parent_pos: Option<i64>,
}

impl WorkflowExecution {
    pub fn new(workflow_name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            input,
            status: WorkflowStatus::Pending,
            result: None,
            error: None,
            started_at: now,
            finished_at: None,
            updated_at: now,
            expires_at: None,
            parent: None,
            parent_pos: None,
        }
    }
}

/// The tagged history event variants (SPEC_FULL §6.1). `details` carries the
/// variant-specific payload; the tag string is the stable on-disk name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCanceled,
    WorkflowTimedOut,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    ActivityTimedOut,
    ActivityCanceled,
    ActivityWait,
    SignalEnqueued,
    SignalWait,
    SignalConsumed,
    ChildWorkflowScheduled,
    ChildWorkflowCompleted,
    ChildWorkflowFailed,
    ChildWorkflowCanceled,
    ChildWorkflowTimedOut,
    ChildWorkflowWait,
    VersionMarker,
}

impl HistoryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowCanceled => "workflow_canceled",
            Self::WorkflowTimedOut => "workflow_timed_out",
            Self::ActivityScheduled => "activity_scheduled",
            Self::ActivityCompleted => "activity_completed",
            Self::ActivityFailed => "activity_failed",
            Self::ActivityTimedOut => "activity_timed_out",
            Self::ActivityCanceled => "activity_canceled",
            Self::ActivityWait => "activity_wait",
            Self::SignalEnqueued => "signal_enqueued",
            Self::SignalWait => "signal_wait",
            Self::SignalConsumed => "signal_consumed",
            Self::ChildWorkflowScheduled => "child_workflow_scheduled",
            Self::ChildWorkflowCompleted => "child_workflow_completed",
            Self::ChildWorkflowFailed => "child_workflow_failed",
            Self::ChildWorkflowCanceled => "child_workflow_canceled",
            Self::ChildWorkflowTimedOut => "child_workflow_timed_out",
            Self::ChildWorkflowWait => "child_workflow_wait",
            Self::VersionMarker => "version_marker",
        }
    }
}

/// One append-only history record. `(execution, pos, type)` is unique except
/// when `pos == SPECIAL_POS` (SPEC_FULL §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: i64,
    pub execution: Uuid,
    pub r#type: HistoryEventType,
    pub pos: i64,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// A scheduled unit of activity work. `(execution, pos)` is unique for
/// non-special activities (SPEC_FULL §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTask {
    pub id: Uuid,
    pub execution: Uuid,
    pub activity_name: String,
    pub pos: i64,
    pub args: Value,
    pub kwargs: Value,
    pub status: TaskStatus,
    pub after_time: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry_policy: Value,
    pub heartbeat_timeout: Option<f64>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_details: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
