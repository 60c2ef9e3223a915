//! Public API (C8): the four entry points an embedding application calls —
//! everything else (the Stepper, the Dispatcher, the activity runner) is
//! driven internally from these or from the dispatcher's own ticks.
//!
//! `wait_workflow`'s polling convenience is explicitly out of scope (SPEC_FULL
//! §1, §4.8); [`poll_status`] is the single-read primitive it would be built
//! from.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::registry::Registry;
use crate::model::{ErrorCode, HistoryEventType, WorkflowExecution, WorkflowStatus, SPECIAL_POS};
use crate::persistence::{ActivityOutcome, Store, StoreError};

/// A snapshot of an execution's status, returned by [`poll_status`].
#[derive(Debug, Clone)]
pub struct WorkflowStatusSnapshot {
    pub id: Uuid,
    pub status: WorkflowStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<WorkflowExecution> for WorkflowStatusSnapshot {
    fn from(execution: WorkflowExecution) -> Self {
        Self {
            id: execution.id,
            status: execution.status,
            result: execution.result,
            error: execution.error,
        }
    }
}

/// Start a new top-level workflow execution. Returns the new execution id.
///
/// `timeout_secs` overrides the workflow's registered
/// [`crate::engine::registry::CallableDefaults`]; `None` falls back to it,
/// and if the registry has no entry either, the execution never expires on
/// its own.
#[instrument(skip(store, registry, input))]
pub async fn start_workflow(
    store: &Arc<dyn Store>,
    registry: &Registry,
    name: &str,
    input: Value,
    timeout_secs: Option<f64>,
) -> Result<Uuid, StoreError> {
    let mut execution = WorkflowExecution::new(name, input);
    let timeout = timeout_secs.or_else(|| {
        registry
            .workflow_defaults(name)
            .and_then(|d| d.timeout.schedule_to_close_secs)
    });
    if let Some(secs) = timeout {
        execution.expires_at = Some(Utc::now() + chrono::Duration::milliseconds((secs * 1000.0) as i64));
    }
    let id = execution.id;
    store.create_workflow(execution).await?;
    info!(workflow = name, "workflow started");
    Ok(id)
}

/// Enqueue a signal for a running (or not-yet-started) execution. A no-op
/// for terminal executions beyond recording the event — signals delivered
/// after the fact are simply never consumed.
#[instrument(skip(store, payload))]
pub async fn signal_workflow(
    store: &Arc<dyn Store>,
    id: Uuid,
    name: &str,
    payload: Option<Value>,
) -> Result<(), StoreError> {
    store
        .append_event(
            id,
            HistoryEventType::SignalEnqueued,
            SPECIAL_POS,
            json!({"name": name, "payload": payload.unwrap_or(Value::Null)}),
        )
        .await?;
    store.mark_runnable_if_active(id).await?;
    Ok(())
}

/// Cancel an execution and, recursively, every non-terminal descendant.
///
/// `cancel_queued` controls whether this execution's own still-`Queued`
/// activities are failed immediately (the default, and the only mode the
/// public surface exposes — SPEC_FULL §4.8 names the parameter but gives no
/// scenario where `false` is observable, since a canceled workflow never
/// resumes to act on a task it left queued).
#[instrument(skip(store, reason))]
pub async fn cancel_workflow(store: &Arc<dyn Store>, id: Uuid, reason: Option<String>) -> Result<(), StoreError> {
    cancel_workflow_cascading(store, id, reason).await
}

/// Read-only status check. The primitive `wait_workflow`-style conveniences
/// are built on top of, outside this crate's core.
#[instrument(skip(store))]
pub async fn poll_status(store: &Arc<dyn Store>, id: Uuid) -> Result<WorkflowStatusSnapshot, StoreError> {
    Ok(store.get_workflow(id).await?.into())
}

/// Recursive cancellation worker shared by [`cancel_workflow`] and the
/// Stepper's `child_workflow_canceled` effect cascade.
pub(crate) async fn cancel_workflow_cascading(
    store: &Arc<dyn Store>,
    id: Uuid,
    reason: Option<String>,
) -> Result<(), StoreError> {
    let execution = store.get_workflow(id).await?;
    if execution.status.is_terminal() {
        return Ok(());
    }

    store
        .append_event(
            id,
            HistoryEventType::WorkflowCanceled,
            SPECIAL_POS,
            json!({"reason": reason}),
        )
        .await?;
    store
        .finish_workflow(id, WorkflowStatus::Canceled, None, Some(ErrorCode::WorkflowCanceled.to_string()))
        .await?;

    fail_queued_activities(store, id, ErrorCode::WorkflowCanceled).await?;

    if let (Some(parent_id), Some(parent_pos)) = (execution.parent, execution.parent_pos) {
        store
            .append_event(
                parent_id,
                HistoryEventType::ChildWorkflowCanceled,
                parent_pos,
                json!({"child_id": id, "error": ErrorCode::WorkflowCanceled.to_string()}),
            )
            .await?;
        store.mark_runnable_if_active(parent_id).await?;
    }

    for child in store.active_children(id).await? {
        Box::pin(cancel_workflow_cascading(store, child.id, Some(ErrorCode::ParentCanceled.to_string()))).await?;
    }

    info!("workflow canceled");
    Ok(())
}

/// Fail every still-`Queued` activity belonging to `execution`, used both by
/// cancellation and by workflow-timeout handling (SPEC_FULL §3.1, §4.7).
pub(crate) async fn fail_queued_activities(
    store: &Arc<dyn Store>,
    execution: Uuid,
    code: ErrorCode,
) -> Result<(), StoreError> {
    for task in store.queued_activities_for_execution(execution).await? {
        store.fail_activity(task.id, code.to_string(), ActivityOutcome::Exhausted).await?;
        store
            .append_event(
                execution,
                HistoryEventType::ActivityFailed,
                SPECIAL_POS,
                json!({"task_id": task.id, "pos": task.pos, "error": code.to_string()}),
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    #[tokio::test]
    async fn start_workflow_creates_pending_execution() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = Registry::new();
        let id = start_workflow(&store, &registry, "greet", json!({"name": "Ada"}), None).await.unwrap();
        let snapshot = poll_status(&store, id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn signal_workflow_appends_event_at_special_pos() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = Registry::new();
        let id = start_workflow(&store, &registry, "greet", json!({}), None).await.unwrap();
        signal_workflow(&store, id, "approve", Some(json!({"ok": true}))).await.unwrap();
        let events = store.load_events(id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.r#type == HistoryEventType::SignalEnqueued && e.pos == SPECIAL_POS));
    }

    #[tokio::test]
    async fn cancel_workflow_fails_queued_activities_and_cascades_to_children() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = Registry::new();
        let parent_id = start_workflow(&store, &registry, "parent", json!({}), None).await.unwrap();

        let mut child = WorkflowExecution::new("child", json!({}));
        child.parent = Some(parent_id);
        child.parent_pos = Some(0);
        child.status = WorkflowStatus::Running;
        let child_id = child.id;
        store.create_workflow(child).await.unwrap();

        cancel_workflow(&store, parent_id, Some("operator requested".into())).await.unwrap();

        let parent = poll_status(&store, parent_id).await.unwrap();
        assert_eq!(parent.status, WorkflowStatus::Canceled);
        let child = poll_status(&store, child_id).await.unwrap();
        assert_eq!(child.status, WorkflowStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_workflow_on_terminal_execution_is_a_no_op() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = Registry::new();
        let id = start_workflow(&store, &registry, "greet", json!({}), None).await.unwrap();
        store.finish_workflow(id, WorkflowStatus::Completed, Some(json!(1)), None).await.unwrap();

        cancel_workflow(&store, id, None).await.unwrap();

        let snapshot = poll_status(&store, id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
    }
}
