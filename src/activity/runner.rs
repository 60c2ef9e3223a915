//! Activity runner (C6): `execute_activity` per SPEC_FULL §4.6.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::context::{self, ActivityContext};
use super::definition::ActivityError;
use crate::engine::registry::Registry;
use crate::model::{ActivityTask, ErrorCode, HistoryEventType, TaskStatus, WorkflowStatus, SLEEP_ACTIVITY_NAME, SPECIAL_POS};
use crate::persistence::{ActivityOutcome, Store, StoreError};
use crate::reliability::retry::{next_delay, RetryPolicy};

/// Run one claimed [`ActivityTask`] to its next outcome: completion, a
/// requeued retry, or terminal failure.
///
/// `task` must already be `Running` (as returned by
/// [`Store::claim_due_activities`]) — this function does not re-claim it.
#[instrument(skip(store, registry, task), fields(task = %task.id, activity = %task.activity_name))]
pub async fn execute_activity(
    task: &ActivityTask,
    store: &Arc<dyn Store>,
    registry: &Registry,
) -> Result<(), StoreError> {
    let workflow = store.get_workflow(task.execution).await?;
    if workflow.status.is_terminal() {
        let code = if workflow.status == WorkflowStatus::Canceled {
            ErrorCode::WorkflowCanceled
        } else {
            ErrorCode::WorkflowNotRunnable
        };
        store
            .set_activity_status(task.id, TaskStatus::Failed, Some(code.to_string()))
            .await?;
        store
            .append_event(
                task.execution,
                HistoryEventType::ActivityFailed,
                task.pos,
                json!({"activity_name": task.activity_name, "error": code.to_string()}),
            )
            .await?;
        return Ok(());
    }

    let attempt = task.attempt + 1;
    let ctx = ActivityContext::new(Arc::clone(store), task.id, attempt, task.max_attempts);

    let outcome = if task.activity_name == SLEEP_ACTIVITY_NAME {
        let seconds = task.args.get(0).and_then(Value::as_f64).unwrap_or(0.0);
        Ok(json!({"slept": seconds}))
    } else {
        match registry.activity(&task.activity_name) {
            Ok(func) => {
                let call = func(task.args.clone(), task.kwargs.clone());
                context::run_with_context(ctx, call).await
            }
            Err(_) => Err(ActivityError::new(format!("unknown activity: {}", task.activity_name))
                .with_kind("unknown_activity")),
        }
    };

    match outcome {
        Ok(result) => {
            store.complete_activity(task.id, result.clone()).await?;
            store
                .append_event(
                    task.execution,
                    HistoryEventType::ActivityCompleted,
                    task.pos,
                    json!({"activity_name": task.activity_name, "result": result}),
                )
                .await?;
            store.mark_runnable_if_active(task.execution).await?;
            info!("activity completed");
            Ok(())
        }
        Err(err) => handle_failure(task, store, err, attempt).await,
    }
}

async fn handle_failure(
    task: &ActivityTask,
    store: &Arc<dyn Store>,
    err: ActivityError,
    attempt: u32,
) -> Result<(), StoreError> {
    let policy: RetryPolicy = serde_json::from_value(task.retry_policy.clone()).unwrap_or_default();
    let unknown_activity = err.kind_tag() == "unknown_activity";
    let exhausted = unknown_activity
        || !policy.is_retryable_error(err.kind_tag())
        || policy.is_exhausted(attempt);

    if exhausted {
        store
            .fail_activity(task.id, err.message.clone(), ActivityOutcome::Exhausted)
            .await?;
        store
            .append_event(
                task.execution,
                HistoryEventType::ActivityFailed,
                task.pos,
                json!({"activity_name": task.activity_name, "error": err.message}),
            )
            .await?;
        store.mark_runnable_if_active(task.execution).await?;
        warn!(error = %err, "activity failed terminally");
    } else {
        let delay = next_delay(&policy, attempt);
        let retry_at = Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
        store
            .fail_activity(
                task.id,
                err.message.clone(),
                ActivityOutcome::Retry { retry_at },
            )
            .await?;
        // Recorded out-of-band: this is an audit trail of a non-terminal
        // attempt, not the replay-visible outcome at `task.pos` — a workflow
        // suspended on this handle must keep suspending through retries.
        store
            .append_event(
                task.execution,
                HistoryEventType::ActivityFailed,
                SPECIAL_POS,
                json!({
                    "activity_name": task.activity_name,
                    "pos": task.pos,
                    "attempt": attempt,
                    "error": err.message,
                    "retrying": true,
                }),
            )
            .await?;
        warn!(error = %err, attempt, retry_at = %retry_at, "activity failed, retrying");
    }
    Ok(())
}
