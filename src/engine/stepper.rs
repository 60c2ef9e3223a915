//! Stepper (C5): drives one workflow turn per SPEC_FULL §4.5.
//!
//! A turn either runs to completion, fails, or suspends. Suspension is not
//! an error — it means the workflow closure reached the edge of what's
//! already recorded in history and must wait for new events (an activity
//! outcome, a signal, a child's result) before it can make further progress.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::registry::{Registry, RegistryError};
use crate::model::{HistoryEventType, WorkflowExecution, WorkflowStatus, FINAL_POS};
use crate::persistence::{Store, StoreError};
use crate::workflow::{ContextError, Effect, ReplayContext};

/// Errors surfaced by the Stepper itself, as distinct from a workflow's own
/// failure (which is recorded in history, not returned here).
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drive the execution the dispatcher already claimed (via
/// [`Store::claim_workflow`]) through exactly one turn: instantiate a
/// [`ReplayContext`] over its history, run the registered workflow function,
/// and apply whichever of the three SPEC_FULL §4.5 outcomes resulted.
///
/// Releases the claimed lease before returning, regardless of outcome.
#[instrument(skip(store, registry, execution), fields(execution = %execution.id, workflow = %execution.workflow_name))]
pub async fn step_workflow(
    store: &Arc<dyn Store>,
    registry: &Registry,
    execution: WorkflowExecution,
) -> Result<(), StepError> {
    let id = execution.id;

    if execution.status.is_terminal() {
        store.release_workflow(id).await?;
        return Ok(());
    }

    let mut events = store.load_events(id).await?;
    if !events.iter().any(|e| e.r#type == HistoryEventType::WorkflowStarted) {
        let started = store
            .append_event(id, HistoryEventType::WorkflowStarted, 0, json!({"input": execution.input}))
            .await?;
        events.push(started);
        events.sort_by_key(|e| (e.pos, e.id));
    }
    store.mark_running(id).await?;

    let workflow_fn = match registry.workflow(&execution.workflow_name) {
        Ok(f) => f.clone(),
        Err(RegistryError::UnknownWorkflow(name)) => {
            finish_failed(store, &execution, format!("unknown workflow: {name}")).await?;
            store.release_workflow(id).await?;
            return Ok(());
        }
        Err(other) => {
            finish_failed(store, &execution, other.to_string()).await?;
            store.release_workflow(id).await?;
            return Ok(());
        }
    };

    let mut ctx = ReplayContext::new(id, events, registry);
    let outcome = workflow_fn(&mut ctx, execution.input.clone());
    let pending = ctx.into_pending();

    match outcome {
        Ok(result) => {
            apply_effects(store, &execution, pending).await?;
            store
                .append_event(id, HistoryEventType::WorkflowCompleted, FINAL_POS, json!({"result": result}))
                .await?;
            store.finish_workflow(id, WorkflowStatus::Completed, Some(result.clone()), None).await?;
            notify_parent(
                store,
                &execution,
                HistoryEventType::ChildWorkflowCompleted,
                json!({"child_id": id, "result": result}),
            )
            .await?;
            info!("workflow completed");
        }
        Err(ContextError::Suspend) => {
            apply_effects(store, &execution, pending).await?;
        }
        Err(other) => {
            apply_effects(store, &execution, pending).await?;
            let message = other.to_string();
            store
                .append_event(id, HistoryEventType::WorkflowFailed, FINAL_POS, json!({"error": message}))
                .await?;
            store.finish_workflow(id, WorkflowStatus::Failed, None, Some(message.clone())).await?;
            notify_parent(
                store,
                &execution,
                HistoryEventType::ChildWorkflowFailed,
                json!({"child_id": id, "error": message}),
            )
            .await?;
            warn!(error = %message, "workflow failed");
        }
    }

    store.release_workflow(id).await?;
    Ok(())
}

/// Flush the buffered [`Effect`]s a closure produced this turn: append the
/// queued history events and schedule activities/children. Appending an
/// `activity_canceled`/`child_workflow_canceled` marker cascades into an
/// actual store-level cancellation, since the context only records intent.
async fn apply_effects(
    store: &Arc<dyn Store>,
    execution: &WorkflowExecution,
    effects: Vec<Effect>,
) -> Result<(), StoreError> {
    for effect in effects {
        match effect {
            Effect::AppendEvent { r#type, pos, details } => {
                let event = store.append_event(execution.id, r#type.clone(), pos, details).await?;
                match r#type {
                    HistoryEventType::ActivityCanceled => {
                        if let Some(task) = store.find_activity_by_pos(execution.id, pos).await? {
                            store.cancel_activity(task.id).await?;
                        }
                    }
                    HistoryEventType::ChildWorkflowCanceled => {
                        if let Some(child_id) = event
                            .details
                            .get("child_id")
                            .and_then(serde_json::Value::as_str)
                            .and_then(|s| Uuid::parse_str(s).ok())
                        {
                            crate::api::cancel_workflow_cascading(store, child_id, Some("parent_canceled".to_string())).await?;
                        }
                    }
                    _ => {}
                }
            }
            Effect::ScheduleActivity(task) => {
                store.schedule_activity(task).await?;
            }
            Effect::CreateChild(child) => {
                store.create_workflow(*child).await?;
            }
        }
    }
    Ok(())
}

async fn finish_failed(
    store: &Arc<dyn Store>,
    execution: &WorkflowExecution,
    message: String,
) -> Result<(), StoreError> {
    store
        .append_event(execution.id, HistoryEventType::WorkflowFailed, FINAL_POS, json!({"error": message}))
        .await?;
    store
        .finish_workflow(execution.id, WorkflowStatus::Failed, None, Some(message.clone()))
        .await?;
    notify_parent(
        store,
        execution,
        HistoryEventType::ChildWorkflowFailed,
        json!({"child_id": execution.id, "error": message}),
    )
    .await
}

/// Append an event at the parent's `parent_pos` and wake it, if this
/// execution is a child. A no-op for root executions.
///
/// Shared with the Dispatcher's workflow-timeout handling (SPEC_FULL §4.7),
/// which notifies a parent the same way a completed/failed child would.
pub(crate) async fn notify_parent(
    store: &Arc<dyn Store>,
    execution: &WorkflowExecution,
    event_type: HistoryEventType,
    details: serde_json::Value,
) -> Result<(), StoreError> {
    let (Some(parent_id), Some(parent_pos)) = (execution.parent, execution.parent_pos) else {
        return Ok(());
    };
    store.append_event(parent_id, event_type, parent_pos, details).await?;
    store.mark_runnable_if_active(parent_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::CallableDefaults;
    use crate::persistence::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn claim(store: &Arc<dyn Store>) -> WorkflowExecution {
        store.claim_workflow(Duration::from_secs(30)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn completed_workflow_notifies_no_one_when_root() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut registry = Registry::new();
        registry.register_workflow("noop", CallableDefaults::default(), |_ctx: &mut ReplayContext<'_>, input: serde_json::Value| {
            Ok::<_, ContextError>(input)
        });

        let execution = WorkflowExecution::new("noop", json!({"x": 1}));
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();

        let claimed = claim(&store).await;
        step_workflow(&store, &registry, claimed).await.unwrap();

        let fetched = store.get_workflow(id).await.unwrap();
        assert_eq!(fetched.status, WorkflowStatus::Completed);
        assert_eq!(fetched.result, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn suspended_workflow_stays_running_and_schedules_activity() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut registry = Registry::new();
        registry.register_workflow("waits", CallableDefaults::default(), |ctx: &mut ReplayContext<'_>, input: serde_json::Value| {
            ctx.run_activity("echo", input, json!({}), Default::default())
        });

        let execution = WorkflowExecution::new("waits", json!([1]));
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();

        let claimed = claim(&store).await;
        step_workflow(&store, &registry, claimed).await.unwrap();

        let fetched = store.get_workflow(id).await.unwrap();
        assert_eq!(fetched.status, WorkflowStatus::Running);
        let tasks = store.queued_activities_for_execution(id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].activity_name, "echo");
    }

    #[tokio::test]
    async fn unregistered_workflow_fails_terminally() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = Registry::new();

        let execution = WorkflowExecution::new("ghost", json!({}));
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();

        let claimed = claim(&store).await;
        step_workflow(&store, &registry, claimed).await.unwrap();

        let fetched = store.get_workflow(id).await.unwrap();
        assert_eq!(fetched.status, WorkflowStatus::Failed);
    }

    #[test_log::test(tokio::test)]
    async fn workflow_failure_propagates_to_parent() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut registry = Registry::new();
        registry.register_workflow("boom", CallableDefaults::default(), |_ctx: &mut ReplayContext<'_>, _input: serde_json::Value| {
            Err::<serde_json::Value, _>(ContextError::Custom("kaboom".into()))
        });

        let mut parent = WorkflowExecution::new("parent_placeholder", json!({}));
        parent.status = WorkflowStatus::Running;
        let parent_id = parent.id;
        store.create_workflow(parent).await.unwrap();

        let mut child = WorkflowExecution::new("boom", json!({}));
        child.parent = Some(parent_id);
        child.parent_pos = Some(0);
        let child_id = child.id;
        store.create_workflow(child).await.unwrap();

        let claimed = loop {
            let candidate = store.claim_workflow(Duration::from_secs(30)).await.unwrap().expect("a claimable execution");
            if candidate.id == child_id {
                break candidate;
            }
            store.release_workflow(candidate.id).await.unwrap();
        };
        step_workflow(&store, &registry, claimed).await.unwrap();

        let events = store.load_events(parent_id).await.unwrap();
        assert!(events.iter().any(|e| e.r#type == HistoryEventType::ChildWorkflowFailed && e.pos == 0));
    }
}
