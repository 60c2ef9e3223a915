//! In-memory [`Store`] implementation — used by unit tests and by examples
//! that don't want a Postgres dependency.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::store::{ActivityOutcome, NewActivityTask, Store, StoreError};
use crate::model::{
    ActivityTask, HistoryEvent, HistoryEventType, TaskStatus, WorkflowExecution, WorkflowStatus,
    SPECIAL_POS,
};

struct WorkflowSlot {
    execution: WorkflowExecution,
    /// Set whenever new history arrives for a `Running` execution; cleared
    /// by `claim_workflow`.
    runnable: bool,
    /// Set while claimed, cleared by `release_workflow`.
    leased_until: Option<chrono::DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, WorkflowSlot>,
    events: HashMap<Uuid, Vec<HistoryEvent>>,
    next_event_id: i64,
    tasks: HashMap<Uuid, ActivityTask>,
}

/// Thread-safe, single-process [`Store`] backed by `parking_lot::RwLock`-guarded maps.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_workflow(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.events.entry(execution.id).or_default();
        inner.workflows.insert(
            execution.id,
            WorkflowSlot {
                execution,
                runnable: true,
                leased_until: None,
            },
        );
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .map(|slot| slot.execution.clone())
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn claim_workflow(
        &self,
        lease: Duration,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let candidate = inner
            .workflows
            .values_mut()
            .find(|slot| {
                slot.runnable
                    && !slot.execution.status.is_terminal()
                    && slot.leased_until.map(|at| at <= now).unwrap_or(true)
            });
        match candidate {
            Some(slot) => {
                slot.runnable = false;
                slot.leased_until = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
                Ok(Some(slot.execution.clone()))
            }
            None => Ok(None),
        }
    }

    async fn release_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let slot = inner
            .workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        slot.leased_until = None;
        Ok(())
    }

    async fn mark_runnable_if_active(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.workflows.get_mut(&id) {
            if !slot.execution.status.is_terminal() {
                slot.runnable = true;
            }
        }
        Ok(())
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.workflows.get_mut(&id) {
            if slot.execution.status == WorkflowStatus::Pending {
                slot.execution.status = WorkflowStatus::Running;
                slot.execution.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn find_activity_by_pos(&self, execution: Uuid, pos: i64) -> Result<Option<ActivityTask>, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .find(|t| t.execution == execution && t.pos == pos)
            .cloned())
    }

    async fn finish_workflow(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let slot = inner
            .workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        if slot.execution.status.is_terminal() {
            return Ok(());
        }
        slot.execution.status = status;
        slot.execution.result = result;
        slot.execution.error = error;
        slot.execution.finished_at = Some(Utc::now());
        slot.execution.updated_at = Utc::now();
        Ok(())
    }

    async fn due_workflow_timeouts(
        &self,
        now: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .workflows
            .values()
            .filter(|slot| {
                slot.execution.status == WorkflowStatus::Running
                    && slot.execution.expires_at.is_some_and(|at| at <= now)
            })
            .take(limit.max(0) as usize)
            .map(|slot| slot.execution.clone())
            .collect())
    }

    async fn active_children(&self, parent: Uuid) -> Result<Vec<WorkflowExecution>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .workflows
            .values()
            .filter(|slot| slot.execution.parent == Some(parent) && !slot.execution.status.is_terminal())
            .map(|slot| slot.execution.clone())
            .collect())
    }

    async fn append_event(
        &self,
        execution: Uuid,
        event_type: HistoryEventType,
        pos: i64,
        details: Value,
    ) -> Result<HistoryEvent, StoreError> {
        let mut inner = self.inner.write();
        if pos != SPECIAL_POS {
            if let Some(existing) = inner.events.get(&execution).and_then(|events| {
                events
                    .iter()
                    .find(|e| e.pos == pos && e.r#type == event_type)
                    .cloned()
            }) {
                if existing.details != details {
                    return Err(StoreError::NonDeterministicReplay {
                        execution,
                        pos,
                        event_type,
                    });
                }
                return Ok(existing);
            }
        }
        let id = inner.next_event_id;
        inner.next_event_id += 1;
        let event = HistoryEvent {
            id,
            execution,
            r#type: event_type,
            pos,
            details,
            created_at: Utc::now(),
        };
        inner.events.entry(execution).or_default().push(event.clone());
        Ok(event)
    }

    async fn load_events(&self, execution: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let mut events = self
            .inner
            .read()
            .events
            .get(&execution)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| (e.pos, e.id));
        Ok(events)
    }

    async fn schedule_activity(&self, task: NewActivityTask) -> Result<ActivityTask, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let activity = ActivityTask {
            id: Uuid::now_v7(),
            execution: task.execution,
            activity_name: task.activity_name,
            pos: task.pos,
            args: task.args,
            kwargs: task.kwargs,
            status: TaskStatus::Queued,
            after_time: task.after_time,
            expires_at: task.expires_at,
            attempt: 0,
            max_attempts: task.max_attempts,
            retry_policy: task.retry_policy,
            heartbeat_timeout: task.heartbeat_timeout,
            heartbeat_at: None,
            heartbeat_details: None,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        inner.tasks.insert(activity.id, activity.clone());
        Ok(activity)
    }

    async fn get_activity(&self, id: Uuid) -> Result<ActivityTask, StoreError> {
        self.inner
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn claim_due_activities(
        &self,
        now: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let mut inner = self.inner.write();
        let due: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.after_time <= now)
            .take(limit.max(0) as usize)
            .map(|t| t.id)
            .collect();
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.status = TaskStatus::Running;
                task.started_at.get_or_insert(now);
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_activity(&self, id: Uuid, result: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.finished_at = Some(Utc::now());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_activity(
        &self,
        id: Uuid,
        error: String,
        outcome: ActivityOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.error = Some(error);
        task.updated_at = Utc::now();
        match outcome {
            ActivityOutcome::Retry { retry_at } => {
                task.attempt += 1;
                task.status = TaskStatus::Queued;
                task.after_time = retry_at;
                task.started_at = None;
            }
            ActivityOutcome::Exhausted => {
                task.status = TaskStatus::Failed;
                task.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn cancel_activity(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.status = TaskStatus::Failed;
        task.error = Some(crate::model::ErrorCode::WorkflowCanceled.to_string());
        task.finished_at = Some(Utc::now());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn heartbeat_activity(&self, id: Uuid, details: Option<Value>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.heartbeat_at = Some(Utc::now());
        if details.is_some() {
            task.heartbeat_details = details;
        }
        Ok(())
    }

    async fn due_activity_timeouts(
        &self,
        now: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running && t.expires_at.is_some_and(|at| at <= now))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn due_queued_activity_timeouts(
        &self,
        now: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.expires_at.is_some_and(|at| at <= now))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn due_heartbeat_timeouts(
        &self,
        now: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && crate::reliability::timeout::heartbeat_is_stale(
                        t.started_at,
                        t.heartbeat_at,
                        t.heartbeat_timeout,
                        now,
                    )
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn set_activity_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.status = status;
        if error.is_some() {
            task.error = error;
        }
        task.finished_at = Some(Utc::now());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn queued_activities_for_execution(&self, execution: Uuid) -> Result<Vec<ActivityTask>, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.execution == execution && t.status == TaskStatus::Queued)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_execution() -> WorkflowExecution {
        WorkflowExecution::new("demo_workflow", json!({}))
    }

    #[tokio::test]
    async fn create_and_get_workflow_round_trips() {
        let store = InMemoryStore::new();
        let mut execution = make_execution();
        execution.status = WorkflowStatus::Running;
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();
        let fetched = store.get_workflow(id).await.unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn claim_workflow_only_returns_runnable_active() {
        let store = InMemoryStore::new();
        let mut execution = make_execution();
        execution.status = WorkflowStatus::Running;
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();

        let claimed = store.claim_workflow(Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.unwrap().id, id);

        // Already claimed: not runnable again until marked so.
        assert!(store.claim_workflow(Duration::from_secs(30)).await.unwrap().is_none());

        store.mark_runnable_if_active(id).await.unwrap();
        assert!(store.claim_workflow(Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finish_workflow_is_sticky() {
        let store = InMemoryStore::new();
        let mut execution = make_execution();
        execution.status = WorkflowStatus::Running;
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();

        store
            .finish_workflow(id, WorkflowStatus::Completed, Some(json!(1)), None)
            .await
            .unwrap();
        store
            .finish_workflow(id, WorkflowStatus::Failed, None, Some("late".into()))
            .await
            .unwrap();

        let fetched = store.get_workflow(id).await.unwrap();
        assert_eq!(fetched.status, WorkflowStatus::Completed);
        assert_eq!(fetched.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn append_event_is_idempotent_at_same_slot() {
        let store = InMemoryStore::new();
        let mut execution = make_execution();
        execution.status = WorkflowStatus::Running;
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();

        let a = store
            .append_event(id, HistoryEventType::ActivityScheduled, 0, json!({"n": 1}))
            .await
            .unwrap();
        let b = store
            .append_event(id, HistoryEventType::ActivityScheduled, 0, json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);

        let conflict = store
            .append_event(id, HistoryEventType::ActivityScheduled, 0, json!({"n": 2}))
            .await;
        assert!(matches!(conflict, Err(StoreError::NonDeterministicReplay { .. })));
    }

    #[tokio::test]
    async fn special_pos_events_are_never_deduplicated() {
        let store = InMemoryStore::new();
        let mut execution = make_execution();
        execution.status = WorkflowStatus::Running;
        let id = execution.id;
        store.create_workflow(execution).await.unwrap();

        store
            .append_event(id, HistoryEventType::SignalEnqueued, SPECIAL_POS, json!({"n": 1}))
            .await
            .unwrap();
        store
            .append_event(id, HistoryEventType::SignalEnqueued, SPECIAL_POS, json!({"n": 1}))
            .await
            .unwrap();

        let events = store.load_events(id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn activity_lifecycle_schedule_claim_complete() {
        let store = InMemoryStore::new();
        let execution = make_execution();
        let exec_id = execution.id;
        store.create_workflow(execution).await.unwrap();

        let task = store
            .schedule_activity(NewActivityTask {
                execution: exec_id,
                activity_name: "send_email".into(),
                pos: 0,
                args: json!([]),
                kwargs: json!({}),
                after_time: Utc::now() - chrono::Duration::seconds(1),
                expires_at: None,
                max_attempts: 3,
                retry_policy: json!({}),
                heartbeat_timeout: None,
            })
            .await
            .unwrap();

        let due = store.claim_due_activities(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, TaskStatus::Running);

        store.complete_activity(task.id, json!("ok")).await.unwrap();
        let fetched = store.get_activity(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn failed_activity_retry_requeues_then_exhausts() {
        let store = InMemoryStore::new();
        let execution = make_execution();
        let exec_id = execution.id;
        store.create_workflow(execution).await.unwrap();

        let task = store
            .schedule_activity(NewActivityTask {
                execution: exec_id,
                activity_name: "flaky".into(),
                pos: 0,
                args: json!([]),
                kwargs: json!({}),
                after_time: Utc::now() - chrono::Duration::seconds(1),
                expires_at: None,
                max_attempts: 2,
                retry_policy: json!({}),
                heartbeat_timeout: None,
            })
            .await
            .unwrap();

        store.claim_due_activities(Utc::now(), 10).await.unwrap();
        store
            .fail_activity(
                task.id,
                "boom".into(),
                ActivityOutcome::Retry {
                    retry_at: Utc::now() - chrono::Duration::seconds(1),
                },
            )
            .await
            .unwrap();

        let requeued = store.get_activity(task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.attempt, 1);

        store.claim_due_activities(Utc::now(), 10).await.unwrap();
        store
            .fail_activity(task.id, "boom again".into(), ActivityOutcome::Exhausted)
            .await
            .unwrap();

        let exhausted = store.get_activity(task.id).await.unwrap();
        assert_eq!(exhausted.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn queued_activities_for_execution_excludes_other_executions() {
        let store = InMemoryStore::new();
        let execution = make_execution();
        let exec_id = execution.id;
        store.create_workflow(execution).await.unwrap();
        store.create_workflow(make_execution()).await.unwrap();

        let task = store
            .schedule_activity(NewActivityTask {
                execution: exec_id,
                activity_name: "send_email".into(),
                pos: 0,
                args: json!([]),
                kwargs: json!({}),
                after_time: Utc::now() + chrono::Duration::seconds(60),
                expires_at: None,
                max_attempts: 3,
                retry_policy: json!({}),
                heartbeat_timeout: None,
            })
            .await
            .unwrap();

        let queued = store.queued_activities_for_execution(exec_id).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, task.id);
    }
}
