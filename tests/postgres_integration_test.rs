//! Integration tests for [`PostgresStore`] against a real PostgreSQL instance.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test --test postgres_integration_test -- --test-threads=1`
//!
//! Skips (prints a notice and returns) when `DATABASE_URL` isn't set or the
//! database isn't reachable, matching the gating idiom used elsewhere in
//! this crate's test suite (SPEC_FULL §10.4).

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use durable_engine::model::{
    ActivityTask, ErrorCode, HistoryEventType, TaskStatus, WorkflowExecution, WorkflowStatus, SPECIAL_POS,
};
use durable_engine::persistence::{ActivityOutcome, NewActivityTask, PostgresStore, Store};

async fn connect() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    match PgPool::connect(&url).await {
        Ok(pool) => Some(pool),
        Err(err) => {
            eprintln!("skipping postgres_integration_test: could not connect ({err})");
            None
        }
    }
}

async fn test_store() -> Option<PostgresStore> {
    let pool = connect().await?;
    PostgresStore::migrate(&pool).await.expect("migrations should apply cleanly");
    Some(PostgresStore::new(pool))
}

async fn cleanup(store: &PostgresStore, id: Uuid) {
    sqlx::query("DELETE FROM activity_tasks WHERE execution = $1").bind(id).execute(store.pool()).await.ok();
    sqlx::query("DELETE FROM history_events WHERE execution = $1").bind(id).execute(store.pool()).await.ok();
    sqlx::query("DELETE FROM workflow_executions WHERE id = $1").bind(id).execute(store.pool()).await.ok();
}

fn new_task(execution: Uuid, pos: i64) -> NewActivityTask {
    NewActivityTask {
        execution,
        activity_name: "echo".into(),
        pos,
        args: json!([1]),
        kwargs: json!({}),
        after_time: Utc::now(),
        expires_at: None,
        max_attempts: 3,
        retry_policy: json!({"strategy": "exponential", "initial_interval": 0.01}),
        heartbeat_timeout: None,
    }
}

#[tokio::test]
async fn create_and_fetch_workflow_round_trips() {
    let Some(store) = test_store().await else { return };
    let execution = WorkflowExecution::new("greet", json!({"name": "Ada"}));
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();

    let fetched = store.get_workflow(id).await.unwrap();
    assert_eq!(fetched.workflow_name, "greet");
    assert_eq!(fetched.status, WorkflowStatus::Pending);

    cleanup(&store, id).await;
}

#[tokio::test]
async fn append_event_is_idempotent_at_non_special_pos() {
    let Some(store) = test_store().await else { return };
    let execution = WorkflowExecution::new("greet", json!({}));
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();

    let details = json!({"activity_name": "echo", "input": "[]"});
    let first = store.append_event(id, HistoryEventType::ActivityScheduled, 0, details.clone()).await.unwrap();
    let second = store.append_event(id, HistoryEventType::ActivityScheduled, 0, details).await.unwrap();
    assert_eq!(first.id, second.id);

    let events = store.load_events(id).await.unwrap();
    assert_eq!(events.iter().filter(|e| e.pos == 0).count(), 1);

    cleanup(&store, id).await;
}

#[tokio::test]
async fn special_pos_events_are_never_deduplicated() {
    let Some(store) = test_store().await else { return };
    let execution = WorkflowExecution::new("greet", json!({}));
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();

    store
        .append_event(id, HistoryEventType::SignalEnqueued, SPECIAL_POS, json!({"name": "go", "payload": 1}))
        .await
        .unwrap();
    store
        .append_event(id, HistoryEventType::SignalEnqueued, SPECIAL_POS, json!({"name": "go", "payload": 2}))
        .await
        .unwrap();

    let events = store.load_events(id).await.unwrap();
    assert_eq!(events.iter().filter(|e| e.pos == SPECIAL_POS).count(), 2);

    cleanup(&store, id).await;
}

#[tokio::test]
async fn claim_due_activities_is_exclusive_under_concurrency() {
    let Some(store) = test_store().await else { return };
    let execution = WorkflowExecution::new("greet", json!({}));
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();
    let task = store.schedule_activity(new_task(id, 0)).await.unwrap();

    let store = std::sync::Arc::new(store);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim_due_activities(Utc::now(), 10).await.unwrap() }));
    }
    let mut claimed = 0;
    for handle in handles {
        claimed += handle.await.unwrap().into_iter().filter(|t| t.id == task.id).count();
    }
    assert_eq!(claimed, 1, "exactly one concurrent claim should win");

    cleanup(&store, id).await;
}

#[tokio::test]
async fn fail_activity_retry_requeues_with_incremented_attempt() {
    let Some(store) = test_store().await else { return };
    let execution = WorkflowExecution::new("greet", json!({}));
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();
    let task = store.schedule_activity(new_task(id, 0)).await.unwrap();
    store.claim_due_activities(Utc::now(), 10).await.unwrap();

    store
        .fail_activity(task.id, "boom".into(), ActivityOutcome::Retry { retry_at: Utc::now() })
        .await
        .unwrap();

    let reloaded: ActivityTask = store.get_activity(task.id).await.unwrap();
    assert_eq!(reloaded.status, TaskStatus::Queued);
    assert_eq!(reloaded.attempt, 1);
    assert_eq!(reloaded.error.as_deref(), Some("boom"));

    cleanup(&store, id).await;
}

#[tokio::test]
async fn fail_activity_exhausted_is_terminal() {
    let Some(store) = test_store().await else { return };
    let execution = WorkflowExecution::new("greet", json!({}));
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();
    let task = store.schedule_activity(new_task(id, 0)).await.unwrap();
    store.claim_due_activities(Utc::now(), 10).await.unwrap();

    store
        .fail_activity(task.id, ErrorCode::ActivityFailed.to_string(), ActivityOutcome::Exhausted)
        .await
        .unwrap();

    let reloaded: ActivityTask = store.get_activity(task.id).await.unwrap();
    assert_eq!(reloaded.status, TaskStatus::Failed);

    cleanup(&store, id).await;
}

#[tokio::test]
async fn claim_workflow_skips_already_leased_rows() {
    let Some(store) = test_store().await else { return };
    let mut execution = WorkflowExecution::new("greet", json!({}));
    execution.status = WorkflowStatus::Running;
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();
    store.mark_runnable_if_active(id).await.unwrap();

    let first = store.claim_workflow(std::time::Duration::from_secs(30)).await.unwrap();
    assert!(first.is_some());

    let second = store.claim_workflow(std::time::Duration::from_secs(30)).await.unwrap();
    assert!(second.is_none(), "a freshly leased row must not be claimable again");

    cleanup(&store, id).await;
}

#[tokio::test]
async fn finish_workflow_is_sticky_on_terminal_status() {
    let Some(store) = test_store().await else { return };
    let execution = WorkflowExecution::new("greet", json!({}));
    let id = execution.id;
    store.create_workflow(execution).await.unwrap();

    store.finish_workflow(id, WorkflowStatus::Completed, Some(json!(1)), None).await.unwrap();
    store.finish_workflow(id, WorkflowStatus::Failed, None, Some("late failure".into())).await.unwrap();

    let reloaded = store.get_workflow(id).await.unwrap();
    assert_eq!(reloaded.status, WorkflowStatus::Completed, "terminal status must not change");
    assert_eq!(reloaded.result, Some(json!(1)));

    cleanup(&store, id).await;
}
