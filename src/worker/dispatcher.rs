//! Dispatcher (C7): the long-running tick loop that enforces deadlines,
//! dispatches due activities and runnable workflows to follower
//! subprocesses, and reaps their results (SPEC_FULL §4.7).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::protocol::{FollowerRequest, FollowerResponse};
use crate::api::fail_queued_activities;
use crate::engine::registry::Registry;
use crate::engine::stepper::notify_parent;
use crate::model::{ActivityTask, ErrorCode, HistoryEventType, TaskStatus, WorkflowExecution, WorkflowStatus, SPECIAL_POS};
use crate::persistence::{ActivityOutcome, Store, StoreError};
use crate::reliability::retry::{next_delay, RetryPolicy};

/// Env var naming the flag the embedding binary should check for at
/// startup to decide whether to run as a follower instead of its normal
/// entry point. Not read by this crate — exported as the one piece of
/// coupling a `main()` needs to agree on.
pub const FOLLOWER_FLAG: &str = "--follower";

/// Builder-style configuration for the [`Dispatcher`], following the same
/// config-struct-with-defaults-and-`with_*`-methods idiom as
/// [`crate::reliability::RetryPolicy`] and [`crate::reliability::TimeoutConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Tick interval floor, used whenever the previous tick dispatched work.
    pub tick_min_interval: Duration,
    /// Tick interval ceiling, approached via `tick_backoff_multiplier` when
    /// consecutive ticks find nothing to dispatch.
    pub tick_max_interval: Duration,
    pub tick_backoff_multiplier: f64,
    /// Maximum rows fetched per deadline/dispatch query per tick.
    pub batch_size: i64,
    /// Number of follower subprocesses kept warm.
    pub follower_pool_size: usize,
    /// Leak/liveness guard: a follower exits itself after this many
    /// messages, and the dispatcher respawns its replacement.
    pub max_tasks_per_follower: Option<u64>,
    /// How long graceful shutdown waits for busy followers to finish their
    /// current message before the dispatcher returns anyway.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_min_interval: Duration::from_millis(100),
            tick_max_interval: Duration::from_secs(5),
            tick_backoff_multiplier: 1.5,
            batch_size: 50,
            follower_pool_size: 4,
            max_tasks_per_follower: Some(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_min_interval(mut self, interval: Duration) -> Self {
        self.tick_min_interval = interval;
        self
    }

    pub fn with_tick_max_interval(mut self, interval: Duration) -> Self {
        self.tick_max_interval = interval;
        self
    }

    pub fn with_tick_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.tick_backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_follower_pool_size(mut self, size: usize) -> Self {
        self.follower_pool_size = size.max(1);
        self
    }

    pub fn with_max_tasks_per_follower(mut self, max: Option<u64>) -> Self {
        self.max_tasks_per_follower = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn follower process: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
enum Assignment {
    Activity(Uuid),
    Workflow(Uuid),
}

struct IdleFollower {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    tasks_handled: u64,
}

enum ReportOutcome {
    Acked,
    Died,
    TimedOut,
}

struct FollowerReport {
    follower: Option<IdleFollower>,
    assignment: Assignment,
    outcome: ReportOutcome,
}

/// Drives the tick loop described in SPEC_FULL §4.7 against a pool of
/// follower subprocesses. Each [`Dispatcher`] owns exactly one pool; running
/// several in one fleet means running several processes, coordinated only
/// through the shared [`Store`].
pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    config: DispatcherConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, config: DispatcherConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            registry,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A sender that can be cloned out to trigger graceful shutdown from
    /// another task (e.g. a SIGTERM handler in the embedding binary).
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    fn spawn_follower(&self) -> Result<IdleFollower, DispatcherError> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg(FOLLOWER_FLAG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(IdleFollower {
            child,
            stdin,
            stdout,
            tasks_handled: 0,
        })
    }

    /// Run until `shutdown_handle()` sends `true`.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<(), DispatcherError> {
        let mut idle = Vec::with_capacity(self.config.follower_pool_size);
        for _ in 0..self.config.follower_pool_size {
            idle.push(self.spawn_follower()?);
        }
        let mut busy = 0usize;
        let (report_tx, mut report_rx) = mpsc::channel::<FollowerReport>(self.config.follower_pool_size.max(1) * 2);
        let mut interval = self.config.tick_min_interval;

        info!(pool_size = self.config.follower_pool_size, "dispatcher started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            self.enforce_deadlines().await?;

            let mut dispatched_any = false;

            let activity_budget = idle.len();
            if activity_budget > 0 {
                let due = self
                    .store
                    .claim_due_activities(Utc::now(), self.config.batch_size.min(activity_budget as i64))
                    .await?;
                for task in due {
                    let Some(follower) = idle.pop() else { break };
                    dispatched_any = true;
                    busy += 1;
                    let deadline = task.expires_at.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
                    self.dispatch(
                        follower,
                        Assignment::Activity(task.id),
                        FollowerRequest::Activity { id: task.id },
                        deadline,
                        report_tx.clone(),
                    );
                }
            }

            while let Some(follower) = idle.pop() {
                let Some(execution) = self.store.claim_workflow(self.config.shutdown_timeout).await? else {
                    idle.push(follower);
                    break;
                };
                dispatched_any = true;
                busy += 1;
                self.dispatch(
                    follower,
                    Assignment::Workflow(execution.id),
                    FollowerRequest::Workflow { id: execution.id },
                    None,
                    report_tx.clone(),
                );
            }

            while let Ok(report) = report_rx.try_recv() {
                busy -= 1;
                self.handle_report(report, &mut idle)?;
            }

            if dispatched_any {
                interval = self.config.tick_min_interval;
            } else {
                interval = self
                    .config
                    .tick_max_interval
                    .min(interval.mul_f64(self.config.tick_backoff_multiplier));
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown_rx.changed() => {}
            }
        }

        self.shutdown(idle, busy, report_rx).await;
        info!("dispatcher stopped");
        Ok(())
    }

    fn dispatch(
        &self,
        mut follower: IdleFollower,
        assignment: Assignment,
        request: FollowerRequest,
        deadline: Option<Duration>,
        report_tx: mpsc::Sender<FollowerReport>,
    ) {
        tokio::spawn(async move {
            let mut line = serde_json::to_string(&request).unwrap_or_default();
            line.push('\n');

            let work = async {
                follower.stdin.write_all(line.as_bytes()).await?;
                follower.stdin.flush().await?;
                let mut buf = String::new();
                let bytes = follower.stdout.read_line(&mut buf).await?;
                Ok::<_, std::io::Error>((bytes, buf))
            };

            let outcome = match deadline {
                Some(d) => match tokio::time::timeout(d, work).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(assignment = ?assignment, "follower deadline exceeded, killing process");
                        let _ = follower.child.kill().await;
                        let _ = report_tx
                            .send(FollowerReport {
                                follower: None,
                                assignment,
                                outcome: ReportOutcome::TimedOut,
                            })
                            .await;
                        return;
                    }
                },
                None => work.await,
            };

            match outcome {
                Ok((0, _)) => {
                    let _ = follower.child.kill().await;
                    let _ = report_tx
                        .send(FollowerReport {
                            follower: None,
                            assignment,
                            outcome: ReportOutcome::Died,
                        })
                        .await;
                }
                Ok((_, line)) => {
                    let ok = serde_json::from_str::<FollowerResponse>(line.trim()).map(|r| r.ok).unwrap_or(false);
                    follower.tasks_handled += 1;
                    let _ = report_tx
                        .send(FollowerReport {
                            follower: Some(follower),
                            assignment,
                            outcome: if ok { ReportOutcome::Acked } else { ReportOutcome::Died },
                        })
                        .await;
                }
                Err(_) => {
                    let _ = report_tx
                        .send(FollowerReport {
                            follower: None,
                            assignment,
                            outcome: ReportOutcome::Died,
                        })
                        .await;
                }
            }
        });
    }

    fn handle_report(&self, report: FollowerReport, idle: &mut Vec<IdleFollower>) -> Result<(), DispatcherError> {
        match report.outcome {
            ReportOutcome::Acked => {
                if let Some(follower) = report.follower {
                    let exhausted = self
                        .config
                        .max_tasks_per_follower
                        .is_some_and(|max| follower.tasks_handled >= max);
                    if exhausted {
                        debug!("follower reached its task lifetime, will be respawned next tick");
                        idle.push(self.spawn_follower()?);
                    } else {
                        idle.push(follower);
                    }
                }
            }
            ReportOutcome::Died => {
                warn!(assignment = ?report.assignment, "follower exited unexpectedly, spawning replacement");
                idle.push(self.spawn_follower()?);
            }
            ReportOutcome::TimedOut => {
                warn!(assignment = ?report.assignment, "follower timed out, spawning replacement");
                idle.push(self.spawn_follower()?);
            }
        }
        Ok(())
    }

    async fn shutdown(
        &self,
        mut idle: Vec<IdleFollower>,
        mut busy: usize,
        mut report_rx: mpsc::Receiver<FollowerReport>,
    ) {
        info!(busy, "dispatcher shutting down, draining busy followers");
        for mut follower in idle.drain(..) {
            let _ = follower.stdin.write_all(b"{\"cmd\":\"exit\"}\n").await;
            let _ = follower.stdin.flush().await;
            let _ = follower.child.kill().await;
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while busy > 0 && Instant::now() < deadline {
            match tokio::time::timeout(deadline - Instant::now(), report_rx.recv()).await {
                Ok(Some(report)) => {
                    busy -= 1;
                    if let Some(mut follower) = report.follower {
                        let _ = follower.child.kill().await;
                    }
                }
                _ => break,
            }
        }
        if busy > 0 {
            warn!(busy, "graceful shutdown timed out with followers still busy");
        }
    }

    /// Phase 0: deadline enforcement across queued/running activities and
    /// running workflows (SPEC_FULL §4.7 (0)).
    async fn enforce_deadlines(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let limit = self.config.batch_size;

        for task in self.store.due_queued_activity_timeouts(now, limit).await? {
            self.resolve_activity_deadline(&task, ErrorCode::ActivityTimeout).await?;
        }
        for task in self.store.due_activity_timeouts(now, limit).await? {
            self.resolve_activity_deadline(&task, ErrorCode::ActivityTimeout).await?;
        }
        for task in self.store.due_heartbeat_timeouts(now, limit).await? {
            self.resolve_heartbeat_deadline(&task).await?;
        }
        for execution in self.store.due_workflow_timeouts(now, limit).await? {
            self.resolve_workflow_deadline(&execution).await?;
        }
        Ok(())
    }

    async fn resolve_activity_deadline(&self, task: &ActivityTask, code: ErrorCode) -> Result<(), StoreError> {
        let policy: RetryPolicy = serde_json::from_value(task.retry_policy.clone()).unwrap_or_default();
        if task.attempt > 0 && !policy.is_exhausted(task.attempt) {
            let delay = next_delay(&policy, task.attempt);
            let retry_at = Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
            self.store
                .fail_activity(task.id, code.to_string(), ActivityOutcome::Retry { retry_at })
                .await?;
            return Ok(());
        }

        self.store
            .set_activity_status(task.id, TaskStatus::TimedOut, Some(code.to_string()))
            .await?;
        self.store
            .append_event(
                task.execution,
                HistoryEventType::ActivityTimedOut,
                task.pos,
                serde_json::json!({"activity_name": task.activity_name, "error": code.to_string()}),
            )
            .await?;
        self.store.mark_runnable_if_active(task.execution).await?;
        Ok(())
    }

    async fn resolve_heartbeat_deadline(&self, task: &ActivityTask) -> Result<(), StoreError> {
        let policy: RetryPolicy = serde_json::from_value(task.retry_policy.clone()).unwrap_or_default();
        if task.attempt > 0 && !policy.is_exhausted(task.attempt) {
            let delay = next_delay(&policy, task.attempt);
            let retry_at = Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
            self.store
                .fail_activity(task.id, ErrorCode::HeartbeatTimeout.to_string(), ActivityOutcome::Retry { retry_at })
                .await?;
            return Ok(());
        }

        self.store
            .set_activity_status(task.id, TaskStatus::TimedOut, Some(ErrorCode::HeartbeatTimeout.to_string()))
            .await?;
        self.store
            .append_event(
                task.execution,
                HistoryEventType::ActivityTimedOut,
                task.pos,
                serde_json::json!({
                    "activity_name": task.activity_name,
                    "error": ErrorCode::HeartbeatTimeout.to_string(),
                }),
            )
            .await?;

        // A stalled heartbeat means the activity's owning step can no
        // longer make progress: fail the workflow outright rather than
        // merely nudging it to replay (SPEC_FULL §4.7 (0)).
        let execution = self.store.get_workflow(task.execution).await?;
        if !execution.status.is_terminal() {
            self.store
                .append_event(
                    task.execution,
                    HistoryEventType::WorkflowFailed,
                    SPECIAL_POS,
                    serde_json::json!({"error": ErrorCode::HeartbeatTimeout.to_string()}),
                )
                .await?;
            self.store
                .finish_workflow(
                    task.execution,
                    WorkflowStatus::Failed,
                    None,
                    Some(ErrorCode::HeartbeatTimeout.to_string()),
                )
                .await?;
            fail_queued_activities(&self.store, task.execution, ErrorCode::HeartbeatTimeout).await?;
            notify_parent(
                &self.store,
                &execution,
                HistoryEventType::ChildWorkflowFailed,
                serde_json::json!({"child_id": task.execution, "error": ErrorCode::HeartbeatTimeout.to_string()}),
            )
            .await?;
        }
        Ok(())
    }

    async fn resolve_workflow_deadline(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.store
            .append_event(
                execution.id,
                HistoryEventType::WorkflowTimedOut,
                SPECIAL_POS,
                serde_json::json!({}),
            )
            .await?;
        self.store
            .finish_workflow(
                execution.id,
                WorkflowStatus::TimedOut,
                None,
                Some(ErrorCode::WorkflowTimeout.to_string()),
            )
            .await?;
        fail_queued_activities(&self.store, execution.id, ErrorCode::WorkflowTimeout).await?;
        notify_parent(
            &self.store,
            execution,
            HistoryEventType::ChildWorkflowTimedOut,
            serde_json::json!({"child_id": execution.id, "error": ErrorCode::WorkflowTimeout.to_string()}),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = DispatcherConfig::default();
        assert_eq!(config.follower_pool_size, 4);
        assert_eq!(config.tick_min_interval, Duration::from_millis(100));
    }

    #[test]
    fn builder_methods_enforce_minimums() {
        let config = DispatcherConfig::new().with_follower_pool_size(0).with_batch_size(0);
        assert_eq!(config.follower_pool_size, 1);
        assert_eq!(config.batch_size, 1);
    }
}
