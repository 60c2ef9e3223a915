//! Follower (SPEC_FULL §4.7, §6.4): the stateless subprocess that executes
//! exactly one workflow step or one activity per incoming protocol line.
//!
//! The dispatcher spawns followers as `tokio::process::Command`-launched
//! children of the embedding application's own binary, re-invoked with a
//! hidden flag; that binary's `main` is expected to detect the flag and
//! call [`run_follower`] against stdin/stdout instead of running its normal
//! entry point. This crate does not ship that flag or binary itself —
//! wiring a `--follower` switch into `main` is the embedding application's
//! job (SPEC_FULL §1 names "framework integration glue" as a non-goal).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

use super::protocol::{FollowerRequest, FollowerResponse};
use crate::activity::execute_activity;
use crate::engine::registry::Registry;
use crate::engine::stepper::step_workflow;
use crate::persistence::Store;

/// Run the follower loop against process stdio until `exit` is received,
/// stdin closes, or `max_tasks` messages have been handled.
pub async fn run_follower_stdio(
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    max_tasks: Option<u64>,
) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_follower(stdin, stdout, store, registry, max_tasks).await
}

/// Generic over the transport so the protocol loop is testable without
/// real stdio.
#[instrument(skip(reader, writer, store, registry))]
pub async fn run_follower<R, W>(
    mut reader: R,
    mut writer: W,
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    max_tasks: Option<u64>,
) -> std::io::Result<()>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut line = String::new();
    let mut handled = 0u64;

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: FollowerRequest = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, line = trimmed, "malformed follower request");
                write_response(&mut writer, FollowerResponse::failed(e.to_string())).await?;
                continue;
            }
        };

        match request {
            FollowerRequest::Exit => {
                debug!("follower received exit");
                break;
            }
            FollowerRequest::Activity { id } => {
                let response = handle_activity(&store, &registry, id).await;
                write_response(&mut writer, response).await?;
            }
            FollowerRequest::Workflow { id } => {
                let response = handle_workflow(&store, &registry, id).await;
                write_response(&mut writer, response).await?;
            }
        }

        handled += 1;
        if max_tasks.is_some_and(|max| handled >= max) {
            debug!(handled, "follower reached its task lifetime limit");
            break;
        }
    }

    Ok(())
}

async fn handle_activity(store: &Arc<dyn Store>, registry: &Registry, id: uuid::Uuid) -> FollowerResponse {
    let task = match store.get_activity(id).await {
        Ok(task) => task,
        Err(e) => return FollowerResponse::failed(e.to_string()),
    };
    match execute_activity(&task, store, registry).await {
        Ok(()) => FollowerResponse::ok(),
        Err(e) => FollowerResponse::failed(e.to_string()),
    }
}

async fn handle_workflow(store: &Arc<dyn Store>, registry: &Registry, id: uuid::Uuid) -> FollowerResponse {
    let execution = match store.get_workflow(id).await {
        Ok(execution) => execution,
        Err(e) => return FollowerResponse::failed(e.to_string()),
    };
    match step_workflow(store, registry, execution).await {
        Ok(()) => FollowerResponse::ok(),
        Err(e) => FollowerResponse::failed(e.to_string()),
    }
}

async fn write_response<W: AsyncWriteExt + Unpin>(writer: &mut W, response: FollowerResponse) -> std::io::Result<()> {
    let mut line = serde_json::to_string(&response).unwrap_or_else(|_| r#"{"ok":false}"#.to_string());
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
