//! Activity execution context.
//!
//! Scoped to a single follower invocation — "the per-process 'currently
//! running activity id' ... model[ed] as a local context parameter ... not
//! a shared mutable" (SPEC_FULL §4.6/§9). Unlike the teacher's
//! channel-based heartbeat (scoped to an in-process `tokio::task`), this
//! context writes heartbeats straight through the `Store`, since a follower
//! here is a whole OS process executing exactly one activity at a time.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::persistence::{Store, StoreError};

/// Context passed to every activity invocation.
pub struct ActivityContext {
    store: Arc<dyn Store>,
    task_id: Uuid,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl ActivityContext {
    pub fn new(store: Arc<dyn Store>, task_id: Uuid, attempt: u32, max_attempts: u32) -> Self {
        Self {
            store,
            task_id,
            attempt,
            max_attempts,
        }
    }

    /// Record progress and reset the heartbeat clock (SPEC_FULL §4.6).
    pub async fn heartbeat(&self, details: Option<Value>) -> Result<(), StoreError> {
        self.store.heartbeat_activity(self.task_id, details).await
    }

    /// `maximum_attempts == 0` means unlimited, so this is never true then.
    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts > 0 && self.attempt >= self.max_attempts
    }
}

tokio::task_local! {
    /// The context of whichever activity invocation is currently in flight
    /// on this task. Bound by [`run_with_context`] around the registered
    /// activity call; read by the free-standing [`heartbeat`].
    static CURRENT: ActivityContext;
}

/// Run `body` — the registered activity's future — with `ctx` bound as the
/// current task's activity context (SPEC_FULL §4.6/§9).
pub async fn run_with_context<F: std::future::Future>(ctx: ActivityContext, body: F) -> F::Output {
    CURRENT.scope(ctx, body).await
}

/// Heartbeat the activity currently executing on this task — callable from
/// anywhere in the registered activity body's call stack, without threading
/// an `&ActivityContext` parameter through it.
///
/// Panics if called outside a [`run_with_context`] scope, same as any other
/// `tokio::task_local!` access.
pub async fn heartbeat(details: Option<Value>) -> Result<(), StoreError> {
    let (store, task_id) = CURRENT.with(|ctx| (Arc::clone(&ctx.store), ctx.task_id));
    store.heartbeat_activity(task_id, details).await
}
