//! # Durable Execution Engine
//!
//! A PostgreSQL-backed durable workflow execution engine. Workflow
//! functions are ordinary synchronous closures that, through a
//! [`workflow::ReplayContext`], schedule activities, timers, signals, and
//! child workflows; the engine makes forward progress across process
//! crashes by replaying each workflow's append-only history deterministically.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Dispatcher                            │
//! │   (enforces timeouts, claims due work, runs it in follower   │
//! │    subprocesses — worker::Dispatcher)                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Stepper (engine::stepper)                       │
//! │   drives one workflow turn through a ReplayContext            │
//! │   (workflow::ReplayContext) until it suspends or returns     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Store (persistence)                    │
//! │  workflow_executions / history_events / activity_tasks       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use durable_engine::prelude::*;
//! use serde_json::json;
//!
//! let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
//! let mut registry = Registry::new();
//! registry.register_activity("echo", CallableDefaults::default(), |input| async move { Ok(input) });
//! registry.register_workflow("greet", CallableDefaults::default(), |ctx, input| {
//!     ctx.run_activity("echo", input)
//! });
//!
//! let id = start_workflow(&store, &registry, "greet", json!({"name": "Ada"}), None).await?;
//! ```

pub mod activity;
pub mod api;
pub mod engine;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod telemetry;
pub mod worker;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::activity::{execute_activity, heartbeat, run_with_context, ActivityContext, ActivityError, UnknownActivityError};
    pub use crate::api::{cancel_workflow, poll_status, signal_workflow, start_workflow, WorkflowStatusSnapshot};
    pub use crate::engine::{step_workflow, ActivityFn, CallableDefaults, Registry, RegistryError, StepError, WorkflowFn};
    pub use crate::model::{
        ActivityTask, ErrorCode, HistoryEvent, HistoryEventType, TaskStatus, WorkflowExecution, WorkflowStatus,
        FINAL_POS, SPECIAL_POS,
    };
    pub use crate::persistence::{ActivityOutcome, InMemoryStore, NewActivityTask, PostgresStore, Store, StoreError};
    pub use crate::reliability::{next_delay, BackoffStrategy, RetryPolicy, TimeoutCause, TimeoutConfig};
    pub use crate::telemetry::{init_tracing, TracingGuard};
    pub use crate::worker::{Dispatcher, DispatcherConfig, DispatcherError, FOLLOWER_FLAG};
    pub use crate::workflow::{ActivityHandle, ChildWorkflowOptions, ContextError, ReplayContext};
}

// Re-export key types at crate root, following the same flat-surface idiom
// the prelude mirrors.
pub use activity::{execute_activity, heartbeat, run_with_context, ActivityContext, ActivityError, UnknownActivityError};
pub use api::{cancel_workflow, poll_status, signal_workflow, start_workflow, WorkflowStatusSnapshot};
pub use engine::{step_workflow, Registry, RegistryError, StepError};
pub use model::{ActivityTask, ErrorCode, HistoryEvent, HistoryEventType, TaskStatus, WorkflowExecution, WorkflowStatus};
pub use persistence::{InMemoryStore, PostgresStore, Store, StoreError};
pub use reliability::RetryPolicy;
pub use telemetry::init_tracing;
pub use worker::{Dispatcher, DispatcherConfig};
pub use workflow::ReplayContext;
