//! Registry (C3): name -> callable maps for workflows and activities.
//!
//! Registration attaches the default `timeout`, `heartbeat_timeout`, and
//! `retry_policy` metadata a [`crate::workflow::ReplayContext`] and the
//! activity runner fall back to when a call site doesn't override them
//! (SPEC_FULL §4.3).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::activity::ActivityError;
use crate::reliability::{RetryPolicy, TimeoutConfig};
use crate::workflow::{ContextError, ReplayContext};

/// A registered workflow callable, erased to operate on JSON.
///
/// Workflow bodies are ordinary synchronous Rust closures: all progress
/// through activities/timers/signals/children happens through `ctx`, which
/// either answers from replayed history or raises [`ContextError::Suspend`]
/// (SPEC_FULL §4.4, §9 — no coroutine or async primitive is exposed here).
pub type WorkflowFn = Arc<dyn Fn(&mut ReplayContext<'_>, Value) -> Result<Value, ContextError> + Send + Sync>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered activity callable, erased to operate on JSON.
pub type ActivityFn =
    Arc<dyn Fn(Value, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

/// Default metadata attached to a registered workflow or activity.
#[derive(Debug, Clone, Default)]
pub struct CallableDefaults {
    pub timeout: TimeoutConfig,
    pub retry_policy: RetryPolicy,
}

struct WorkflowEntry {
    func: WorkflowFn,
    defaults: CallableDefaults,
}

struct ActivityEntry {
    func: ActivityFn,
    defaults: CallableDefaults,
}

/// Errors from registry lookups (SPEC_FULL §7: `UnknownWorkflow`/`UnknownActivity`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("unknown activity: {0}")]
    UnknownActivity(String),
}

/// Name -> callable maps for workflows and activities (C3).
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<String, WorkflowEntry>,
    activities: HashMap<String, ActivityEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow function taking/returning typed, `serde`-able
    /// values. Internally erased to JSON so the Stepper can dispatch by name
    /// alone.
    pub fn register_workflow<I, O, F>(&mut self, name: impl Into<String>, defaults: CallableDefaults, f: F)
    where
        I: DeserializeOwned,
        O: Serialize,
        F: Fn(&mut ReplayContext<'_>, I) -> Result<O, ContextError> + Send + Sync + 'static,
    {
        let erased: WorkflowFn = Arc::new(move |ctx, input| {
            let input: I = serde_json::from_value(input)
                .map_err(|e| ContextError::Custom(format!("invalid workflow input: {e}")))?;
            let output = f(ctx, input)?;
            serde_json::to_value(output)
                .map_err(|e| ContextError::Custom(format!("invalid workflow output: {e}")))
        });
        self.workflows.insert(name.into(), WorkflowEntry { func: erased, defaults });
    }

    /// Register an activity function taking `(args, kwargs)` as raw JSON.
    /// Most activities only need positional `args`; `kwargs` carries the
    /// rest (SPEC_FULL §3.3, §6.5).
    pub fn register_activity<F, Fut>(&mut self, name: impl Into<String>, defaults: CallableDefaults, f: F)
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let erased: ActivityFn = Arc::new(move |args, kwargs| Box::pin(f(args, kwargs)));
        self.activities.insert(name.into(), ActivityEntry { func: erased, defaults });
    }

    pub fn workflow(&self, name: &str) -> Result<&WorkflowFn, RegistryError> {
        self.workflows
            .get(name)
            .map(|e| &e.func)
            .ok_or_else(|| RegistryError::UnknownWorkflow(name.to_string()))
    }

    pub fn workflow_defaults(&self, name: &str) -> Option<&CallableDefaults> {
        self.workflows.get(name).map(|e| &e.defaults)
    }

    pub fn activity(&self, name: &str) -> Result<&ActivityFn, RegistryError> {
        self.activities
            .get(name)
            .map(|e| &e.func)
            .ok_or_else(|| RegistryError::UnknownActivity(name.to_string()))
    }

    pub fn activity_defaults(&self, name: &str) -> Option<&CallableDefaults> {
        self.activities.get(name).map(|e| &e.defaults)
    }

    pub fn contains_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn contains_activity(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_workflow_is_an_error() {
        let registry = Registry::new();
        assert!(matches!(
            registry.workflow("nope"),
            Err(RegistryError::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn unknown_activity_is_an_error() {
        let registry = Registry::new();
        assert!(matches!(
            registry.activity("nope"),
            Err(RegistryError::UnknownActivity(_))
        ));
    }

    #[tokio::test]
    async fn registered_activity_round_trips_json() {
        let mut registry = Registry::new();
        registry.register_activity("echo", CallableDefaults::default(), |args, _kwargs| async move {
            Ok(args)
        });

        let f = registry.activity("echo").unwrap().clone();
        let result = f(json!([1, 2, 3]), json!({})).await.unwrap();
        assert_eq!(result, json!([1, 2, 3]));
    }

    #[test]
    fn contains_reflects_registration() {
        let mut registry = Registry::new();
        assert!(!registry.contains_activity("echo"));
        registry.register_activity("echo", CallableDefaults::default(), |args, _| async move { Ok(args) });
        assert!(registry.contains_activity("echo"));
    }
}
