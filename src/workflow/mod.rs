//! Workflow-authoring surface (C4): the replay context a workflow body
//! runs against.
//!
//! A workflow is a plain synchronous closure registered with
//! [`crate::engine::Registry::register_workflow`]; all durable progress —
//! activities, timers, signals, child workflows, versioning — happens
//! through [`ReplayContext`], the sole argument it receives.

mod context;

pub use context::{
    canonical_json, ActivityCallOptions, ActivityHandle, ChildWorkflowOptions, ContextError, ReplayContext,
};
pub(crate) use context::Effect;
