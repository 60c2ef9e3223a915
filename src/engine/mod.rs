//! Workflow execution engine: the [`Registry`] (C3) callables are looked up
//! from, and the [`stepper`] (C5) that drives one workflow turn against it.

pub mod registry;
pub mod stepper;

pub use registry::{ActivityFn, CallableDefaults, Registry, RegistryError, WorkflowFn};
pub use stepper::{step_workflow, StepError};
