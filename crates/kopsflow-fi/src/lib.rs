//! kopsflow-fi: the task graph executor
//!
//! A run builds a [`TaskMap`] of idempotent [`Task`]s, each describing one
//! desired resource. The [`Executor`] orders them by the references in
//! their inputs, observes what exists, computes [`Changes`] and renders each
//! one to the selected [`Target`]: the cloud API, Terraform, CloudFormation
//! or a dry run.

pub mod action;
pub mod changes;
pub mod context;
pub mod error;
pub mod executor;
pub mod target;
pub mod task;
pub mod taskmap;
pub mod tasks;

pub use action::{Action, ActionType, ApplyReport, ApplySummary, TaskFailure};
pub use changes::{Changes, FieldChange};
pub use context::Context;
pub use error::{FiError, Result};
pub use executor::{Executor, LifecycleOverrides};
pub use target::{CloudFormationTarget, HclValue, Target, TargetKind, TerraformTarget};
pub use task::{FieldPolicy, Lifecycle, Task, TaskKey, TaskRef};
pub use taskmap::TaskMap;

#[doc(hidden)]
pub use serde_json::Value;
