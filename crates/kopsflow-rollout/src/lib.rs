//! kopsflow-rollout: keep a running cluster healthy while its machines change
//!
//! - [`drain`]: cordon a node and evict its pods through the eviction API
//! - [`validator`]: compare cloud groups with the Kubernetes API
//! - [`rolling`]: replace outdated instances group by group
//! - [`rotation`]: rotate CA keysets without losing trust
//!
//! Everything talks to Kubernetes through [`KubeClient`]; the `test-utils`
//! feature exposes an in-memory implementation for other crates' tests.

pub mod drain;
pub mod error;
pub mod k8s;
pub mod rolling;
pub mod rotation;
pub mod validator;
mod wait;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
#[cfg(test)]
mod testing;

pub use drain::{DrainOptions, DrainReport, Drainer};
pub use error::{Result, RolloutError};
pub use k8s::{KubeClient, KubeRsClient, Node, Pod, SecretRef};
pub use rolling::{
    Confirm, InstanceState, InstanceUpdate, RollingUpdateCluster, RollingUpdateOptions,
    RollingUpdateReport,
};
pub use rotation::{CaRotation, ClusterRotationDriver, KeysetStage, RotationDriver, RotationReport, keyset_stage};
pub use validator::{
    ClusterValidator, FailureKind, ValidationFailure, ValidationNode, ValidationPod, ValidationResult,
    Validator, failure_summary,
};
