//! kopsflow-cloudup: turn a stored cluster into cloud resources
//!
//! [`ApplyClusterCmd`] completes the cluster spec, validates it, pins the
//! Kubernetes assets, renders per-group bootstrap scripts and hands the
//! task graph built by the [`model`] builders to the executor.

pub mod apply;
pub mod assets;
pub mod bootstrap;
pub mod error;
pub mod model;
pub mod new_cluster;
pub mod phase;

pub use apply::{ApplyClusterCmd, ApplyResults, CA_KEYSETS};
pub use assets::{AssetList, FileAsset, HashResolver, RemoteHashResolver, StaticHashResolver};
pub use bootstrap::{BootstrapScript, BootstrapScriptBuilder, NodeupConfig};
pub use error::{CloudupError, Result};
pub use new_cluster::{NewClusterOptions, NewClusterResult, new_cluster, validate_new_cluster};
pub use phase::Phase;
