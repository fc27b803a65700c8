//! Executor error types

use crate::task::TaskKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FiError {
    #[error("Dependency cycle: {0}")]
    Cycle(String),

    #[error("Conflicting definitions for task {key}: {detail}")]
    ConflictingTask { key: TaskKey, detail: String },

    #[error("Task {from} references unknown task {to}")]
    MissingReference { from: TaskKey, to: TaskKey },

    #[error("Invalid task reference: {0}")]
    InvalidReference(String),

    #[error("Shared resource for task {0} not found")]
    SharedNotFound(TaskKey),

    #[error("Task {key} rejected changes: {message}")]
    InvalidChange { key: TaskKey, message: String },

    #[error("Task {key} must exist unchanged, but {detail}")]
    LifecycleViolation { key: TaskKey, detail: String },

    #[error("Output of task {0} not available")]
    UnresolvedOutput(TaskKey),

    #[error("Task {key} does not support the {target} target")]
    UnsupportedTarget { key: TaskKey, target: String },

    #[error("No {0} configured for this run")]
    NotConfigured(&'static str),

    #[error("Unknown lifecycle: {0}")]
    UnknownLifecycle(String),

    #[error("{count} task(s) failed: {summary}")]
    ApplyFailed { count: usize, summary: String },

    #[error("Apply cancelled")]
    Cancelled,

    #[error(transparent)]
    Cloud(#[from] kopsflow_cloud::CloudError),

    #[error(transparent)]
    Pki(#[from] kopsflow_pki::PkiError),

    #[error(transparent)]
    Vfs(#[from] kopsflow_vfs::VfsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FiError {
    /// Whether a direct-target call may succeed if retried
    pub fn is_transient(&self) -> bool {
        match self {
            FiError::Cloud(e) => e.is_transient(),
            FiError::Vfs(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FiError>;
