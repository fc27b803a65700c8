//! Rollout error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RolloutError {
    /// A Kubernetes API call failed; `status` is the HTTP code when the
    /// server answered
    #[error("Kubernetes API error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Kube { status: Option<u16>, message: String },

    #[error("Failed to drain node {node}: {message}")]
    Drain { node: String, message: String },

    #[error("Cluster did not pass validation within {timeout}: {message}")]
    ValidationTimeout { timeout: String, message: String },

    #[error("Timed out waiting for a replacement in {group}")]
    ReplacementTimeout { group: String },

    #[error("Rolling update of {group} failed: {message}")]
    GroupFailed { group: String, message: String },

    #[error("Apply failed: {0}")]
    ApplyFailed(String),

    #[error("Rolling update stopped at {0} by the operator")]
    Declined(String),

    #[error("Cannot rotate keysets: {0}")]
    RotationPrecondition(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] kopsflow_core::CoreError),

    #[error(transparent)]
    Cloud(#[from] kopsflow_cloud::CloudError),

    #[error(transparent)]
    Cloudup(#[from] kopsflow_cloudup::CloudupError),

    #[error(transparent)]
    Pki(#[from] kopsflow_pki::PkiError),
}

impl RolloutError {
    pub fn kube(status: Option<u16>, message: impl Into<String>) -> Self {
        RolloutError::Kube {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            RolloutError::Kube { status, .. } => *status == Some(404),
            RolloutError::Cloud(e) => e.is_not_found(),
            RolloutError::Core(e) => e.is_not_found(),
            RolloutError::Pki(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Eviction refused because a PodDisruptionBudget would be violated
    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, RolloutError::Kube { status: Some(429), .. })
    }

    /// 5xx responses and connection failures
    pub fn is_transient(&self) -> bool {
        match self {
            RolloutError::Kube { status, .. } => status.is_none_or(|s| s >= 500),
            RolloutError::Cloud(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<kube::Error> for RolloutError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => RolloutError::kube(Some(response.code), response.message),
            other => RolloutError::kube(None, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RolloutError>;
