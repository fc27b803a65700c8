//! Apply pipeline error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudupError {
    #[error("{0}")]
    InvalidOptions(String),

    #[error("Unknown phase {0:?}; expected network, security or cluster")]
    UnknownPhase(String),

    #[error("The {target} target does not support {provider} clusters")]
    UnsupportedTarget { target: String, provider: String },

    #[error("Cluster is not ready to apply: {0}")]
    IncompleteCluster(String),

    #[error("Shared VPC {0} not found")]
    SharedVpcNotFound(String),

    #[error("Cannot determine hash for {url}: {detail}")]
    AssetHash { url: String, detail: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Core(#[from] kopsflow_core::CoreError),

    #[error(transparent)]
    Fi(#[from] kopsflow_fi::FiError),

    #[error(transparent)]
    Cloud(#[from] kopsflow_cloud::CloudError),

    #[error(transparent)]
    Pki(#[from] kopsflow_pki::PkiError),

    #[error(transparent)]
    Vfs(#[from] kopsflow_vfs::VfsError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CloudupError {
    pub fn is_validation(&self) -> bool {
        match self {
            CloudupError::Core(e) => e.is_validation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudupError>;
