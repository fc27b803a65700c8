use crate::validation::ValidationErrors;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Cluster already exists: {0}")]
    ClusterExists(String),

    #[error("InstanceGroup not found: {cluster}/{name}")]
    InstanceGroupNotFound { cluster: String, name: String },

    #[error("InstanceGroup already exists: {cluster}/{name}")]
    InstanceGroupExists { cluster: String, name: String },

    #[error("Unsupported apiVersion {api_version:?} for kind {kind:?}")]
    UnsupportedApiVersion { api_version: String, kind: String },

    #[error("Expected kind {expected}, found {found:?}")]
    UnexpectedKind { expected: String, found: String },

    #[error("Validation failed:\n{0}")]
    Validation(#[from] ValidationErrors),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Storage error: {0}")]
    Vfs(#[from] kopsflow_vfs::VfsError),

    #[error("Keystore error: {0}")]
    Pki(#[from] kopsflow_pki::PkiError),

    #[error("Config error: {0}")]
    Config(#[from] kopsflow_config::ConfigError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            CoreError::ClusterNotFound(_) | CoreError::InstanceGroupNotFound { .. } => true,
            CoreError::Vfs(e) => e.is_not_found(),
            CoreError::Pki(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
