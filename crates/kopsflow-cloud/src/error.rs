//! Cloud error types

use thiserror::Error;

/// Cloud errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Cloud provider not supported: {0}")]
    ProviderNotSupported(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    /// Throttling, eventual consistency and 5xx responses
    #[error("Transient cloud error: {0}")]
    Transient(String),

    #[error("Cloud API error: {0}")]
    Api(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Refusing to delete shared resource {0}")]
    SharedResource(String),

    #[error("Deletion blocked: {0}")]
    DeletionBlocked(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        CloudError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }

    /// Whether the call may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_) | CloudError::DeletionBlocked(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(CloudError::Transient("throttled".into()).is_transient());
        assert!(!CloudError::Api("bad request".into()).is_transient());
        assert!(CloudError::not_found("vpc", "vpc-1").is_not_found());
        assert_eq!(
            CloudError::not_found("vpc", "vpc-1").to_string(),
            "vpc not found: vpc-1"
        );
    }
}
