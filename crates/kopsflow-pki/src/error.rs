//! PKI error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PkiError {
    #[error("Keyset not found: {0}")]
    KeysetNotFound(String),

    #[error("Keyset item not found: {keyset}/{id}")]
    ItemNotFound { keyset: String, id: String },

    #[error("Keyset item already exists: {keyset}/{id}")]
    ItemExists { keyset: String, id: String },

    #[error("Invalid keyset operation on {keyset}: {message}")]
    InvalidOperation { keyset: String, message: String },

    #[error("Keyset {0} has no usable primary item")]
    NoPrimary(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid SSH public key: {0}")]
    InvalidSshKey(String),

    #[error("Unsupported keyset format: {0}")]
    UnsupportedFormat(String),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Concurrent write detected: {0}")]
    ConflictingWrite(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("Storage error: {0}")]
    Vfs(#[from] kopsflow_vfs::VfsError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PkiError {
    pub fn is_not_found(&self) -> bool {
        match self {
            PkiError::KeysetNotFound(_)
            | PkiError::ItemNotFound { .. }
            | PkiError::SecretNotFound(_) => true,
            PkiError::Vfs(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub(crate) fn invalid(keyset: &str, message: impl Into<String>) -> Self {
        PkiError::InvalidOperation {
            keyset: keyset.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PkiError>;
