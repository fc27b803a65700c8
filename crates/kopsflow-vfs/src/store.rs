//! Object store backend trait

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Access control applied to a written object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Acl {
    /// Only the owner can read (default)
    #[default]
    Private,
    /// Anyone may read the object (used for published discovery documents)
    PublicRead,
}

/// Hash algorithm reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

/// Provider-native checksum of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    /// Lower-case hex digest
    pub hex: String,
}

impl Hash {
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn md5_hex(hex: impl Into<String>) -> Self {
        Self {
            algorithm: HashAlgorithm::Md5,
            hex: hex.into().to_lowercase(),
        }
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.algorithm {
            HashAlgorithm::Md5 => write!(f, "md5:{}", self.hex),
            HashAlgorithm::Sha256 => write!(f, "sha256:{}", self.hex),
        }
    }
}

/// A flat key/value object store
///
/// Keys are `/`-separated and never start with `/`. Every backend (memfs,
/// local files, S3, GCS, Azure blob) implements this trait so that
/// [`crate::VfsPath`] can offer one uniform API.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// URL scheme, e.g. `s3` or `memfs`
    fn scheme(&self) -> &'static str;

    /// Bucket / container / root the keys are relative to
    fn root(&self) -> &str;

    /// Whether the store lives outside the local machine
    fn is_remote(&self) -> bool;

    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    async fn write(&self, key: &str, data: &[u8], acl: Acl) -> Result<()>;

    /// Create the object only if it does not exist yet
    ///
    /// Must use a provider-native precondition. Returns
    /// [`crate::VfsError::AlreadyExists`] when the object is present, and
    /// [`crate::VfsError::NotSupported`] when no such primitive exists.
    async fn create_new(&self, key: &str, data: &[u8], acl: Acl) -> Result<()>;

    /// List every key under `prefix` (recursive)
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn hash(&self, key: &str) -> Result<Hash>;
}
