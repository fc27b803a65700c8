//! Named secrets stored below `<cluster>/secrets/`

use crate::error::{PkiError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kopsflow_vfs::{Acl, VfsErrorKind, VfsPath};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Generated secrets are 32 random bytes, base64 encoded
const GENERATED_SECRET_BYTES: usize = 32;

/// Opaque secret bytes
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(<{} bytes>)", self.data.len())
    }
}

impl Secret {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// A random token; the stored bytes are themselves printable base64
    pub fn generate() -> Self {
        let mut buf = [0u8; GENERATED_SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut buf);
        let token = STANDARD.encode(buf).replace(['+', '/', '='], "");
        Self::new(token.into_bytes())
    }

    pub fn as_string(&self) -> Result<String> {
        String::from_utf8(self.data.clone())
            .map_err(|e| PkiError::UnsupportedFormat(format!("secret is not utf-8: {}", e)))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&SecretFile {
            data: STANDARD.encode(&self.data),
        })?)
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let file: SecretFile = serde_json::from_slice(raw)?;
        let data = STANDARD
            .decode(file.data.as_bytes())
            .map_err(|e| PkiError::UnsupportedFormat(format!("secret data: {}", e)))?;
        Ok(Self { data })
    }
}

#[derive(Serialize, Deserialize)]
struct SecretFile {
    #[serde(rename = "Data")]
    data: String,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn find_secret(&self, name: &str) -> Result<Option<Secret>>;

    /// Return the stored secret, or atomically create `secret` under `name`.
    /// The boolean reports whether this call created it.
    async fn get_or_create_secret(&self, name: &str, secret: Secret) -> Result<(Secret, bool)>;

    async fn replace_secret(&self, name: &str, secret: &Secret) -> Result<()>;

    async fn delete_secret(&self, name: &str) -> Result<()>;

    async fn list_secrets(&self) -> Result<Vec<String>>;

    async fn get_secret(&self, name: &str) -> Result<Secret> {
        self.find_secret(name)
            .await?
            .ok_or_else(|| PkiError::SecretNotFound(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct VfsSecretStore {
    base: VfsPath,
}

impl VfsSecretStore {
    /// `cluster_root` is `<state>/<cluster>`
    pub fn new(cluster_root: &VfsPath) -> Self {
        Self {
            base: cluster_root.join("secrets"),
        }
    }

    fn path(&self, name: &str) -> Result<VfsPath> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(PkiError::UnsupportedFormat(format!(
                "invalid secret name {:?}",
                name
            )));
        }
        Ok(self.base.join(name))
    }
}

#[async_trait]
impl SecretStore for VfsSecretStore {
    async fn find_secret(&self, name: &str) -> Result<Option<Secret>> {
        match self.path(name)?.read_optional().await? {
            Some(raw) => Ok(Some(Secret::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_or_create_secret(&self, name: &str, secret: Secret) -> Result<(Secret, bool)> {
        let path = self.path(name)?;
        match path
            .write_file_if_not_exists(&secret.encode()?, Acl::Private)
            .await
        {
            Ok(()) => {
                tracing::info!(secret = %name, "Created secret");
                Ok((secret, true))
            }
            Err(e) if e.kind() == VfsErrorKind::AlreadyExists => {
                // Someone else won the race; theirs is authoritative
                let raw = path.read().await?;
                Ok((Secret::decode(&raw)?, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_secret(&self, name: &str, secret: &Secret) -> Result<()> {
        self.path(name)?.write(&secret.encode()?, Acl::Private).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        match self.path(name)?.remove().await {
            Err(e) if e.is_not_found() => Err(PkiError::SecretNotFound(name.to_string())),
            other => Ok(other?),
        }
    }

    async fn list_secrets(&self) -> Result<Vec<String>> {
        Ok(self
            .base
            .list()
            .await?
            .iter()
            .map(|p| p.base().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kopsflow_vfs::MemFs;
    use std::sync::Arc;

    fn store() -> (VfsSecretStore, VfsPath) {
        let root = VfsPath::new(Arc::new(MemFs::new()), "example.com");
        (VfsSecretStore::new(&root), root)
    }

    #[tokio::test]
    async fn test_get_or_create_is_first_writer_wins() {
        let (store, _) = store();
        let (a, created_a) = store
            .get_or_create_secret("admin", Secret::new("first"))
            .await
            .unwrap();
        let (b, created_b) = store
            .get_or_create_secret("admin", Secret::new("second"))
            .await
            .unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        assert_eq!(b.as_string().unwrap(), "first");
    }

    #[tokio::test]
    async fn test_stored_format() {
        let (store, root) = store();
        store
            .replace_secret("kube", &Secret::new("hello"))
            .await
            .unwrap();
        let raw = root.join("secrets/kube").read().await.unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), r#"{"Data":"aGVsbG8="}"#);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (store, _) = store();
        store.replace_secret("b", &Secret::generate()).await.unwrap();
        store.replace_secret("a", &Secret::generate()).await.unwrap();
        assert_eq!(store.list_secrets().await.unwrap(), vec!["a", "b"]);

        store.delete_secret("a").await.unwrap();
        assert!(store.get_secret("a").await.unwrap_err().is_not_found());
        assert!(store.delete_secret("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_path_names() {
        let (store, _) = store();
        assert!(store.find_secret("../x").await.is_err());
    }

    #[test]
    fn test_generate_is_printable() {
        let s = Secret::generate();
        let text = s.as_string().unwrap();
        assert!(text.len() >= 40);
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
