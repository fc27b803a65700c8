//! Local filesystem object store

use crate::error::{Result, VfsError};
use crate::path::check_key;
use crate::store::{Acl, Hash, ObjectStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Objects stored as files below a root directory
#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
    root_display: String,
}

impl LocalFs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let root_display = root.display().to_string();
        Self { root, root_display }
    }

    fn file_path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalFs {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn root(&self) -> &str {
        &self.root_display
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.file_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VfsError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, data: &[u8], _acl: Acl) -> Result<()> {
        let path = self.file_path(key)?;
        Self::ensure_parent(&path).await?;

        // Write to a sibling temp file, then rename over the target
        let tmp = path.with_file_name(format!(
            ".{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        ));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn create_new(&self, key: &str, data: &[u8], _acl: Acl) -> Result<()> {
        let path = self.file_path(key)?;
        Self::ensure_parent(&path).await?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(VfsError::AlreadyExists(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !self.root.exists() {
            return Ok(keys);
        }

        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') && name.ends_with(".tmp") {
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.root)
                    .map_err(|e| VfsError::Fatal(e.to_string()))?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.file_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                fs::remove_dir_all(&path).await?;
                Ok(())
            }
            Ok(_) => {
                fs::remove_file(&path).await?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VfsError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn hash(&self, key: &str) -> Result<Hash> {
        let data = self.read(key).await?;
        Ok(Hash::sha256_of(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_read_list() {
        let dir = tempdir().unwrap();
        let store = LocalFs::new(dir.path());

        store.write("c/config", b"hello", Acl::Private).await.unwrap();
        store.write("c/instancegroup/nodes", b"ig", Acl::Private).await.unwrap();

        assert_eq!(store.read("c/config").await.unwrap(), b"hello");
        let keys = store.list("c/").await.unwrap();
        assert_eq!(keys, vec!["c/config", "c/instancegroup/nodes"]);
    }

    #[tokio::test]
    async fn test_create_new_conflict() {
        let dir = tempdir().unwrap();
        let store = LocalFs::new(dir.path());

        store.create_new("secret", b"a", Acl::Private).await.unwrap();
        let err = store.create_new("secret", b"b", Acl::Private).await.unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_hash_is_sha256() {
        let dir = tempdir().unwrap();
        let store = LocalFs::new(dir.path());
        store.write("x", b"abc", Acl::Private).await.unwrap();
        let hash = store.hash("x").await.unwrap();
        assert_eq!(
            hash.hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
