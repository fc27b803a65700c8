//! Path values over object stores

use crate::error::{Result, VfsError};
use crate::store::{Acl, Hash, ObjectStore};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A location inside an [`ObjectStore`]
#[derive(Clone)]
pub struct VfsPath {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl VfsPath {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: normalize(&key.into()),
        }
    }

    /// Key relative to the store root
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last path segment
    pub fn base(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }

    pub fn is_remote(&self) -> bool {
        self.store.is_remote()
    }

    /// Append one or more segments (`a/b` is split on `/`)
    pub fn join(&self, sub: impl AsRef<str>) -> VfsPath {
        let sub = normalize(sub.as_ref());
        let key = if self.key.is_empty() {
            sub
        } else if sub.is_empty() {
            self.key.clone()
        } else {
            format!("{}/{}", self.key, sub)
        };
        VfsPath {
            store: self.store.clone(),
            key,
        }
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        tracing::debug!("Reading {}", self);
        self.store.read(&self.key).await
    }

    /// Read the object, mapping `NotFound` to `None`
    pub async fn read_optional(&self) -> Result<Option<Vec<u8>>> {
        match self.read().await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&self, data: &[u8], acl: Acl) -> Result<()> {
        tracing::debug!("Writing {} ({} bytes)", self, data.len());
        self.store.write(&self.key, data, acl).await
    }

    /// Compare-and-swap on creation
    pub async fn write_file_if_not_exists(&self, data: &[u8], acl: Acl) -> Result<()> {
        tracing::debug!("Creating {} ({} bytes)", self, data.len());
        self.store.create_new(&self.key, data, acl).await
    }

    /// Immediate children of this path
    pub async fn list(&self) -> Result<Vec<VfsPath>> {
        let prefix = self.dir_prefix();
        let keys = self.store.list(&prefix).await?;
        let mut children = BTreeSet::new();
        for key in keys {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Some(first) = rest.split('/').find(|s| !s.is_empty()) {
                    children.insert(first.to_string());
                }
            }
        }
        Ok(children.into_iter().map(|c| self.join(c)).collect())
    }

    /// Every object below this path
    pub async fn read_tree(&self) -> Result<Vec<VfsPath>> {
        let prefix = self.dir_prefix();
        let mut keys = self.store.list(&prefix).await?;
        keys.sort();
        Ok(keys
            .into_iter()
            .map(|k| VfsPath::new(self.store.clone(), k))
            .collect())
    }

    pub async fn remove(&self) -> Result<()> {
        tracing::debug!("Removing {}", self);
        self.store.remove(&self.key).await
    }

    /// Remove every object below this path, and the path itself
    pub async fn remove_all(&self) -> Result<()> {
        for child in self.read_tree().await? {
            match child.remove().await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        match self.remove().await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn hash(&self) -> Result<Hash> {
        self.store.hash(&self.key).await
    }

    /// The path one level up, or `None` at the store root
    pub fn parent(&self) -> Option<VfsPath> {
        if self.key.is_empty() {
            return None;
        }
        let parent = match self.key.rfind('/') {
            Some(idx) => self.key[..idx].to_string(),
            None => String::new(),
        };
        Some(VfsPath {
            store: self.store.clone(),
            key: parent,
        })
    }

    fn dir_prefix(&self) -> String {
        if self.key.is_empty() {
            String::new()
        } else {
            format!("{}/", self.key)
        }
    }
}

fn normalize(key: &str) -> String {
    key.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.store.root().trim_end_matches('/');
        match (root.is_empty(), self.key.is_empty()) {
            (_, true) => write!(f, "{}://{}", self.store.scheme(), root),
            (true, false) => write!(f, "{}://{}", self.store.scheme(), self.key),
            (false, false) => write!(f, "{}://{}/{}", self.store.scheme(), root, self.key),
        }
    }
}

impl fmt::Debug for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VfsPath({})", self)
    }
}

impl PartialEq for VfsPath {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

/// Reject keys that would escape the store root
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.split('/').any(|s| s == "..") {
        return Err(VfsError::InvalidPath(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::memfs::MemFs;
    use crate::store::Acl;
    use std::sync::Arc;

    use super::*;

    fn root() -> VfsPath {
        VfsPath::new(Arc::new(MemFs::new()), "")
    }

    #[test]
    fn test_join_normalizes() {
        let p = root().join("clusters").join("/a//b/");
        assert_eq!(p.key(), "clusters/a/b");
        assert_eq!(p.base(), "b");
        assert_eq!(p.to_string(), "memfs://clusters/a/b");
        assert_eq!(p.parent().unwrap().key(), "clusters/a");
    }

    #[tokio::test]
    async fn test_list_immediate_children() {
        let base = root().join("c1");
        base.join("config").write(b"x", Acl::Private).await.unwrap();
        base.join("instancegroup/nodes").write(b"y", Acl::Private).await.unwrap();
        base.join("instancegroup/master").write(b"z", Acl::Private).await.unwrap();

        let names: Vec<String> = base
            .list()
            .await
            .unwrap()
            .iter()
            .map(|p| p.base().to_string())
            .collect();
        assert_eq!(names, vec!["config", "instancegroup"]);

        let tree = base.read_tree().await.unwrap();
        assert_eq!(tree.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let base = root().join("c1");
        base.join("a/b").write(b"1", Acl::Private).await.unwrap();
        base.join("c").write(b"2", Acl::Private).await.unwrap();
        base.remove_all().await.unwrap();
        assert!(base.read_tree().await.unwrap().is_empty());
    }
}
