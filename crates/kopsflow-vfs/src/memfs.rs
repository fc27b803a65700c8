//! In-memory object store, used for tests and dry runs

use crate::error::{Result, VfsError};
use crate::path::check_key;
use crate::store::{Acl, Hash, ObjectStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemFs {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| VfsError::Fatal("memfs lock poisoned".to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemFs {
    fn scheme(&self) -> &'static str {
        "memfs"
    }

    fn root(&self) -> &str {
        ""
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(format!("memfs://{}", key)))
    }

    async fn write(&self, key: &str, data: &[u8], _acl: Acl) -> Result<()> {
        check_key(key)?;
        self.lock()?.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn create_new(&self, key: &str, data: &[u8], _acl: Acl) -> Result<()> {
        check_key(key)?;
        let mut objects = self.lock()?;
        if objects.contains_key(key) {
            return Err(VfsError::AlreadyExists(format!("memfs://{}", key)));
        }
        objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock()?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| VfsError::NotFound(format!("memfs://{}", key)))
    }

    async fn hash(&self, key: &str) -> Result<Hash> {
        let data = self.read(key).await?;
        Ok(Hash::sha256_of(&data))
    }
}
