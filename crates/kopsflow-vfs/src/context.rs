//! Resolve location strings into [`VfsPath`] values

use crate::azure::AzureBlobStore;
use crate::error::{Result, VfsError};
use crate::fs::LocalFs;
use crate::gcs::GcsStore;
use crate::memfs::MemFs;
use crate::path::VfsPath;
use std::sync::Arc;

/// Builds paths from URLs such as `s3://bucket/prefix`, `gs://bucket`,
/// `azureblob://container`, `file:///srv/state`, `memfs://` or a bare
/// local path.
///
/// One context shares a single in-memory store, so every `memfs://` URL
/// resolved through the same context sees the same objects.
#[derive(Debug, Clone)]
pub struct VfsContext {
    memfs: Arc<MemFs>,
}

impl Default for VfsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsContext {
    pub fn new() -> Self {
        Self {
            memfs: Arc::new(MemFs::new()),
        }
    }

    pub async fn build_path(&self, location: &str) -> Result<VfsPath> {
        let location = location.trim();
        if location.is_empty() {
            return Err(VfsError::InvalidPath("empty location".to_string()));
        }

        if let Some(rest) = location.strip_prefix("memfs://") {
            return Ok(VfsPath::new(self.memfs.clone(), rest));
        }

        if let Some(rest) = location.strip_prefix("file://") {
            return Ok(local_path(rest));
        }

        if let Some(rest) = location.strip_prefix("s3://") {
            let (bucket, key) = split_bucket(rest)?;
            return s3_path(bucket, key).await;
        }

        if let Some(rest) = location.strip_prefix("gs://") {
            let (bucket, key) = split_bucket(rest)?;
            return Ok(VfsPath::new(Arc::new(GcsStore::new(bucket)), key));
        }

        if let Some(rest) = location.strip_prefix("azureblob://") {
            let (container, key) = split_bucket(rest)?;
            return Ok(VfsPath::new(
                Arc::new(AzureBlobStore::from_env(container)?),
                key,
            ));
        }

        if location.contains("://") {
            return Err(VfsError::NotSupported(format!(
                "unknown scheme in {}",
                location
            )));
        }

        Ok(local_path(location))
    }
}

fn local_path(path: &str) -> VfsPath {
    VfsPath::new(Arc::new(LocalFs::new(path)), "")
}

fn split_bucket(rest: &str) -> Result<(&str, &str)> {
    let (bucket, key) = match rest.split_once('/') {
        Some((b, k)) => (b, k),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(VfsError::InvalidPath(format!("missing bucket in {}", rest)));
    }
    Ok((bucket, key))
}

#[cfg(feature = "aws")]
async fn s3_path(bucket: &str, key: &str) -> Result<VfsPath> {
    let store = crate::s3::S3Store::from_env(bucket).await;
    Ok(VfsPath::new(Arc::new(store), key))
}

#[cfg(not(feature = "aws"))]
async fn s3_path(bucket: &str, _key: &str) -> Result<VfsPath> {
    Err(VfsError::NotSupported(format!(
        "s3://{} requires the `aws` feature",
        bucket
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Acl;

    #[tokio::test]
    async fn test_memfs_is_shared_per_context() {
        let ctx = VfsContext::new();
        let a = ctx.build_path("memfs://state/c1").await.unwrap();
        a.join("config").write(b"x", Acl::Private).await.unwrap();

        let b = ctx.build_path("memfs://state").await.unwrap();
        assert_eq!(b.join("c1/config").read().await.unwrap(), b"x");
        assert!(!b.is_remote());
    }

    #[tokio::test]
    async fn test_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = VfsContext::new();
        let url = format!("file://{}", dir.path().display());
        let p = ctx.build_path(&url).await.unwrap();
        p.join("x").write(b"1", Acl::Private).await.unwrap();
        assert!(dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_gcs_path_display() {
        let ctx = VfsContext::new();
        let p = ctx.build_path("gs://my-bucket/prefix").await.unwrap();
        assert!(p.is_remote());
        assert_eq!(p.to_string(), "gs://my-bucket/prefix");
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let ctx = VfsContext::new();
        let err = ctx.build_path("ftp://x").await.unwrap_err();
        assert!(matches!(err, VfsError::NotSupported(_)));
    }
}
