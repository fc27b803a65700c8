//! Assets a cluster's machines download at boot, and their hashes

use crate::error::{CloudupError, Result};
use async_trait::async_trait;
use kopsflow_core::Cluster;
use kopsflow_vfs::VfsContext;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Overrides where Kubernetes release binaries are fetched from
pub const KUBERNETES_BASE_URL_ENV: &str = "KOPS_KUBERNETES_BASE_URL";

const DEFAULT_RELEASE_BASE: &str = "https://dl.k8s.io/release";
const IMAGE_REGISTRY: &str = "registry.k8s.io";
const HASH_SUFFIX: &str = ".sha256";
const BINARIES: [&str; 2] = ["kubelet", "kubectl"];
const CONTROL_PLANE_IMAGES: [&str; 4] = [
    "kube-apiserver",
    "kube-controller-manager",
    "kube-scheduler",
    "kube-proxy",
];

/// A downloadable file pinned to a SHA-256
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAsset {
    pub name: String,
    pub url: String,
    pub sha256: String,
}

impl FileAsset {
    /// `<sha256>@<url>`, the form machines are handed
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.sha256, self.url)
    }
}

/// Everything an apply tells machines to fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssetList {
    pub files: Vec<FileAsset>,
    pub images: Vec<String>,
}

/// Finds the SHA-256 of a published file
#[async_trait]
pub trait HashResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<String>;
}

/// Reads the `<url>.sha256` companion file, over HTTP(S) or any vfs scheme
pub struct RemoteHashResolver {
    client: reqwest::Client,
    vfs: VfsContext,
}

impl RemoteHashResolver {
    pub fn new(vfs: VfsContext) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, vfs })
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let body = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            return Ok(body);
        }
        let data = self.vfs.build_path(url).await?.read().await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
}

#[async_trait]
impl HashResolver for RemoteHashResolver {
    async fn resolve(&self, url: &str) -> Result<String> {
        let hash_url = format!("{url}{HASH_SUFFIX}");
        tracing::debug!("Fetching hash from {}", hash_url);
        let body = self.fetch(&hash_url).await.map_err(|e| CloudupError::AssetHash {
            url: url.to_string(),
            detail: e.to_string(),
        })?;
        parse_hash(url, &body)
    }
}

/// Hashes known ahead of time
#[derive(Debug, Clone, Default)]
pub struct StaticHashResolver {
    hashes: BTreeMap<String, String>,
}

impl StaticHashResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.hashes.insert(url.into(), sha256.into());
        self
    }

    /// Pin every default file of `cluster` to the hash of its URL.
    /// Useful for tests and air-gapped dry runs.
    pub fn placeholder_for(cluster: &Cluster) -> Self {
        let mut resolver = Self::new();
        if let Some(version) = cluster.spec.kubernetes_version.as_deref() {
            let base = release_base_url(version);
            for binary in BINARIES {
                let url = binary_url(&base, binary);
                let hash = sha256_hex(url.as_bytes());
                resolver.hashes.insert(url, hash);
            }
        }
        resolver
    }
}

#[async_trait]
impl HashResolver for StaticHashResolver {
    async fn resolve(&self, url: &str) -> Result<String> {
        self.hashes
            .get(url)
            .cloned()
            .ok_or_else(|| CloudupError::AssetHash {
                url: url.to_string(),
                detail: "no pinned hash".into(),
            })
    }
}

fn parse_hash(url: &str, body: &str) -> Result<String> {
    let token = body.split_whitespace().next().unwrap_or_default().to_ascii_lowercase();
    if token.len() != 64 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CloudupError::AssetHash {
            url: url.to_string(),
            detail: format!("malformed sha256 {token:?}"),
        });
    }
    Ok(token)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn is_base_url(version: &str) -> bool {
    ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| version.starts_with(scheme))
}

/// Release directory for a Kubernetes version. The version itself may be a
/// base URL; otherwise the env override or the public release bucket is used.
pub fn release_base_url(version: &str) -> String {
    let version = version.trim();
    if is_base_url(version) {
        return version.trim_end_matches('/').to_string();
    }
    let version = version.trim_start_matches('v');
    let base = std::env::var(KUBERNETES_BASE_URL_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_RELEASE_BASE.to_string());
    format!("{}/v{}", base.trim_end_matches('/'), version)
}

fn binary_url(base: &str, binary: &str) -> String {
    format!("{base}/bin/linux/amd64/{binary}")
}

/// Resolve the files and images an apply of `cluster` will use
pub async fn build_assets(cluster: &Cluster, resolver: &dyn HashResolver) -> Result<AssetList> {
    let version = cluster
        .spec
        .kubernetes_version
        .as_deref()
        .ok_or_else(|| CloudupError::IncompleteCluster("kubernetesVersion is not set".into()))?;
    let base = release_base_url(version);

    let mut files = Vec::new();
    for binary in BINARIES {
        let url = binary_url(&base, binary);
        let sha256 = resolver.resolve(&url).await?;
        tracing::debug!("Asset {} has hash {}", url, sha256);
        files.push(FileAsset {
            name: binary.to_string(),
            url,
            sha256,
        });
    }

    let tag = if is_base_url(version) {
        "latest".to_string()
    } else {
        format!("v{}", version.trim_start_matches('v'))
    };
    let images = CONTROL_PLANE_IMAGES
        .iter()
        .map(|image| format!("{IMAGE_REGISTRY}/{image}:{tag}"))
        .collect();

    Ok(AssetList { files, images })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kopsflow_vfs::Acl;
    use serial_test::serial;

    fn cluster(version: &str) -> Cluster {
        let mut cluster = Cluster::new("minimal.example.com");
        cluster.spec.kubernetes_version = Some(version.to_string());
        cluster
    }

    #[test]
    #[serial]
    fn test_release_base_url() {
        unsafe { std::env::remove_var(KUBERNETES_BASE_URL_ENV) };
        assert_eq!(release_base_url("v1.32.0"), "https://dl.k8s.io/release/v1.32.0");
        assert_eq!(
            release_base_url("https://example.com/k8s/1.32.0/"),
            "https://example.com/k8s/1.32.0"
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_hashes_from_companion_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = format!("file://{}", dir.path().display());
        let vfs = VfsContext::new();
        let root = vfs.build_path(&base).await.unwrap();
        let kubelet = "a".repeat(64);
        let kubectl = "b".repeat(64);
        root.join("bin/linux/amd64/kubelet.sha256")
            .write(format!("{kubelet}  kubelet\n").as_bytes(), Acl::Private)
            .await
            .unwrap();
        root.join("bin/linux/amd64/kubectl.sha256")
            .write(kubectl.as_bytes(), Acl::Private)
            .await
            .unwrap();

        let resolver = RemoteHashResolver::new(vfs).unwrap();
        let assets = build_assets(&cluster(&base), &resolver).await.unwrap();
        assert_eq!(assets.files.len(), 2);
        assert_eq!(assets.files[0].sha256, kubelet);
        assert_eq!(assets.files[1].pinned(), format!("{kubectl}@{base}/bin/linux/amd64/kubectl"));
        assert!(assets.images.iter().all(|i| i.ends_with(":latest")));
    }

    #[tokio::test]
    async fn test_malformed_hash_rejected() {
        assert!(parse_hash("u", "not-a-hash").is_err());
        assert!(parse_hash("u", &"F".repeat(64)).is_ok());
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_hash_is_an_error() {
        unsafe { std::env::remove_var(KUBERNETES_BASE_URL_ENV) };
        let err = build_assets(&cluster("1.32.0"), &StaticHashResolver::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudupError::AssetHash { .. }));

        let c = cluster("1.32.0");
        let assets = build_assets(&c, &StaticHashResolver::placeholder_for(&c)).await.unwrap();
        assert_eq!(assets.images[0], "registry.k8s.io/kube-apiserver:v1.32.0");
    }
}
