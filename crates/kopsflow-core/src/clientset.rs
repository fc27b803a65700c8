//! Registry access: `Factory` → `VfsClientset` → per-cluster stores

use crate::codec::{self, ApiObject};
use crate::error::{CoreError, Result};
use crate::model::{Cluster, ClusterStatus, InstanceGroup};
use kopsflow_config::FeatureFlags;
use kopsflow_pki::{SshCredentialStore, VfsKeystore, VfsSecretStore};
use kopsflow_vfs::{Acl, VfsContext, VfsErrorKind, VfsPath};

const CLUSTER_CONFIG: &str = "config";
const CLUSTER_STATUS: &str = "status";
const INSTANCE_GROUP_DIR: &str = "instancegroup";
const ADDONS_DIR: &str = "addons";

/// Process-wide settings, built once at startup and passed to every command
#[derive(Debug, Clone)]
pub struct Factory {
    state_store: String,
    feature_flags: FeatureFlags,
    vfs: VfsContext,
}

impl Factory {
    pub fn new(state_store: impl Into<String>, feature_flags: FeatureFlags) -> Self {
        Self {
            state_store: state_store.into(),
            feature_flags,
            vfs: VfsContext::new(),
        }
    }

    pub fn state_store(&self) -> &str {
        &self.state_store
    }

    pub fn feature_flags(&self) -> &FeatureFlags {
        &self.feature_flags
    }

    pub fn vfs(&self) -> &VfsContext {
        &self.vfs
    }

    pub async fn clientset(&self) -> Result<VfsClientset> {
        let base = self.vfs.build_path(&self.state_store).await?;
        Ok(VfsClientset::new(base))
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(CoreError::InvalidSpec(format!("invalid {} name {:?}", kind, name)));
    }
    Ok(())
}

async fn read_object<T: ApiObject>(path: &VfsPath) -> Result<Option<T>> {
    match path.read_optional().await? {
        Some(data) => Ok(Some(codec::decode(&data)?)),
        None => Ok(None),
    }
}

/// Clientset over a vfs registry root
#[derive(Debug, Clone)]
pub struct VfsClientset {
    base: VfsPath,
}

impl VfsClientset {
    pub fn new(base: VfsPath) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &VfsPath {
        &self.base
    }

    pub fn cluster_path(&self, name: &str) -> VfsPath {
        self.base.join(name)
    }

    pub async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        check_name("cluster", name)?;
        read_object(&self.cluster_path(name).join(CLUSTER_CONFIG)).await
    }

    /// Like [`get_cluster`](Self::get_cluster) but absent is an error
    pub async fn require_cluster(&self, name: &str) -> Result<Cluster> {
        self.get_cluster(name)
            .await?
            .ok_or_else(|| CoreError::ClusterNotFound(name.to_string()))
    }

    pub async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        let name = cluster.name();
        check_name("cluster", name)?;
        let mut cluster = cluster.clone();
        if cluster.metadata.creation_timestamp.is_none() {
            cluster.metadata.creation_timestamp = Some(chrono::Utc::now());
        }
        if cluster.spec.config_base.is_none() {
            cluster.spec.config_base = Some(self.cluster_path(name).to_string());
        }
        let data = codec::encode(&cluster)?;
        match self
            .cluster_path(name)
            .join(CLUSTER_CONFIG)
            .write_file_if_not_exists(&data, Acl::Private)
            .await
        {
            Ok(()) => {
                tracing::info!(cluster = %name, "Created cluster");
                Ok(cluster)
            }
            Err(e) if e.kind() == VfsErrorKind::AlreadyExists => {
                Err(CoreError::ClusterExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the cluster spec, and the status object when one is given
    pub async fn update_cluster(
        &self,
        cluster: &Cluster,
        status: Option<&ClusterStatus>,
    ) -> Result<Cluster> {
        let name = cluster.name();
        if self.get_cluster(name).await?.is_none() {
            return Err(CoreError::ClusterNotFound(name.to_string()));
        }
        let root = self.cluster_path(name);
        root.join(CLUSTER_CONFIG)
            .write(&codec::encode(cluster)?, Acl::Private)
            .await?;
        if let Some(status) = status {
            root.join(CLUSTER_STATUS)
                .write(&codec::encode_status(status)?, Acl::Private)
                .await?;
        }
        tracing::debug!(cluster = %name, "Updated cluster");
        Ok(cluster.clone())
    }

    pub async fn get_cluster_status(&self, name: &str) -> Result<Option<ClusterStatus>> {
        check_name("cluster", name)?;
        match self.cluster_path(name).join(CLUSTER_STATUS).read_optional().await? {
            Some(data) => Ok(Some(codec::decode_status(&data)?)),
            None => Ok(None),
        }
    }

    /// Remove the cluster and everything it owns; absent is a no-op
    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        check_name("cluster", name)?;
        self.cluster_path(name).remove_all().await?;
        tracing::info!(cluster = %name, "Deleted cluster registry");
        Ok(())
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let mut clusters = Vec::new();
        for dir in self.base.list().await? {
            if let Some(cluster) = read_object::<Cluster>(&dir.join(CLUSTER_CONFIG)).await? {
                clusters.push(cluster);
            }
        }
        Ok(clusters)
    }

    pub fn instance_groups_for(&self, cluster: &Cluster) -> InstanceGroupClient {
        InstanceGroupClient {
            cluster: cluster.name().to_string(),
            base: self.cluster_path(cluster.name()).join(INSTANCE_GROUP_DIR),
        }
    }

    pub fn key_store(&self, cluster: &Cluster) -> VfsKeystore {
        VfsKeystore::new(self.cluster_path(cluster.name()))
    }

    pub fn secret_store(&self, cluster: &Cluster) -> VfsSecretStore {
        VfsSecretStore::new(&self.cluster_path(cluster.name()))
    }

    pub fn ssh_credential_store(&self, cluster: &Cluster) -> SshCredentialStore {
        SshCredentialStore::new(&self.cluster_path(cluster.name()))
    }

    pub fn addons_for(&self, cluster: &Cluster) -> AddonsClient {
        AddonsClient {
            base: self.cluster_path(cluster.name()).join(ADDONS_DIR),
        }
    }
}

/// Instance groups of one cluster
#[derive(Debug, Clone)]
pub struct InstanceGroupClient {
    cluster: String,
    base: VfsPath,
}

impl InstanceGroupClient {
    pub async fn list(&self) -> Result<Vec<InstanceGroup>> {
        let mut groups = Vec::new();
        for path in self.base.list().await? {
            if let Some(ig) = read_object::<InstanceGroup>(&path).await? {
                groups.push(ig);
            }
        }
        Ok(groups)
    }

    pub async fn get(&self, name: &str) -> Result<Option<InstanceGroup>> {
        check_name("instance group", name)?;
        read_object(&self.base.join(name)).await
    }

    pub async fn require(&self, name: &str) -> Result<InstanceGroup> {
        self.get(name)
            .await?
            .ok_or_else(|| CoreError::InstanceGroupNotFound {
                cluster: self.cluster.clone(),
                name: name.to_string(),
            })
    }

    pub async fn create(&self, ig: &InstanceGroup) -> Result<InstanceGroup> {
        check_name("instance group", ig.name())?;
        let mut ig = ig.clone();
        if ig.metadata.creation_timestamp.is_none() {
            ig.metadata.creation_timestamp = Some(chrono::Utc::now());
        }
        match self
            .base
            .join(ig.name())
            .write_file_if_not_exists(&codec::encode(&ig)?, Acl::Private)
            .await
        {
            Ok(()) => Ok(ig),
            Err(e) if e.kind() == VfsErrorKind::AlreadyExists => {
                Err(CoreError::InstanceGroupExists {
                    cluster: self.cluster.clone(),
                    name: ig.name().to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, ig: &InstanceGroup) -> Result<InstanceGroup> {
        self.require(ig.name()).await?;
        self.base
            .join(ig.name())
            .write(&codec::encode(ig)?, Acl::Private)
            .await?;
        Ok(ig.clone())
    }

    /// Absent is a no-op
    pub async fn delete(&self, name: &str) -> Result<()> {
        check_name("instance group", name)?;
        match self.base.join(name).remove().await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Addon channel manifests of one cluster
#[derive(Debug, Clone)]
pub struct AddonsClient {
    base: VfsPath,
}

impl AddonsClient {
    pub fn path(&self, name: &str) -> VfsPath {
        self.base.join(name)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .base
            .read_tree()
            .await?
            .iter()
            .filter_map(|p| {
                p.key()
                    .strip_prefix(self.base.key())
                    .map(|k| k.trim_start_matches('/').to_string())
            })
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        match self.base.join(name).read_optional().await? {
            Some(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            None => Ok(None),
        }
    }

    pub async fn replace(&self, name: &str, manifest: &str) -> Result<()> {
        self.base
            .join(name)
            .write(manifest.as_bytes(), Acl::Private)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterSubnetSpec, InstanceGroupRole, ProviderId};
    use kopsflow_pki::Keystore;

    async fn clientset() -> VfsClientset {
        Factory::new("memfs://clusters", FeatureFlags::default())
            .clientset()
            .await
            .unwrap()
    }

    fn cluster(name: &str) -> Cluster {
        let mut c = Cluster::new(name);
        c.spec.cloud_provider = Some(ProviderId::Aws);
        c.spec.subnets.push(ClusterSubnetSpec {
            name: "us-test-1a".to_string(),
            zone: "us-test-1a".to_string(),
            ..Default::default()
        });
        c
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let cs = clientset().await;
        let created = cs.create_cluster(&cluster("a.example.com")).await.unwrap();
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(
            created.spec.config_base.as_deref(),
            Some("memfs://clusters/a.example.com")
        );
        let read = cs.get_cluster("a.example.com").await.unwrap().unwrap();
        assert_eq!(read, created);
    }

    #[tokio::test]
    async fn test_file_registry_survives_new_factory() {
        let dir = tempfile::tempdir().unwrap();
        let store = format!("file://{}", dir.path().display());

        let cs = Factory::new(store.clone(), FeatureFlags::default())
            .clientset()
            .await
            .unwrap();
        let c = cs.create_cluster(&cluster("f.example.com")).await.unwrap();
        cs.instance_groups_for(&c)
            .create(&InstanceGroup::new("nodes", InstanceGroupRole::Node))
            .await
            .unwrap();
        assert!(dir.path().join("f.example.com").join(CLUSTER_CONFIG).is_file());

        let reopened = Factory::new(store, FeatureFlags::default())
            .clientset()
            .await
            .unwrap();
        let read = reopened.require_cluster("f.example.com").await.unwrap();
        assert_eq!(read, c);
        assert!(reopened.instance_groups_for(&read).get("nodes").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let cs = clientset().await;
        cs.create_cluster(&cluster("a.example.com")).await.unwrap();
        let err = cs.create_cluster(&cluster("a.example.com")).await.unwrap_err();
        assert!(matches!(err, CoreError::ClusterExists(_)));
    }

    #[tokio::test]
    async fn test_update_requires_existing_and_writes_status() {
        let cs = clientset().await;
        let c = cluster("u.example.com");
        assert!(cs.update_cluster(&c, None).await.unwrap_err().is_not_found());

        let mut c = cs.create_cluster(&c).await.unwrap();
        c.spec.kubernetes_version = Some("1.31.4".to_string());
        let status = ClusterStatus {
            last_applied_kubernetes_version: Some("1.31.4".to_string()),
            ..Default::default()
        };
        cs.update_cluster(&c, Some(&status)).await.unwrap();
        assert_eq!(cs.require_cluster("u.example.com").await.unwrap(), c);
        assert_eq!(
            cs.get_cluster_status("u.example.com").await.unwrap(),
            Some(status)
        );
    }

    #[tokio::test]
    async fn test_instance_groups_crud() {
        let cs = clientset().await;
        let c = cs.create_cluster(&cluster("i.example.com")).await.unwrap();
        let igs = cs.instance_groups_for(&c);

        let mut nodes = InstanceGroup::new("nodes", InstanceGroupRole::Node);
        igs.create(&nodes).await.unwrap();
        igs.create(&InstanceGroup::new("master-us-test-1a", InstanceGroupRole::ControlPlane))
            .await
            .unwrap();
        assert!(matches!(
            igs.create(&nodes).await.unwrap_err(),
            CoreError::InstanceGroupExists { .. }
        ));

        nodes.spec.max_size = Some(5);
        igs.update(&nodes).await.unwrap();
        assert_eq!(igs.require("nodes").await.unwrap().spec.max_size, Some(5));

        let names: Vec<_> = igs
            .list()
            .await
            .unwrap()
            .iter()
            .map(|g| g.name().to_string())
            .collect();
        assert_eq!(names, vec!["master-us-test-1a", "nodes"]);

        igs.delete("nodes").await.unwrap();
        igs.delete("nodes").await.unwrap();
        assert!(igs.get("nodes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cluster_cascades() {
        let cs = clientset().await;
        let c = cs.create_cluster(&cluster("d.example.com")).await.unwrap();
        cs.create_cluster(&cluster("keep.example.com")).await.unwrap();
        cs.instance_groups_for(&c)
            .create(&InstanceGroup::new("nodes", InstanceGroupRole::Node))
            .await
            .unwrap();
        cs.key_store(&c).ensure_ca_keyset("kubernetes-ca").await.unwrap();

        cs.delete_cluster("d.example.com").await.unwrap();
        assert!(cs.get_cluster("d.example.com").await.unwrap().is_none());
        assert!(cs.key_store(&c).find_keyset("kubernetes-ca").await.unwrap().is_none());
        let remaining: Vec<_> = cs
            .list_clusters()
            .await
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(remaining, vec!["keep.example.com"]);
        cs.delete_cluster("d.example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_addons() {
        let cs = clientset().await;
        let c = cs.create_cluster(&cluster("x.example.com")).await.unwrap();
        let addons = cs.addons_for(&c);
        addons
            .replace("bootstrap-channel.yaml", "kind: Addons\n")
            .await
            .unwrap();
        assert_eq!(addons.list().await.unwrap(), vec!["bootstrap-channel.yaml"]);
        assert_eq!(
            addons.get("bootstrap-channel.yaml").await.unwrap().as_deref(),
            Some("kind: Addons\n")
        );
    }

    #[tokio::test]
    async fn test_rejects_path_names() {
        let cs = clientset().await;
        assert!(cs.get_cluster("../etc").await.is_err());
    }
}
