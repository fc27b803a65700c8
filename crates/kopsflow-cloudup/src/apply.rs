//! `update cluster`: complete, validate, build tasks and run them

use crate::assets::{AssetList, HashResolver, build_assets};
use crate::bootstrap::{BootstrapScript, BootstrapScriptBuilder};
use crate::error::{CloudupError, Result};
use crate::model::{ModelContext, build_tasks, default_builders};
use crate::phase::Phase;
use kopsflow_cloud::{Cloud, build_cloud, cluster_region};
use kopsflow_core::{
    Cluster, ClusterStatus, EtcdClusterStatus, InstanceGroup, ProviderId, VfsClientset, completion,
    validation,
};
use kopsflow_fi::{
    ApplyReport, CloudFormationTarget, Context, Executor, LifecycleOverrides, Target, TargetKind,
    TerraformTarget,
};
use kopsflow_pki::{EphemeralKeystore, Keystore, SecretStore, names};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// CA keysets every cluster gets before its first apply
pub const CA_KEYSETS: [&str; 9] = [
    names::KUBERNETES_CA,
    names::APISERVER_AGGREGATOR_CA,
    names::SERVICE_ACCOUNT,
    names::ETCD_CLIENTS_CA,
    names::ETCD_MANAGER_CA_MAIN,
    names::ETCD_MANAGER_CA_EVENTS,
    names::ETCD_PEERS_CA_MAIN,
    names::ETCD_PEERS_CA_EVENTS,
    "kops-controller-ca",
];

const DEFAULT_TERRAFORM_OUT: &str = "out/terraform";
const DEFAULT_CLOUDFORMATION_OUT: &str = "out/cloudformation";

/// One apply of a stored cluster
pub struct ApplyClusterCmd {
    /// As stored in the registry; completion happens here
    pub cluster: Cluster,
    pub instance_groups: Vec<InstanceGroup>,
    pub target: TargetKind,
    pub out_dir: Option<PathBuf>,
    pub phase: Option<Phase>,
    pub lifecycle_overrides: LifecycleOverrides,
    pub max_concurrency: usize,
    /// Built from the cluster when the target needs one and none is given
    pub cloud: Option<Arc<dyn Cloud>>,
    pub hash_resolver: Arc<dyn HashResolver>,
    pub cancel: CancellationToken,
}

/// What an apply did and produced
#[derive(Debug)]
pub struct ApplyResults {
    pub report: ApplyReport,
    /// Files written by emitting targets
    pub files: Vec<PathBuf>,
    pub assets: AssetList,
    /// Keyed by instance group name
    pub bootstrap: BTreeMap<String, BootstrapScript>,
    pub cluster: Cluster,
    pub instance_groups: Vec<InstanceGroup>,
}

impl ApplyClusterCmd {
    pub fn new(
        cluster: Cluster,
        instance_groups: Vec<InstanceGroup>,
        target: TargetKind,
        hash_resolver: Arc<dyn HashResolver>,
    ) -> Self {
        Self {
            cluster,
            instance_groups,
            target,
            out_dir: None,
            phase: None,
            lifecycle_overrides: LifecycleOverrides::default(),
            max_concurrency: 1,
            cloud: None,
            hash_resolver,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    pub fn with_phase(mut self, phase: Option<Phase>) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_lifecycle_overrides(mut self, overrides: LifecycleOverrides) -> Self {
        self.lifecycle_overrides = overrides;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn Cloud>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn reads_cloud(&self) -> bool {
        matches!(self.target, TargetKind::Direct | TargetKind::DryRun)
    }

    async fn complete(&self, clientset: &VfsClientset) -> Result<(Cluster, Vec<InstanceGroup>, Option<String>)> {
        let ssh_keys = clientset
            .ssh_credential_store(&self.cluster)
            .find_ssh_public_keys()
            .await?;
        let ssh_key = ssh_keys.first();
        let fingerprint = ssh_key.map(|k| k.fingerprint()).transpose()?.map(|f| f.replace(':', ""));

        let cluster =
            completion::complete_cluster(&self.cluster, &self.instance_groups, fingerprint.as_deref())?;
        let instance_groups = self
            .instance_groups
            .iter()
            .map(|ig| completion::complete_instance_group(&cluster, ig))
            .collect::<kopsflow_core::Result<Vec<_>>>()?;
        Ok((cluster, instance_groups, ssh_key.map(|k| k.text().to_string())))
    }

    async fn keystore(&self, clientset: &VfsClientset, cluster: &Cluster) -> Result<Arc<dyn Keystore>> {
        let registry = clientset.key_store(cluster);
        let keystore: Arc<dyn Keystore> = if self.target == TargetKind::DryRun {
            // Dry runs must not write CAs to the registry.
            let ephemeral = EphemeralKeystore::new();
            for keyset in registry.list_keysets().await? {
                ephemeral.store_keyset(&keyset).await?;
            }
            Arc::new(ephemeral)
        } else {
            Arc::new(registry)
        };
        for name in CA_KEYSETS {
            keystore.ensure_ca_keyset(name).await?;
        }
        Ok(keystore)
    }

    fn target(&self, cluster: &Cluster, region: &str) -> Target {
        match self.target {
            TargetKind::Direct => Target::Direct,
            TargetKind::DryRun => Target::DryRun,
            TargetKind::Terraform => Target::Terraform(TerraformTarget::new(
                cluster.name(),
                region,
                self.out_dir.clone().unwrap_or_else(|| DEFAULT_TERRAFORM_OUT.into()),
            )),
            TargetKind::CloudFormation => Target::CloudFormation(CloudFormationTarget::new(
                self.out_dir.clone().unwrap_or_else(|| DEFAULT_CLOUDFORMATION_OUT.into()),
            )),
        }
    }

    pub async fn run(&self, clientset: &VfsClientset) -> Result<ApplyResults> {
        // Rendered files must be self-contained; earlier phases would be dangling references
        if let (Some(phase), TargetKind::Terraform | TargetKind::CloudFormation) = (self.phase, &self.target) {
            return Err(CloudupError::InvalidOptions(format!(
                "--phase {phase} is only supported with the direct and dryrun targets, not {}",
                self.target
            )));
        }
        let (cluster, instance_groups, ssh_public_key) = self.complete(clientset).await?;
        validation::deep_validate(&cluster, &instance_groups, true)
            .map_err(kopsflow_core::CoreError::from)?;

        let provider = cluster
            .spec
            .cloud_provider
            .ok_or_else(|| CloudupError::IncompleteCluster("cloudProvider is not set".into()))?;
        if matches!(self.target, TargetKind::Terraform | TargetKind::CloudFormation)
            && provider != ProviderId::Aws
        {
            return Err(CloudupError::UnsupportedTarget {
                target: self.target.to_string(),
                provider: provider.to_string(),
            });
        }
        let region = cluster_region(&cluster)?;

        let cloud = match (&self.cloud, self.reads_cloud()) {
            (Some(cloud), _) => Some(cloud.clone()),
            (None, true) => Some(build_cloud(&cluster).await?),
            (None, false) => None,
        };
        if let (Some(cloud), Some(vpc_id)) = (&cloud, &cluster.spec.network_id)
            && self.reads_cloud()
        {
            let info = cloud.find_vpc_info(vpc_id).await?;
            let Some(info) = info else {
                return Err(CloudupError::SharedVpcNotFound(vpc_id.clone()));
            };
            tracing::info!("Using shared VPC {} ({})", info.id, info.cidr);
        }

        let keystore = self.keystore(clientset, &cluster).await?;
        let ca_bundle = keystore.get_keyset(names::KUBERNETES_CA).await?.trust_bundle_pem();

        let assets = build_assets(&cluster, self.hash_resolver.as_ref()).await?;
        let script_builder = BootstrapScriptBuilder::new(&cluster, &assets, &ca_bundle);
        let mut bootstrap = BTreeMap::new();
        for ig in &instance_groups {
            bootstrap.insert(ig.name().to_string(), script_builder.build(ig)?);
        }

        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &instance_groups,
            assets: &assets,
            bootstrap: &bootstrap,
            ssh_public_key: ssh_public_key.as_deref(),
            provider,
            region: region.clone(),
        };
        let tasks = build_tasks(&model, &default_builders(), self.phase)?;

        let secret_store: Arc<dyn SecretStore> = Arc::new(clientset.secret_store(&cluster));
        let mut ctx = Context::new(cluster.name(), self.target(&cluster, &region), keystore)
            .with_secret_store(secret_store)
            .with_config_base(clientset.cluster_path(cluster.name()))
            .with_cancel(self.cancel.clone());
        if let Some(cloud) = cloud {
            ctx = ctx.with_cloud(cloud);
        }
        let ctx = Arc::new(ctx);

        let report = Executor::new()
            .with_max_concurrency(self.max_concurrency)
            .with_overrides(self.lifecycle_overrides.clone())
            .run(&tasks, ctx.clone())
            .await?;

        let files = if report.is_success() {
            ctx.target.finish().await?
        } else {
            Vec::new()
        };

        if report.is_success() && self.target == TargetKind::Direct && self.phase.is_none() {
            let status = ClusterStatus {
                etcd_clusters: cluster
                    .spec
                    .etcd_clusters
                    .iter()
                    .map(|e| EtcdClusterStatus {
                        name: e.name.clone(),
                        version: None,
                    })
                    .collect(),
                last_applied_kubernetes_version: cluster.spec.kubernetes_version.clone(),
            };
            clientset.update_cluster(&self.cluster, Some(&status)).await?;
        }

        Ok(ApplyResults {
            report,
            files,
            assets,
            bootstrap,
            cluster,
            instance_groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::StaticHashResolver;
    use kopsflow_cloud::{MockCloud, SubnetInfo, delete_resources};
    use kopsflow_core::{ClusterSubnetSpec, InstanceGroupRole};
    use kopsflow_vfs::{MemFs, VfsPath};

    async fn registry(cluster: &Cluster, igs: &[InstanceGroup]) -> VfsClientset {
        let clientset = VfsClientset::new(VfsPath::new(Arc::new(MemFs::new()), "state"));
        let cluster = clientset.create_cluster(cluster).await.unwrap();
        for ig in igs {
            clientset.instance_groups_for(&cluster).create(ig).await.unwrap();
        }
        clientset
    }

    fn minimal(name: &str) -> (Cluster, Vec<InstanceGroup>) {
        let mut cluster = Cluster::new(name);
        cluster.spec.cloud_provider = Some(ProviderId::Aws);
        cluster.spec.kubernetes_version = Some("1.31.4".into());
        cluster.spec.subnets.push(ClusterSubnetSpec {
            name: "us-test-1a".into(),
            zone: "us-test-1a".into(),
            ..Default::default()
        });
        let mut master = InstanceGroup::new("master-us-test-1a", InstanceGroupRole::ControlPlane);
        master.spec.subnets = vec!["us-test-1a".into()];
        let mut nodes = InstanceGroup::new("nodes", InstanceGroupRole::Node);
        nodes.spec.subnets = vec!["us-test-1a".into()];
        (cluster, vec![master, nodes])
    }

    async fn apply(clientset: &VfsClientset, name: &str, target: TargetKind) -> ApplyClusterCmd {
        let cluster = clientset.require_cluster(name).await.unwrap();
        let igs = clientset.instance_groups_for(&cluster).list().await.unwrap();
        let resolver = Arc::new(StaticHashResolver::placeholder_for(&cluster));
        ApplyClusterCmd::new(cluster, igs, target, resolver)
    }

    #[tokio::test]
    async fn test_terraform_emits_main_file_and_user_data() {
        let (cluster, igs) = minimal("minimal.example.com");
        let clientset = registry(&cluster, &igs).await;
        let dir = tempfile::tempdir().unwrap();

        let cmd = apply(&clientset, "minimal.example.com", TargetKind::Terraform)
            .await
            .with_out_dir(dir.path());
        let results = cmd.run(&clientset).await.unwrap();
        assert!(results.report.is_success(), "{:?}", results.report.failed);

        let mut files: Vec<String> = results
            .files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                "data/aws_launch_template_master-us-test-1a.masters.minimal.example.com_user_data",
                "data/aws_launch_template_nodes.minimal.example.com_user_data",
                "kubernetes.tf",
            ]
        );
        for file in &results.files {
            assert!(!std::fs::read(file).unwrap().is_empty());
        }

        let first = std::fs::read_to_string(dir.path().join("kubernetes.tf")).unwrap();
        cmd.run(&clientset).await.unwrap();
        let second = std::fs::read_to_string(dir.path().join("kubernetes.tf")).unwrap();
        assert_eq!(first, second);

        let keyset = clientset
            .key_store(&cluster)
            .find_keyset(names::KUBERNETES_CA)
            .await
            .unwrap();
        assert!(keyset.is_some());
    }

    #[tokio::test]
    async fn test_rendered_targets_reject_phase() {
        let (cluster, igs) = minimal("minimal.example.com");
        let clientset = registry(&cluster, &igs).await;
        let dir = tempfile::tempdir().unwrap();

        for target in [TargetKind::Terraform, TargetKind::CloudFormation] {
            let err = apply(&clientset, "minimal.example.com", target)
                .await
                .with_out_dir(dir.path())
                .with_phase(Some(Phase::Security))
                .run(&clientset)
                .await
                .unwrap_err();
            assert!(matches!(err, CloudupError::InvalidOptions(_)), "{err}");
        }
        assert!(!dir.path().join("kubernetes.tf").exists());
    }

    #[tokio::test]
    async fn test_terraform_rejects_other_providers() {
        let (mut cluster, igs) = minimal("gce.example.com");
        cluster.spec.cloud_provider = Some(ProviderId::Gce);
        let clientset = registry(&cluster, &igs).await;
        let err = apply(&clientset, "gce.example.com", TargetKind::Terraform)
            .await
            .run(&clientset)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudupError::UnsupportedTarget { .. }));
    }

    #[tokio::test]
    async fn test_direct_apply_converges() {
        let (cluster, igs) = minimal("minimal.example.com");
        let clientset = registry(&cluster, &igs).await;
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));

        let cmd = apply(&clientset, "minimal.example.com", TargetKind::Direct)
            .await
            .with_cloud(cloud.clone());
        let first = cmd.run(&clientset).await.unwrap();
        assert!(first.report.is_success(), "{:?}", first.report.failed);
        assert!(first.report.has_changes());
        assert!(cloud.resource_named("vpc", "minimal.example.com").await.is_some());

        let second = cmd.run(&clientset).await.unwrap();
        assert!(!second.report.has_changes(), "{:?}", second.report.actions);

        let status = clientset.get_cluster_status("minimal.example.com").await.unwrap().unwrap();
        assert_eq!(status.last_applied_kubernetes_version.as_deref(), Some("1.31.4"));
        // The stored spec stays uncompleted.
        let stored = clientset.require_cluster("minimal.example.com").await.unwrap();
        assert!(stored.spec.etcd_clusters.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let (cluster, igs) = minimal("minimal.example.com");
        let clientset = registry(&cluster, &igs).await;
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));

        let results = apply(&clientset, "minimal.example.com", TargetKind::DryRun)
            .await
            .with_cloud(cloud.clone())
            .run(&clientset)
            .await
            .unwrap();
        assert!(results.report.has_changes());
        assert!(cloud.resource_named("vpc", "minimal.example.com").await.is_none());
        assert!(clientset.key_store(&cluster).list_keysets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_subnet_is_tagged_and_kept() {
        let (mut cluster, igs) = minimal("shared.example.com");
        cluster.spec.network_id = Some("vpc-12345678".into());
        cluster.spec.network_cidr = Some("10.0.0.0/16".into());
        cluster.spec.subnets[0].id = Some("subnet-12345678".into());
        cluster.spec.subnets[0].cidr = Some("10.0.1.0/24".into());
        let clientset = registry(&cluster, &igs).await;

        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        cloud
            .seed_vpc(
                "vpc-12345678",
                "10.0.0.0/16",
                &[SubnetInfo {
                    id: "subnet-12345678".into(),
                    zone: "us-test-1a".into(),
                    cidr: "10.0.1.0/24".into(),
                }],
            )
            .await
            .unwrap();

        let results = apply(&clientset, "shared.example.com", TargetKind::Direct)
            .await
            .with_cloud(cloud.clone())
            .run(&clientset)
            .await
            .unwrap();
        assert!(results.report.is_success(), "{:?}", results.report.failed);

        let trackers = cloud.list_resources("shared.example.com").await.unwrap();
        let subnet = trackers.iter().find(|t| t.id == "subnet-12345678").unwrap();
        assert!(subnet.shared);
        assert!(!trackers.iter().any(|t| t.id == "vpc-12345678"));

        let report = delete_resources(cloud.as_ref(), trackers, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.retained.len(), 1);
        assert!(cloud.resource_named("subnet", "subnet-12345678").await.is_some());
        assert!(cloud.resource_named("vpc", "vpc-12345678").await.is_some());
    }

    #[tokio::test]
    async fn test_missing_shared_vpc() {
        let (mut cluster, igs) = minimal("shared.example.com");
        cluster.spec.network_id = Some("vpc-00000000".into());
        cluster.spec.network_cidr = Some("10.0.0.0/16".into());
        let clientset = registry(&cluster, &igs).await;
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));

        let err = apply(&clientset, "shared.example.com", TargetKind::Direct)
            .await
            .with_cloud(cloud)
            .run(&clientset)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudupError::SharedVpcNotFound(_)));
    }

    #[tokio::test]
    async fn test_even_control_plane_count_is_rejected() {
        let (mut cluster, mut igs) = minimal("ha.example.com");
        cluster.spec.subnets.push(ClusterSubnetSpec {
            name: "us-test-1b".into(),
            zone: "us-test-1b".into(),
            ..Default::default()
        });
        let mut second = InstanceGroup::new("master-us-test-1b", InstanceGroupRole::ControlPlane);
        second.spec.subnets = vec!["us-test-1b".into()];
        igs.push(second);
        let clientset = registry(&cluster, &igs).await;

        let err = apply(&clientset, "ha.example.com", TargetKind::DryRun)
            .await
            .with_cloud(Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1")))
            .run(&clientset)
            .await
            .unwrap_err();
        assert!(err.is_validation(), "{err}");
    }
}
