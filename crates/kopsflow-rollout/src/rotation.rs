//! Certificate authority rotation
//!
//! A rotation walks every selected keyset through four stages:
//!
//! ```text
//!   Fresh ──issue──► Staged ──promote──► Promoted ──distrust──► Distrusted ──delete──► Fresh
//!   {A}              {A*, B}             {A, B*}               {A(x), B*}              {B*}
//! ```
//!
//! Between stages the cluster is applied and rolled so that every machine
//! trusts a CA before anything presents a certificate signed by it. The
//! stage of each keyset is read back from the keystore on every run, so an
//! interrupted rotation resumes where it stopped.

use crate::error::{Result, RolloutError};
use crate::k8s::{KubeClient, Node};
use crate::rolling::{RollingUpdateCluster, RollingUpdateOptions};
use crate::validator::ClusterValidator;
use async_trait::async_trait;
use kopsflow_cloud::{Cloud, NodeInfo};
use kopsflow_cloudup::model::LEAF_KEYPAIRS;
use kopsflow_cloudup::{ApplyClusterCmd, CA_KEYSETS, HashResolver};
use kopsflow_core::{Cluster, InstanceGroupRole, VfsClientset};
use kopsflow_fi::TargetKind;
use kopsflow_pki::{CertType, IssueRequest, Keyset, Keystore, Subject, VfsKeystore, names};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CONTROL_PLANE_ROLES: [InstanceGroupRole; 2] = [InstanceGroupRole::ControlPlane, InstanceGroupRole::ApiServer];

/// Where a keyset stands in its rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeysetStage {
    /// One trusted item, no rotation under way
    Fresh,
    /// A newer item is trusted but not yet primary
    Staged,
    /// The newer item is primary; the old one is still trusted
    Promoted,
    /// The old item is distrusted and waiting to be deleted
    Distrusted,
}

pub fn keyset_stage(keyset: &Keyset) -> KeysetStage {
    if !keyset.staged_items().is_empty() {
        KeysetStage::Staged
    } else if !keyset.superseded_items().is_empty() {
        KeysetStage::Promoted
    } else if !keyset.distrusted_items().is_empty() {
        KeysetStage::Distrusted
    } else {
        KeysetStage::Fresh
    }
}

/// The cluster operations a rotation is interleaved with
#[async_trait]
pub trait RotationDriver: Send + Sync {
    async fn apply(&self) -> Result<()>;

    /// Replace the instances of the given roles
    async fn roll(&self, roles: &[InstanceGroupRole]) -> Result<()>;

    /// Push the CA bundle to service account token secrets
    async fn publish_trust_bundle(&self, bundle: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotationReport {
    pub steps: Vec<String>,
}

impl RotationReport {
    fn step(&mut self, step: String) {
        tracing::info!("{}", step);
        self.steps.push(step);
    }
}

pub struct CaRotation {
    clientset: VfsClientset,
    cluster: Cluster,
    keysets: Vec<String>,
    driver: Arc<dyn RotationDriver>,
}

impl CaRotation {
    pub fn new(clientset: VfsClientset, cluster: Cluster, driver: Arc<dyn RotationDriver>) -> Self {
        Self {
            clientset,
            cluster,
            keysets: CA_KEYSETS.iter().map(|s| s.to_string()).collect(),
            driver,
        }
    }

    pub fn with_keysets(mut self, keysets: Vec<String>) -> Self {
        self.keysets = keysets;
        self
    }

    async fn check_preconditions(&self) -> Result<()> {
        if !self.cluster.uses_kops_controller_bootstrap() {
            return Err(RolloutError::RotationPrecondition(
                "cluster does not use kops-controller node bootstrap".to_string(),
            ));
        }
        let keys = self
            .clientset
            .ssh_credential_store(&self.cluster)
            .find_ssh_public_keys()
            .await?;
        if keys.is_empty() {
            return Err(RolloutError::RotationPrecondition(
                "no SSH public key is registered for the cluster".to_string(),
            ));
        }
        Ok(())
    }

    async fn stages(&self, keystore: &VfsKeystore) -> Result<BTreeMap<String, (Keyset, KeysetStage)>> {
        let mut stages = BTreeMap::new();
        for name in &self.keysets {
            let keyset = keystore.find_keyset(name).await?.ok_or_else(|| {
                RolloutError::RotationPrecondition(format!(
                    "keyset {name} does not exist; run update cluster first"
                ))
            })?;
            let stage = keyset_stage(&keyset);
            stages.insert(name.clone(), (keyset, stage));
        }
        Ok(stages)
    }

    async fn trust_bundle(&self, keystore: &VfsKeystore) -> Result<String> {
        Ok(keystore.get_keyset(names::KUBERNETES_CA).await?.trust_bundle_pem())
    }

    /// Run (or resume) the rotation to completion
    pub async fn run(&self) -> Result<RotationReport> {
        self.check_preconditions().await?;
        let keystore = self.clientset.key_store(&self.cluster);
        let mut report = RotationReport::default();

        // Issue and distribute trust
        let stages = self.stages(&keystore).await?;
        if stages.values().all(|(_, stage)| *stage <= KeysetStage::Staged) {
            for (name, (_, stage)) in &stages {
                if *stage != KeysetStage::Fresh {
                    continue;
                }
                let item = keystore
                    .issue(&IssueRequest {
                        keyset: name.clone(),
                        signer: None,
                        cert_type: CertType::Ca,
                        subject: Subject::cn(name),
                        alternate_names: vec![],
                        validity_days: None,
                        primary: false,
                    })
                    .await?;
                report.step(format!("Issued new {name} item {}", item.id));
            }
            self.driver.apply().await?;
            self.driver.publish_trust_bundle(&self.trust_bundle(&keystore).await?).await?;
            report.step("Updated service account token secrets".to_string());
            self.driver.roll(&[InstanceGroupRole::Node]).await?;
            self.driver.roll(&CONTROL_PLANE_ROLES).await?;
            report.step("Distributed trust in the new items".to_string());
        }

        // Promote
        let stages = self.stages(&keystore).await?;
        let any_distrusted = stages.values().any(|(_, s)| *s == KeysetStage::Distrusted);
        let any_open = stages
            .values()
            .any(|(_, s)| matches!(s, KeysetStage::Staged | KeysetStage::Promoted));
        if any_open && !any_distrusted {
            for (name, (mut keyset, stage)) in stages {
                if stage != KeysetStage::Staged {
                    continue;
                }
                let Some(id) = keyset.staged_items().last().map(|i| i.id.clone()) else {
                    continue;
                };
                keyset.promote(&id)?;
                keystore.store_keyset(&keyset).await?;
                report.step(format!("Promoted {name} item {id}"));
            }
            for leaf in LEAF_KEYPAIRS {
                match keystore.delete_keyset(leaf).await {
                    Err(e) if !e.is_not_found() => return Err(e.into()),
                    _ => {}
                }
            }
            self.driver.apply().await?;
            self.driver.roll(&CONTROL_PLANE_ROLES).await?;
            self.driver.roll(&[InstanceGroupRole::Node]).await?;
            report.step("Reissued certificates from the new items".to_string());
        }

        // Distrust and delete the old items
        let stages = self.stages(&keystore).await?;
        if stages.values().all(|(_, s)| *s == KeysetStage::Fresh) {
            return Ok(report);
        }
        let now = chrono::Utc::now();
        for (name, (mut keyset, stage)) in stages {
            if stage != KeysetStage::Promoted {
                continue;
            }
            let old: Vec<String> = keyset.superseded_items().iter().map(|i| i.id.clone()).collect();
            for id in &old {
                keyset.distrust(id, now)?;
            }
            keystore.store_keyset(&keyset).await?;
            report.step(format!("Distrusted {name} items {}", old.join(", ")));
        }
        self.driver.apply().await?;
        self.driver.publish_trust_bundle(&self.trust_bundle(&keystore).await?).await?;
        self.driver.roll(&InstanceGroupRole::ALL).await?;

        for (name, (mut keyset, _)) in self.stages(&keystore).await? {
            let distrusted: Vec<String> = keyset.distrusted_items().iter().map(|i| i.id.clone()).collect();
            if distrusted.is_empty() {
                continue;
            }
            for id in &distrusted {
                keyset.remove(id)?;
            }
            keystore.store_keyset(&keyset).await?;
            report.step(format!("Deleted {name} items {}", distrusted.join(", ")));
        }
        Ok(report)
    }
}

/// Drives a rotation against a real (or simulated) cluster: direct applies,
/// rolling updates with validation and token secret updates
pub struct ClusterRotationDriver {
    clientset: VfsClientset,
    cluster_name: String,
    cloud: Arc<dyn Cloud>,
    kube: Option<Arc<dyn KubeClient>>,
    hash_resolver: Arc<dyn HashResolver>,
    options: RollingUpdateOptions,
    cancel: CancellationToken,
}

impl ClusterRotationDriver {
    pub fn new(
        clientset: VfsClientset,
        cluster_name: impl Into<String>,
        cloud: Arc<dyn Cloud>,
        hash_resolver: Arc<dyn HashResolver>,
        options: RollingUpdateOptions,
    ) -> Self {
        Self {
            clientset,
            cluster_name: cluster_name.into(),
            cloud,
            kube: None,
            hash_resolver,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_kube(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl RotationDriver for ClusterRotationDriver {
    async fn apply(&self) -> Result<()> {
        let cluster = self.clientset.require_cluster(&self.cluster_name).await?;
        let instance_groups = self.clientset.instance_groups_for(&cluster).list().await?;
        let results = ApplyClusterCmd::new(cluster, instance_groups, TargetKind::Direct, self.hash_resolver.clone())
            .with_cloud(self.cloud.clone())
            .with_cancel(self.cancel.clone())
            .run(&self.clientset)
            .await?;
        if !results.report.is_success() {
            let failed: Vec<String> = results
                .report
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.task, f.error))
                .collect();
            return Err(RolloutError::ApplyFailed(failed.join("; ")));
        }
        Ok(())
    }

    async fn roll(&self, roles: &[InstanceGroupRole]) -> Result<()> {
        let cluster = self.clientset.require_cluster(&self.cluster_name).await?;
        let instance_groups = self.clientset.instance_groups_for(&cluster).list().await?;
        let kube = self.kube.clone().filter(|_| !self.options.cloud_only);

        let nodes: Option<Vec<NodeInfo>> = match &kube {
            Some(kube) => Some(kube.list_nodes().await?.iter().map(Node::info).collect()),
            None => None,
        };
        let groups = self
            .cloud
            .get_cloud_groups(&cluster, &instance_groups, true, nodes.as_deref())
            .await?;

        let options = RollingUpdateOptions {
            roles: roles.to_vec(),
            ..self.options.clone()
        };
        let mut updater =
            RollingUpdateCluster::new(cluster.clone(), self.cloud.clone(), options).with_cancel(self.cancel.clone());
        if let Some(kube) = kube {
            let validator = ClusterValidator::new(cluster, instance_groups, self.cloud.clone(), kube.clone());
            updater = updater.with_kube(kube).with_validator(Arc::new(validator));
        }
        let report = updater.run(&groups).await?;
        tracing::debug!("Replaced {} instance(s)", report.instances.len());
        Ok(())
    }

    async fn publish_trust_bundle(&self, bundle: &str) -> Result<()> {
        let Some(kube) = &self.kube else {
            tracing::warn!("No Kubernetes client; service account token secrets were not updated");
            return Ok(());
        };
        for secret in kube.list_service_account_token_secrets().await? {
            kube.set_secret_data(&secret, "ca.crt", bundle.as_bytes()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeKube;
    use crate::testing::{CLUSTER, cluster, instance_group};
    use crate::validator::Validator;
    use kopsflow_cloud::MockCloud;
    use kopsflow_cloudup::StaticHashResolver;
    use kopsflow_core::{NodeBootstrap, ProviderId};
    use kopsflow_pki::SshPublicKey;
    use kopsflow_vfs::{MemFs, VfsPath};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SSH_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQCtWu40XQo8dczLsCq0OWV+hxm9uV3WxeH9Kgh4sMzQxNtoU1pvW0XdjpkBesRKGoolfWeCLXWxpyQb1IaiMkKoz7MdhQ/6UKjMjP66aFWWp3pwD0uj0HuJ7tq4gKHKRYGTaZIRWpzUiANBrjugVgA+Sd7E/mYwc/DMXkIyRZbvhQ== admin@example.com";

    struct Env {
        clientset: VfsClientset,
        cluster: Cluster,
        cloud: Arc<MockCloud>,
        kube: Arc<FakeKube>,
        driver: Arc<ClusterRotationDriver>,
    }

    impl Env {
        async fn ca(&self) -> Keyset {
            self.clientset
                .key_store(&self.cluster)
                .get_keyset(names::KUBERNETES_CA)
                .await
                .unwrap()
        }

        fn rotation(&self, driver: Arc<dyn RotationDriver>) -> CaRotation {
            CaRotation::new(self.clientset.clone(), self.cluster.clone(), driver)
                .with_keysets(vec![names::KUBERNETES_CA.to_string(), names::SERVICE_ACCOUNT.to_string()])
        }
    }

    async fn applied_cluster() -> Env {
        let clientset = VfsClientset::new(VfsPath::new(Arc::new(MemFs::new()), "state"));
        let cluster = clientset.create_cluster(&cluster()).await.unwrap();
        let igs = [
            instance_group("master-us-test-1a", InstanceGroupRole::ControlPlane, 1, 1),
            instance_group("nodes", InstanceGroupRole::Node, 2, 2),
        ];
        for ig in &igs {
            clientset.instance_groups_for(&cluster).create(ig).await.unwrap();
        }
        clientset
            .ssh_credential_store(&cluster)
            .add_ssh_public_key(&SshPublicKey::parse(SSH_KEY).unwrap())
            .await
            .unwrap();

        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        let resolver = Arc::new(StaticHashResolver::placeholder_for(&cluster));
        let stored = clientset.instance_groups_for(&cluster).list().await.unwrap();
        let kube = Arc::new(
            FakeKube::new()
                .joined_to(cloud.clone(), &cluster, &stored)
                .with_system_pods(&cluster),
        );
        kube.add_token_secret("default", "default-token-abcde");

        let options = RollingUpdateOptions {
            post_drain_delay: Duration::ZERO,
            ..Default::default()
        };
        let driver = Arc::new(
            ClusterRotationDriver::new(clientset.clone(), CLUSTER, cloud.clone(), resolver, options)
                .with_kube(kube.clone()),
        );
        driver.apply().await.unwrap();

        Env {
            clientset,
            cluster,
            cloud,
            kube,
            driver,
        }
    }

    /// `(item ids, primary id, distrusted ids)` of the kubernetes CA
    type Snapshot = (Vec<String>, String, Vec<String>);

    fn snapshot(keyset: &Keyset) -> Snapshot {
        (
            keyset.items().iter().map(|i| i.id.clone()).collect(),
            keyset.primary_id().unwrap_or_default().to_string(),
            keyset.distrusted_items().iter().map(|i| i.id.clone()).collect(),
        )
    }

    /// Records every driver call and the CA keyset as each apply saw it;
    /// optionally fails the n-th call
    struct Recording {
        inner: Arc<ClusterRotationDriver>,
        clientset: VfsClientset,
        cluster: Cluster,
        calls: Mutex<Vec<String>>,
        applies: Mutex<Vec<Snapshot>>,
        fail_at: Option<usize>,
        count: AtomicUsize,
    }

    impl Recording {
        fn new(env: &Env, fail_at: Option<usize>) -> Self {
            Self {
                inner: env.driver.clone(),
                clientset: env.clientset.clone(),
                cluster: env.cluster.clone(),
                calls: Mutex::new(Vec::new()),
                applies: Mutex::new(Vec::new()),
                fail_at,
                count: AtomicUsize::new(0),
            }
        }

        fn record(&self, call: String) -> Result<()> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls.lock().unwrap().push(call);
            if self.fail_at == Some(n) {
                return Err(RolloutError::ApplyFailed("injected".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RotationDriver for Recording {
        async fn apply(&self) -> Result<()> {
            self.record("apply".into())?;
            let keyset = self
                .clientset
                .key_store(&self.cluster)
                .get_keyset(names::KUBERNETES_CA)
                .await?;
            self.applies.lock().unwrap().push(snapshot(&keyset));
            self.inner.apply().await
        }

        async fn roll(&self, roles: &[InstanceGroupRole]) -> Result<()> {
            let names: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
            self.record(format!("roll {}", names.join(",")))?;
            self.inner.roll(roles).await
        }

        async fn publish_trust_bundle(&self, bundle: &str) -> Result<()> {
            self.record("publish".into())?;
            self.inner.publish_trust_bundle(bundle).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_progresses_through_stages() {
        let env = applied_cluster().await;
        let original = env.ca().await;
        let a = original.primary_id().unwrap().to_string();
        let recording = Arc::new(Recording::new(&env, None));

        let report = env.rotation(recording.clone()).run().await.unwrap();

        let applies = recording.applies.lock().unwrap().clone();
        assert_eq!(applies.len(), 3);
        let b = applies[0].0.iter().find(|id| **id != a).unwrap().clone();
        assert_eq!(applies[0], (vec![a.clone(), b.clone()], a.clone(), vec![]));
        assert_eq!(applies[1], (vec![a.clone(), b.clone()], b.clone(), vec![]));
        assert_eq!(applies[2], (vec![a.clone(), b.clone()], b.clone(), vec![a.clone()]));
        assert_eq!(snapshot(&env.ca().await), (vec![b.clone()], b.clone(), vec![]));

        assert_eq!(
            *recording.calls.lock().unwrap(),
            vec![
                "apply",
                "publish",
                "roll Node",
                "roll ControlPlane,APIServer",
                "apply",
                "roll ControlPlane,APIServer",
                "roll Node",
                "apply",
                "publish",
                "roll Bastion,ControlPlane,APIServer,Node",
            ]
        );
        assert!(report.steps.iter().any(|s| s.starts_with("Deleted kubernetes-ca")));
        assert_eq!(
            keyset_stage(
                &env.clientset
                    .key_store(&env.cluster)
                    .get_keyset(names::SERVICE_ACCOUNT)
                    .await
                    .unwrap()
            ),
            KeysetStage::Fresh
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_replaces_instances_and_publishes_bundle() {
        let env = applied_cluster().await;
        let before: Vec<String> = env
            .kube
            .list_nodes()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|n| n.instance_id)
            .collect();
        assert_eq!(before.len(), 3);

        env.rotation(env.driver.clone()).run().await.unwrap();

        let ca = env.ca().await;
        assert_eq!(ca.items().len(), 1);
        assert_eq!(
            env.kube.secret_data("default", "default-token-abcde", "ca.crt"),
            Some(ca.trust_bundle_pem().into_bytes())
        );
        let after: Vec<String> = env
            .kube
            .list_nodes()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|n| n.instance_id)
            .collect();
        assert_eq!(after.len(), 3);
        assert!(after.iter().all(|id| !before.contains(id)));

        let cluster = env.clientset.require_cluster(CLUSTER).await.unwrap();
        let igs = env.clientset.instance_groups_for(&cluster).list().await.unwrap();
        let result = ClusterValidator::new(cluster, igs, env.cloud.clone(), env.kube.clone())
            .validate()
            .await
            .unwrap();
        assert!(result.passed(), "{:?}", result.failures);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_rotation_resumes() {
        let env = applied_cluster().await;
        let a = env.ca().await.primary_id().unwrap().to_string();

        // fails on the control plane roll right after promotion
        let failing = Arc::new(Recording::new(&env, Some(6)));
        let err = env.rotation(failing).run().await.unwrap_err();
        assert!(matches!(err, RolloutError::ApplyFailed(_)));
        let interrupted = env.ca().await;
        assert_eq!(keyset_stage(&interrupted), KeysetStage::Promoted);
        let b = interrupted.primary_id().unwrap().to_string();
        assert_ne!(a, b);

        let resumed = Arc::new(Recording::new(&env, None));
        env.rotation(resumed.clone()).run().await.unwrap();

        assert_eq!(snapshot(&env.ca().await), (vec![b.clone()], b, vec![]));
        assert_eq!(resumed.calls.lock().unwrap()[0], "apply");
        assert_eq!(resumed.applies.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preconditions() {
        let env = applied_cluster().await;
        let mut legacy = env.cluster.clone();
        legacy.spec.node_bootstrap = Some(NodeBootstrap::Legacy);
        let err = CaRotation::new(env.clientset.clone(), legacy, env.driver.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::RotationPrecondition(_)), "{err}");

        let bare = VfsClientset::new(VfsPath::new(Arc::new(MemFs::new()), "state"));
        let stored = bare.create_cluster(&cluster()).await.unwrap();
        let err = CaRotation::new(bare, stored, env.driver.clone())
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SSH"), "{err}");
    }
}
