//! Cluster health oracle
//!
//! [`ClusterValidator`] compares the cloud's instance groups with the
//! Kubernetes API: every group at its target size, every member joined and
//! ready, and every system component running. It only reads.

use crate::error::Result;
use crate::k8s::{KubeClient, LABEL_ZONE, Node, SYSTEM_NAMESPACE};
use async_trait::async_trait;
use kopsflow_cloud::{Cloud, CloudInstanceStatus, NodeInfo};
use kopsflow_core::{Cluster, InstanceGroup, InstanceGroupRole};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    InstanceGroup,
    Node,
    Pod,
    SystemComponent,
    Network,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::InstanceGroup => "InstanceGroup",
            FailureKind::Node => "Node",
            FailureKind::Pod => "Pod",
            FailureKind::SystemComponent => "SystemComponent",
            FailureKind::Network => "Network",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationFailure {
    pub kind: FailureKind,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationNode {
    pub name: String,
    pub role: String,
    pub zone: Option<String>,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationPod {
    pub namespace: String,
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub nodes: Vec<ValidationNode>,
    pub pods: Vec<ValidationPod>,
    pub failures: Vec<ValidationFailure>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, kind: FailureKind, name: impl Into<String>, message: impl Into<String>) {
        self.failures.push(ValidationFailure {
            kind,
            name: name.into(),
            message: message.into(),
        });
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self) -> Result<ValidationResult>;
}

pub struct ClusterValidator {
    cluster: Cluster,
    instance_groups: Vec<InstanceGroup>,
    cloud: Arc<dyn Cloud>,
    kube: Arc<dyn KubeClient>,
}

impl ClusterValidator {
    pub fn new(
        cluster: Cluster,
        instance_groups: Vec<InstanceGroup>,
        cloud: Arc<dyn Cloud>,
        kube: Arc<dyn KubeClient>,
    ) -> Self {
        Self {
            cluster,
            instance_groups,
            cloud,
            kube,
        }
    }

    /// `(label, value)` selectors of the kube-system components that must
    /// have at least one ready pod
    fn required_components(&self) -> Vec<(&'static str, &'static str)> {
        let mut required = vec![
            ("component", "kube-apiserver"),
            ("component", "kube-controller-manager"),
            ("component", "kube-scheduler"),
            ("k8s-app", "kube-dns"),
        ];
        let networking = self.cluster.spec.networking.as_ref();
        let cni = networking.and_then(|n| n.cni_daemonset());
        // cilium replaces kube-proxy
        if cni != Some("cilium") {
            required.push(("k8s-app", "kube-proxy"));
        }
        if let Some(cni) = cni {
            required.push(("k8s-app", cni));
        }
        required
    }

    async fn check_groups(&self, nodes: &[Node], result: &mut ValidationResult) -> Result<()> {
        let infos: Vec<NodeInfo> = nodes.iter().map(Node::info).collect();
        let groups = self
            .cloud
            .get_cloud_groups(&self.cluster, &self.instance_groups, false, Some(&infos))
            .await?;

        for ig in &self.instance_groups {
            if ig.role() == InstanceGroupRole::Bastion {
                continue;
            }
            let Some(group) = groups.get(ig.name()) else {
                result.fail(
                    FailureKind::InstanceGroup,
                    ig.name(),
                    format!("InstanceGroup {:?} is missing from the cloud provider", ig.name()),
                );
                continue;
            };
            if group.current_size() < group.target_size {
                result.fail(
                    FailureKind::InstanceGroup,
                    ig.name(),
                    format!(
                        "InstanceGroup {:?} did not have enough nodes {} vs {}",
                        ig.name(),
                        group.current_size(),
                        group.target_size
                    ),
                );
            }
            for member in group.members() {
                if member.status == CloudInstanceStatus::Detached {
                    continue;
                }
                match &member.node {
                    None => result.fail(
                        FailureKind::Node,
                        &member.id,
                        format!("machine {:?} has not yet joined cluster", member.id),
                    ),
                    Some(node) if !node.ready => result.fail(
                        FailureKind::Node,
                        &node.name,
                        format!("node {:?} of role {:?} is not ready", node.name, ig.role().as_str()),
                    ),
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    async fn check_pods(&self, result: &mut ValidationResult) -> Result<()> {
        let pods = self.kube.list_pods(Some(SYSTEM_NAMESPACE), None).await?;

        for pod in &pods {
            result.pods.push(ValidationPod {
                namespace: pod.namespace.clone(),
                name: pod.name.clone(),
                phase: pod.phase.clone(),
                ready: pod.ready,
            });
            if pod.phase == "Succeeded" || pod.is_running_ready() {
                continue;
            }
            let message = if pod.phase == "Running" {
                format!("system-node-critical pod {:?} is not ready", pod.name)
            } else {
                format!("system-node-critical pod {:?} is {}", pod.name, pod.phase.to_lowercase())
            };
            result.fail(FailureKind::Pod, pod.key(), message);
        }

        for (label, value) in self.required_components() {
            let running = pods
                .iter()
                .any(|p| p.labels.get(label).map(String::as_str) == Some(value) && p.is_running_ready());
            if !running {
                result.fail(
                    FailureKind::SystemComponent,
                    value,
                    format!("no ready pods for {label}={value} in {SYSTEM_NAMESPACE}"),
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Validator for ClusterValidator {
    async fn validate(&self) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        if let Err(e) = self.kube.server_version().await {
            result.fail(
                FailureKind::Network,
                self.cluster.name(),
                format!("unable to reach the API server: {e}"),
            );
            return Ok(result);
        }

        let nodes = self.kube.list_nodes().await?;
        result.nodes = nodes
            .iter()
            .map(|n| ValidationNode {
                name: n.name.clone(),
                role: n.role().to_string(),
                zone: n.labels.get(LABEL_ZONE).cloned(),
                ready: n.ready,
            })
            .collect();

        self.check_groups(&nodes, &mut result).await?;
        self.check_pods(&mut result).await?;

        tracing::debug!(failures = result.failures.len(), "Validated cluster {}", self.cluster.name());
        Ok(result)
    }
}

/// Failure counts by kind, for one-line summaries
pub fn failure_summary(result: &ValidationResult) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for failure in &result.failures {
        *counts.entry(failure.kind.to_string()).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeKube, running_pod};
    use crate::testing::{CLUSTER, seeded};

    async fn validator(fake: &Arc<FakeKube>, world: &crate::testing::World) -> ClusterValidator {
        ClusterValidator::new(
            world.cluster.clone(),
            world.instance_groups.clone(),
            world.cloud.clone(),
            fake.clone(),
        )
    }

    #[tokio::test]
    async fn test_healthy_cluster_passes() {
        let world = seeded(1, 2).await;
        let fake = Arc::new(world.kube());
        let result = validator(&fake, &world).await.validate().await.unwrap();

        assert!(result.passed(), "{:?}", result.failures);
        assert_eq!(result.nodes.len(), 3);
        assert_eq!(result.nodes.iter().filter(|n| n.role == "control-plane").count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_api_is_network_failure() {
        let world = seeded(1, 2).await;
        let fake = Arc::new(world.kube());
        fake.set_api_available(false);

        let result = validator(&fake, &world).await.validate().await.unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind, FailureKind::Network);
        assert_eq!(result.failures[0].name, CLUSTER);
    }

    #[tokio::test]
    async fn test_unready_node_and_missing_component() {
        let world = seeded(1, 2).await;
        let fake = Arc::new(world.kube());
        let nodes = fake.list_nodes().await.unwrap();
        let worker = nodes.iter().find(|n| n.role() == "node").unwrap();
        fake.set_node_ready(&worker.name, false);
        fake.remove_pod(SYSTEM_NAMESPACE, "kube-scheduler-0");

        let result = validator(&fake, &world).await.validate().await.unwrap();
        let kinds: Vec<FailureKind> = result.failures.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FailureKind::Node, FailureKind::SystemComponent]);
        assert_eq!(result.failures[1].name, "kube-scheduler");
        assert_eq!(failure_summary(&result).get("Node"), Some(&1));
    }

    #[tokio::test]
    async fn test_not_joined_and_crashing_pod() {
        let world = seeded(1, 2).await;
        let fake = Arc::new(FakeKube::new().with_system_pods(&world.cluster));
        let mut crashing = running_pod(SYSTEM_NAMESPACE, "ebs-csi-node-x", None, "app", "ebs-csi-node");
        crashing.ready = false;
        fake.add_pod(crashing);

        let result = validator(&fake, &world).await.validate().await.unwrap();
        let not_joined = result
            .failures
            .iter()
            .filter(|f| f.kind == FailureKind::Node && f.message.contains("has not yet joined cluster"))
            .count();
        assert_eq!(not_joined, 3);
        assert!(result
            .failures
            .iter()
            .any(|f| f.kind == FailureKind::Pod && f.name == "kube-system/ebs-csi-node-x"));
    }

    #[tokio::test]
    async fn test_missing_group_is_reported() {
        let mut world = seeded(1, 2).await;
        let mut extra = InstanceGroup::new("spot", InstanceGroupRole::Node);
        extra.spec.min_size = Some(1);
        world.instance_groups.push(extra);
        let fake = Arc::new(world.kube());

        let result = validator(&fake, &world).await.validate().await.unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind, FailureKind::InstanceGroup);
        assert_eq!(result.failures[0].name, "spot");
    }
}
