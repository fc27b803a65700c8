//! In-memory Kubernetes API for tests
//!
//! `FakeKube` holds nodes, pods and secrets, records mutating calls and can
//! refuse evictions the way a PodDisruptionBudget would. When joined to a
//! cloud it also plays the kubelets: every cloud instance gets a ready node
//! and nodes of terminated instances disappear.

use crate::error::{Result, RolloutError};
use crate::k8s::{
    KubeClient, LABEL_CONTROL_PLANE, LABEL_ROLE, Node, Pod, SERVICE_ACCOUNT_TOKEN_TYPE,
    SYSTEM_NAMESPACE, SecretRef,
};
use async_trait::async_trait;
use kopsflow_cloud::Cloud;
use kopsflow_core::{Cluster, InstanceGroup, InstanceGroupRole};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    secrets: BTreeMap<SecretRef, (String, BTreeMap<String, Vec<u8>>)>,
    refusals: BTreeMap<String, u32>,
    /// Instance ids whose nodes never become ready
    unready_instances: Vec<String>,
    api_down: bool,
    calls: Vec<String>,
}

struct Joiner {
    cloud: Arc<dyn Cloud>,
    cluster: Cluster,
    instance_groups: Vec<InstanceGroup>,
}

#[derive(Default)]
pub struct FakeKube {
    state: Mutex<FakeState>,
    joiner: Option<Joiner>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the node list in step with the cloud's instances
    pub fn joined_to(mut self, cloud: Arc<dyn Cloud>, cluster: &Cluster, instance_groups: &[InstanceGroup]) -> Self {
        self.joiner = Some(Joiner {
            cloud,
            cluster: cluster.clone(),
            instance_groups: instance_groups.to_vec(),
        });
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_node(&self, name: &str, instance_id: Option<&str>, control_plane: bool) {
        self.lock().nodes.insert(
            name.to_string(),
            Node {
                name: name.to_string(),
                instance_id: instance_id.map(str::to_string),
                ready: true,
                labels: role_labels(control_plane),
                ..Default::default()
            },
        );
    }

    pub fn set_node_ready(&self, name: &str, ready: bool) {
        if let Some(node) = self.lock().nodes.get_mut(name) {
            node.ready = ready;
        }
    }

    /// Nodes joined for `instance_id` report NotReady
    pub fn keep_unready(&self, instance_id: &str) {
        let mut state = self.lock();
        state.unready_instances.push(instance_id.to_string());
        for node in state.nodes.values_mut() {
            if node.instance_id.as_deref() == Some(instance_id) {
                node.ready = false;
            }
        }
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.insert(pod.key(), pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.lock().pods.remove(&format!("{namespace}/{name}"));
    }

    /// Seed ready pods for every component the validator requires
    pub fn with_system_pods(self, cluster: &Cluster) -> Self {
        let mut components = vec![
            ("component", "kube-apiserver"),
            ("component", "kube-controller-manager"),
            ("component", "kube-scheduler"),
            ("k8s-app", "kube-dns"),
            ("k8s-app", "kube-proxy"),
        ];
        if let Some(cni) = cluster.spec.networking.as_ref().and_then(|n| n.cni_daemonset()) {
            components.push(("k8s-app", cni));
        }
        for (label, value) in components {
            self.add_pod(running_pod(SYSTEM_NAMESPACE, &format!("{value}-0"), None, label, value));
        }
        self
    }

    /// Refuse the next `times` evictions of a pod with a 429
    pub fn refuse_evictions(&self, namespace: &str, name: &str, times: u32) {
        self.lock().refusals.insert(format!("{namespace}/{name}"), times);
    }

    pub fn set_api_available(&self, available: bool) {
        self.lock().api_down = !available;
    }

    pub fn add_token_secret(&self, namespace: &str, name: &str) {
        self.lock().secrets.insert(
            SecretRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            (SERVICE_ACCOUNT_TOKEN_TYPE.to_string(), BTreeMap::new()),
        );
    }

    pub fn secret_data(&self, namespace: &str, name: &str, key: &str) -> Option<Vec<u8>> {
        let secret = SecretRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.lock()
            .secrets
            .get(&secret)
            .and_then(|(_, data)| data.get(key).cloned())
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.lock().pods.values().cloned().collect()
    }

    fn check_api(&self) -> Result<()> {
        if self.lock().api_down {
            return Err(RolloutError::kube(None, "connection refused"));
        }
        Ok(())
    }

    async fn sync_with_cloud(&self) -> Result<()> {
        let Some(joiner) = &self.joiner else {
            return Ok(());
        };
        let groups = joiner
            .cloud
            .get_cloud_groups(&joiner.cluster, &joiner.instance_groups, false, None)
            .await?;

        let mut state = self.lock();
        let mut live = Vec::new();
        for group in groups.values() {
            let control_plane = matches!(
                group.role(),
                InstanceGroupRole::ControlPlane | InstanceGroupRole::ApiServer
            );
            for member in group.members() {
                live.push(member.id.clone());
                let name = node_name(&member.id);
                if state.nodes.contains_key(&name) {
                    continue;
                }
                let ready = !state.unready_instances.contains(&member.id);
                state.nodes.insert(
                    name.clone(),
                    Node {
                        name,
                        instance_id: Some(member.id.clone()),
                        ready,
                        labels: role_labels(control_plane),
                        ..Default::default()
                    },
                );
            }
        }
        let gone: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.instance_id.as_ref().is_some_and(|id| !live.contains(id)))
            .map(|n| n.name.clone())
            .collect();
        for name in gone {
            state.nodes.remove(&name);
            state.pods.retain(|_, p| p.node_name.as_deref() != Some(name.as_str()));
        }
        Ok(())
    }
}

fn role_labels(control_plane: bool) -> BTreeMap<String, String> {
    if control_plane {
        BTreeMap::from([(LABEL_CONTROL_PLANE.to_string(), String::new())])
    } else {
        BTreeMap::from([(LABEL_ROLE.to_string(), "node".to_string())])
    }
}

/// Node name the fake kubelet registers for an instance
pub fn node_name(instance_id: &str) -> String {
    format!("node-{instance_id}")
}

/// A running, ready pod carrying one label
pub fn running_pod(namespace: &str, name: &str, node: Option<&str>, label: &str, value: &str) -> Pod {
    Pod {
        namespace: namespace.to_string(),
        name: name.to_string(),
        node_name: node.map(str::to_string),
        phase: "Running".to_string(),
        ready: true,
        owner_kind: Some("ReplicaSet".to_string()),
        labels: BTreeMap::from([(label.to_string(), value.to_string())]),
        annotations: BTreeMap::new(),
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn server_version(&self) -> Result<String> {
        self.check_api()?;
        Ok("v1.31.4".to_string())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.check_api()?;
        self.sync_with_cloud().await?;
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()> {
        self.check_api()?;
        let mut state = self.lock();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| RolloutError::kube(Some(404), format!("node {node} not found")))?;
        entry.unschedulable = unschedulable;
        let verb = if unschedulable { "Cordon" } else { "Uncordon" };
        state.calls.push(format!("{verb} {node}"));
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        self.check_api()?;
        let mut state = self.lock();
        if state.nodes.remove(node).is_none() {
            return Err(RolloutError::kube(Some(404), format!("node {node} not found")));
        }
        state.pods.retain(|_, p| p.node_name.as_deref() != Some(node));
        state.calls.push(format!("DeleteNode {node}"));
        Ok(())
    }

    async fn list_pods(&self, namespace: Option<&str>, node: Option<&str>) -> Result<Vec<Pod>> {
        self.check_api()?;
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| namespace.is_none_or(|ns| p.namespace == ns))
            .filter(|p| node.is_none_or(|n| p.node_name.as_deref() == Some(n)))
            .cloned()
            .collect())
    }

    async fn evict_pod(&self, namespace: &str, name: &str, _grace_period: Option<Duration>) -> Result<()> {
        self.check_api()?;
        let key = format!("{namespace}/{name}");
        let mut state = self.lock();
        if let Some(remaining) = state.refusals.get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            state.calls.push(format!("EvictRefused {key}"));
            return Err(RolloutError::kube(
                Some(429),
                "Cannot evict pod as it would violate the pod's disruption budget.",
            ));
        }
        if state.pods.remove(&key).is_none() {
            return Err(RolloutError::kube(Some(404), format!("pod {key} not found")));
        }
        state.calls.push(format!("Evict {key}"));
        Ok(())
    }

    async fn list_service_account_token_secrets(&self) -> Result<Vec<SecretRef>> {
        self.check_api()?;
        Ok(self
            .lock()
            .secrets
            .iter()
            .filter(|(_, (kind, _))| kind == SERVICE_ACCOUNT_TOKEN_TYPE)
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn set_secret_data(&self, secret: &SecretRef, key: &str, value: &[u8]) -> Result<()> {
        self.check_api()?;
        let mut state = self.lock();
        let (_, data) = state
            .secrets
            .get_mut(secret)
            .ok_or_else(|| RolloutError::kube(Some(404), format!("secret {} not found", secret.name)))?;
        data.insert(key.to_string(), value.to_vec());
        state
            .calls
            .push(format!("UpdateSecret {}/{}", secret.namespace, secret.name));
        Ok(())
    }
}
