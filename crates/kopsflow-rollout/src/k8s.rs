//! Kubernetes API seam
//!
//! Rolling updates, drains and validation only need a handful of calls, so
//! they go through [`KubeClient`] rather than a full client. [`KubeRsClient`]
//! implements it over `kube`; tests use `FakeKube`.

use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod as KubePod, Secret};
use kopsflow_cloud::NodeInfo;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_LEGACY_MASTER: &str = "node-role.kubernetes.io/master";
pub const LABEL_ROLE: &str = "kubernetes.io/role";
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const ANNOTATION_MIRROR: &str = "kubernetes.io/config.mirror";
pub const SYSTEM_NAMESPACE: &str = "kube-system";
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// The parts of a Node the rollout code looks at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub name: String,
    pub instance_id: Option<String>,
    pub ready: bool,
    pub unschedulable: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Node {
    /// `control-plane` or `node`, from the role labels
    pub fn role(&self) -> &str {
        if self.labels.contains_key(LABEL_CONTROL_PLANE) || self.labels.contains_key(LABEL_LEGACY_MASTER) {
            return "control-plane";
        }
        match self.labels.get(LABEL_ROLE).map(String::as_str) {
            Some("master") => "control-plane",
            Some(role) if !role.is_empty() => role,
            _ => "node",
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            instance_id: self.instance_id.clone(),
            ready: self.ready,
            unschedulable: self.unschedulable,
            annotations: self.annotations.clone(),
        }
    }
}

/// The parts of a Pod the drain and the validator look at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub node_name: Option<String>,
    /// `Pending`, `Running`, `Succeeded`, `Failed` or `Unknown`
    pub phase: String,
    pub ready: bool,
    /// Kind of the controlling owner (`DaemonSet`, `ReplicaSet`, ...)
    pub owner_kind: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Pod {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_daemonset(&self) -> bool {
        self.owner_kind.as_deref() == Some("DaemonSet")
    }

    /// Static pods mirrored by the kubelet cannot be evicted
    pub fn is_mirror(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_MIRROR)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase.as_str(), "Succeeded" | "Failed")
    }

    pub fn is_running_ready(&self) -> bool {
        self.phase == "Running" && self.ready
    }
}

/// A secret identified by namespace and name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Git version of the API server; fails when it is unreachable
    async fn server_version(&self) -> Result<String>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()>;

    async fn delete_node(&self, node: &str) -> Result<()>;

    /// Pods in `namespace` (all namespaces when `None`), optionally only
    /// those bound to `node`
    async fn list_pods(&self, namespace: Option<&str>, node: Option<&str>) -> Result<Vec<Pod>>;

    /// Evict through the eviction API, so PodDisruptionBudgets apply. A
    /// budget violation is reported as a 429.
    async fn evict_pod(&self, namespace: &str, name: &str, grace_period: Option<Duration>) -> Result<()>;

    async fn list_service_account_token_secrets(&self) -> Result<Vec<SecretRef>>;

    async fn set_secret_data(&self, secret: &SecretRef, key: &str, value: &[u8]) -> Result<()>;
}

/// Cloud instance id from a node's provider id
/// (`aws:///us-test-1a/i-0123`, `gce://project/zone/name`)
pub fn instance_id_from_provider_id(provider_id: &str) -> Option<String> {
    let (_, rest) = provider_id.split_once("://")?;
    rest.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn condition_true<'a>(mut conditions: impl Iterator<Item = (&'a str, &'a str)>) -> bool {
    conditions.any(|(kind, status)| kind == "Ready" && status == "True")
}

fn node_from(node: &KubeNode) -> Node {
    let spec = node.spec.as_ref();
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| condition_true(c.iter().map(|c| (c.type_.as_str(), c.status.as_str()))));
    Node {
        name: node.metadata.name.clone().unwrap_or_default(),
        instance_id: spec
            .and_then(|s| s.provider_id.as_deref())
            .and_then(instance_id_from_provider_id),
        ready,
        unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
        labels: node.metadata.labels.clone().unwrap_or_default(),
        annotations: node.metadata.annotations.clone().unwrap_or_default(),
    }
}

fn pod_from(pod: &KubePod) -> Pod {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| condition_true(c.iter().map(|c| (c.type_.as_str(), c.status.as_str()))));
    let owner_kind = pod.metadata.owner_references.as_ref().and_then(|owners| {
        owners
            .iter()
            .find(|o| o.controller == Some(true))
            .or_else(|| owners.first())
            .map(|o| o.kind.clone())
    });
    Pod {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        ready,
        owner_kind,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        annotations: pod.metadata.annotations.clone().unwrap_or_default(),
    }
}

/// [`KubeClient`] over a `kube::Client`
#[derive(Clone)]
pub struct KubeRsClient {
    client: kube::Client,
}

impl KubeRsClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Client for `context` (the current context when `None`) of the
    /// kubeconfig named by `KUBECONFIG`, or `~/.kube/config`
    pub async fn from_kubeconfig(context: Option<&str>) -> Result<Self> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let config = kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| RolloutError::kube(None, format!("cannot load kubeconfig: {e}")))?;
        let client = kube::Client::try_from(config)?;
        Ok(Self::new(client))
    }

    /// Client for `context` of the kubeconfig at `path`
    pub async fn from_kubeconfig_file(path: &Path, context: Option<&str>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            RolloutError::kube(None, format!("cannot read kubeconfig {}: {e}", path.display()))
        })?;
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| RolloutError::kube(None, format!("cannot load kubeconfig: {e}")))?;
        let client = kube::Client::try_from(config)?;
        Ok(Self::new(client))
    }

    fn nodes(&self) -> Api<KubeNode> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: Option<&str>) -> Api<KubePod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl KubeClient for KubeRsClient {
    async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self.nodes().list(&ListParams::default()).await?;
        Ok(list.items.iter().map(node_from).collect())
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()> {
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        self.nodes().delete(node, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: Option<&str>, node: Option<&str>) -> Result<Vec<Pod>> {
        let mut params = ListParams::default();
        if let Some(node) = node {
            params = params.fields(&format!("spec.nodeName={node}"));
        }
        let list = self.pods(namespace).list(&params).await?;
        Ok(list.items.iter().map(pod_from).collect())
    }

    async fn evict_pod(&self, namespace: &str, name: &str, grace_period: Option<Duration>) -> Result<()> {
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: grace_period.map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32),
                ..Default::default()
            }),
            post_options: PostParams::default(),
        };
        self.pods(Some(namespace)).evict(name, &params).await?;
        Ok(())
    }

    async fn list_service_account_token_secrets(&self) -> Result<Vec<SecretRef>> {
        let api: Api<Secret> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("type={SERVICE_ACCOUNT_TOKEN_TYPE}"));
        let list = api.list(&params).await?;
        let mut refs: Vec<SecretRef> = list
            .items
            .iter()
            .map(|s| SecretRef {
                namespace: s.metadata.namespace.clone().unwrap_or_default(),
                name: s.metadata.name.clone().unwrap_or_default(),
            })
            .collect();
        refs.sort();
        Ok(refs)
    }

    async fn set_secret_data(&self, secret: &SecretRef, key: &str, value: &[u8]) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        let patch = json!({ "data": { key: BASE64.encode(value) } });
        api.patch(&secret.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_from_provider_id() {
        assert_eq!(
            instance_id_from_provider_id("aws:///us-test-1a/i-0123456789").as_deref(),
            Some("i-0123456789")
        );
        assert_eq!(
            instance_id_from_provider_id("gce://project/us-central1-a/nodes-abcd").as_deref(),
            Some("nodes-abcd")
        );
        assert_eq!(instance_id_from_provider_id("i-0123"), None);
    }

    #[test]
    fn test_node_role() {
        let mut node = Node::default();
        assert_eq!(node.role(), "node");
        node.labels.insert(LABEL_ROLE.into(), "master".into());
        assert_eq!(node.role(), "control-plane");
        node.labels.clear();
        node.labels.insert(LABEL_CONTROL_PLANE.into(), String::new());
        assert_eq!(node.role(), "control-plane");
    }

    #[test]
    fn test_pod_from_api_object() {
        let pod: KubePod = serde_json::from_value(json!({
            "metadata": {
                "name": "cilium-abcde",
                "namespace": "kube-system",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "DaemonSet",
                    "name": "cilium",
                    "uid": "1",
                    "controller": true
                }]
            },
            "spec": { "nodeName": "node-1", "containers": [] },
            "status": {
                "phase": "Running",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        }))
        .unwrap();
        let pod = pod_from(&pod);
        assert!(pod.is_daemonset());
        assert!(pod.is_running_ready());
        assert_eq!(pod.node_name.as_deref(), Some("node-1"));
        assert_eq!(pod.key(), "kube-system/cilium-abcde");
    }
}
