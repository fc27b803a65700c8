//! Cluster object

use super::meta::{ObjectMeta, UnknownFields};
use super::provider::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: ClusterSpec::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn subnet(&self, name: &str) -> Option<&ClusterSubnetSpec> {
        self.spec.subnets.iter().find(|s| s.name == name)
    }

    /// Whether nodes join through kops-controller rather than static credentials
    pub fn uses_kops_controller_bootstrap(&self) -> bool {
        !matches!(self.spec.node_bootstrap, Some(NodeBootstrap::Legacy))
    }

    pub fn uses_shared_network(&self) -> bool {
        self.spec.network_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<ClusterSubnetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_public_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_internal_name: Option<String>,
    #[serde(
        default,
        rename = "networkCIDR",
        skip_serializing_if = "Option::is_none"
    )]
    pub network_cidr: Option<String>,
    /// Id of an existing (shared) VPC
    #[serde(default, rename = "networkID", skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(
        default,
        rename = "nonMasqueradeCIDR",
        skip_serializing_if = "Option::is_none"
    )]
    pub non_masquerade_cidr: Option<String>,
    #[serde(
        default,
        rename = "serviceClusterIPRange",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_cluster_ip_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_access: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubernetes_api_access: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_clusters: Vec<EtcdClusterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<NetworkingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<AccessSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_bootstrap: Option<NodeBootstrap>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cloud_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<AddonSpec>,
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubnetType {
    #[default]
    Public,
    Private,
    Utility,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSubnetSpec {
    pub name: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    /// Provider id of an existing (shared) subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,
    #[serde(default, rename = "type")]
    pub subnet_type: SubnetType,
}

impl ClusterSubnetSpec {
    pub fn is_shared(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    #[serde(default)]
    pub control_plane: TopologyKind,
    #[serde(default)]
    pub nodes: TopologyKind,
    /// Whether a bastion instance group fronts SSH access
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bastion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    pub name: String,
    #[serde(default)]
    pub etcd_members: Vec<EtcdMemberSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdMemberSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_volume: Option<bool>,
}

/// Marker for networking options that take no settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptySpec {}

/// Exactly one field is expected to be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubenet: Option<EmptySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cilium: Option<EmptySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calico: Option<EmptySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amazonvpc: Option<EmptySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni: Option<EmptySpec>,
}

impl NetworkingSpec {
    pub fn named(name: &str) -> Option<Self> {
        let mut spec = Self::default();
        match name {
            "kubenet" => spec.kubenet = Some(EmptySpec {}),
            "cilium" => spec.cilium = Some(EmptySpec {}),
            "calico" => spec.calico = Some(EmptySpec {}),
            "amazonvpc" | "amazon-vpc-routed-eni" => spec.amazonvpc = Some(EmptySpec {}),
            "cni" => spec.cni = Some(EmptySpec {}),
            _ => return None,
        }
        Some(spec)
    }

    /// Names of the options that are set
    pub fn selected(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.kubenet.is_some() {
            out.push("kubenet");
        }
        if self.cilium.is_some() {
            out.push("cilium");
        }
        if self.calico.is_some() {
            out.push("calico");
        }
        if self.amazonvpc.is_some() {
            out.push("amazonvpc");
        }
        if self.cni.is_some() {
            out.push("cni");
        }
        out
    }

    /// Name of the daemonset the validator expects in kube-system, if any
    pub fn cni_daemonset(&self) -> Option<&'static str> {
        match self.selected().first().copied() {
            Some("cilium") => Some("cilium"),
            Some("calico") => Some("calico-node"),
            Some("amazonvpc") => Some("aws-node"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<EmptySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerAccessSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancerType {
    #[default]
    Public,
    Internal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerAccessSpec {
    #[serde(default, rename = "type")]
    pub lb_type: LoadBalancerType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeBootstrap {
    KopsController,
    Legacy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddonSpec {
    pub manifest: String,
}

/// Observed state persisted beside the cluster spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_clusters: Vec<EtcdClusterStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_kubernetes_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}
