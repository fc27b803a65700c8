//! InstanceGroup object

use super::meta::{ObjectMeta, UnknownFields};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub metadata: ObjectMeta,
    pub spec: InstanceGroupSpec,
}

impl InstanceGroup {
    pub fn new(name: impl Into<String>, role: InstanceGroupRole) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: InstanceGroupSpec {
                role,
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn role(&self) -> InstanceGroupRole {
        self.spec.role
    }

    pub fn is_control_plane(&self) -> bool {
        self.spec.role == InstanceGroupRole::ControlPlane
    }

    pub fn min_size(&self) -> i32 {
        self.spec.min_size.unwrap_or(0)
    }

    pub fn max_size(&self) -> i32 {
        self.spec.max_size.unwrap_or_else(|| self.min_size())
    }

    /// Name used for cloud resources (`nodes.example.com`,
    /// `master-us-test-1a.masters.example.com`)
    pub fn cloud_name(&self, cluster_name: &str) -> String {
        match self.spec.role {
            InstanceGroupRole::ControlPlane => {
                format!("{}.masters.{}", self.name(), cluster_name)
            }
            _ => format!("{}.{}", self.name(), cluster_name),
        }
    }
}

/// Role of an instance group. Declaration order is the rolling-update order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InstanceGroupRole {
    Bastion,
    #[serde(alias = "Master")]
    ControlPlane,
    #[serde(rename = "APIServer")]
    ApiServer,
    #[default]
    Node,
}

impl InstanceGroupRole {
    pub const ALL: [InstanceGroupRole; 4] = [
        InstanceGroupRole::Bastion,
        InstanceGroupRole::ControlPlane,
        InstanceGroupRole::ApiServer,
        InstanceGroupRole::Node,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceGroupRole::Bastion => "Bastion",
            InstanceGroupRole::ControlPlane => "ControlPlane",
            InstanceGroupRole::ApiServer => "APIServer",
            InstanceGroupRole::Node => "Node",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bastion" => Some(InstanceGroupRole::Bastion),
            "controlplane" | "control-plane" | "master" => Some(InstanceGroupRole::ControlPlane),
            "apiserver" => Some(InstanceGroupRole::ApiServer),
            "node" => Some(InstanceGroupRole::Node),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceGroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupSpec {
    #[serde(default)]
    pub role: InstanceGroupRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixed_instances_policy: Option<MixedInstancesPolicySpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cloud_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_security_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_user_data: Vec<UserData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associate_public_ip: Option<bool>,
    #[serde(flatten)]
    pub unknown_fields: UnknownFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixedInstancesPolicySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_demand_base: Option<i64>,
    /// Percentage of on-demand capacity above the base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_demand_above_base: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_allocation_strategy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_order_is_rolling_order() {
        let mut roles = vec![
            InstanceGroupRole::Node,
            InstanceGroupRole::ApiServer,
            InstanceGroupRole::Bastion,
            InstanceGroupRole::ControlPlane,
        ];
        roles.sort();
        assert_eq!(roles, InstanceGroupRole::ALL.to_vec());
    }

    #[test]
    fn test_cloud_name() {
        let cp = InstanceGroup::new("master-us-test-1a", InstanceGroupRole::ControlPlane);
        assert_eq!(
            cp.cloud_name("minimal.example.com"),
            "master-us-test-1a.masters.minimal.example.com"
        );
        let nodes = InstanceGroup::new("nodes", InstanceGroupRole::Node);
        assert_eq!(nodes.cloud_name("minimal.example.com"), "nodes.minimal.example.com");
    }

    #[test]
    fn test_master_alias() {
        let role: InstanceGroupRole = serde_yaml::from_str("Master").unwrap();
        assert_eq!(role, InstanceGroupRole::ControlPlane);
        assert_eq!(serde_yaml::to_string(&role).unwrap().trim(), "ControlPlane");
    }
}
