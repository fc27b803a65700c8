//! Cloud instance groups
//!
//! Providers report their autoscaling or managed groups as [`RawCloudGroup`]s.
//! [`match_cloud_groups`] maps them onto the registry's instance groups and
//! classifies every member as ready or in need of an update.

use kopsflow_core::{ANNOTATION_NEEDS_UPDATE, Cluster, InstanceGroup, InstanceGroupRole, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Tag carrying the cluster name on AWS-style providers
pub const TAG_CLUSTER: &str = "KubernetesCluster";
/// Tag carrying the instance group name on AWS-style providers
pub const TAG_INSTANCE_GROUP: &str = "kops.k8s.io/instancegroup";
/// Prefix of the `kubernetes.io/cluster/<name>` ownership tag
pub const TAG_CLUSTER_OWNERSHIP_PREFIX: &str = "kubernetes.io/cluster/";

/// How a provider labels the groups it creates for a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTagging {
    pub cluster_key: &'static str,
    pub instance_group_key: &'static str,
    /// Label values may not contain dots
    pub dashed_values: bool,
}

impl GroupTagging {
    pub fn for_provider(provider: ProviderId) -> Self {
        match provider {
            ProviderId::Gce => GroupTagging {
                cluster_key: "k8s-io-cluster-name",
                instance_group_key: "k8s-io-instance-group",
                dashed_values: true,
            },
            ProviderId::Azure => GroupTagging {
                cluster_key: "KubernetesCluster",
                instance_group_key: "k8s.io_cluster-autoscaler_node-template_label_kops.k8s.io_instancegroup",
                dashed_values: false,
            },
            _ => GroupTagging {
                cluster_key: TAG_CLUSTER,
                instance_group_key: TAG_INSTANCE_GROUP,
                dashed_values: false,
            },
        }
    }

    pub fn encode(&self, value: &str) -> String {
        if self.dashed_values {
            value.replace('.', "-")
        } else {
            value.to_string()
        }
    }

    /// Tags a provider puts on a group it creates for `ig`
    pub fn group_tags(&self, cluster_name: &str, ig_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.cluster_key.to_string(), self.encode(cluster_name)),
            (self.instance_group_key.to_string(), self.encode(ig_name)),
        ])
    }
}

/// Kubernetes node as seen by the cloud-group classifier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    /// Cloud instance id parsed from the node's provider id
    pub instance_id: Option<String>,
    pub ready: bool,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn needs_update(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_NEEDS_UPDATE)
    }
}

/// A provider-neutral observation of one autoscaling group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCloudGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub min_size: i32,
    pub max_size: i32,
    pub desired: i32,
    /// Launch template (or configuration) revision new instances get
    pub revision: String,
    #[serde(default)]
    pub instances: Vec<RawInstance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInstance {
    pub id: String,
    pub revision: String,
    #[serde(default)]
    pub detached: bool,
    #[serde(default)]
    pub machine_type: Option<String>,
}

/// Instance state; every status but `Ready` lands in `need_update`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudInstanceStatus {
    Ready,
    NeedsUpdate,
    Detached,
    /// Running but never registered as a Node; only judged when nodes are known
    NotJoined,
}

impl fmt::Display for CloudInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudInstanceStatus::Ready => write!(f, "Ready"),
            CloudInstanceStatus::NeedsUpdate => write!(f, "NeedsUpdate"),
            CloudInstanceStatus::Detached => write!(f, "Detached"),
            CloudInstanceStatus::NotJoined => write!(f, "NotJoined"),
        }
    }
}

/// Why an instance was classified as needing an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateReason {
    LaunchTemplateChanged,
    NodeAnnotated,
    NotJoined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub id: String,
    /// Id of the cloud group the instance belongs to
    pub group_id: String,
    pub status: CloudInstanceStatus,
    pub reasons: Vec<UpdateReason>,
    pub node: Option<NodeInfo>,
    pub machine_type: Option<String>,
}

/// Runtime shadow of an [`InstanceGroup`]
#[derive(Debug, Clone, PartialEq)]
pub struct CloudInstanceGroup {
    pub id: String,
    pub human_name: String,
    pub instance_group: InstanceGroup,
    pub min_size: i32,
    pub max_size: i32,
    pub target_size: i32,
    pub ready: Vec<CloudInstance>,
    pub need_update: Vec<CloudInstance>,
}

impl CloudInstanceGroup {
    pub fn role(&self) -> InstanceGroupRole {
        self.instance_group.role()
    }

    /// Instances still counted towards the group's capacity
    pub fn current_size(&self) -> i32 {
        self.members()
            .filter(|i| i.status != CloudInstanceStatus::Detached)
            .count() as i32
    }

    pub fn members(&self) -> impl Iterator<Item = &CloudInstance> {
        self.ready.iter().chain(self.need_update.iter())
    }
}

/// Map raw cloud groups onto instance groups.
///
/// Groups are visited by name ascending; when several carry the tags of one
/// instance group the first wins and the others are reported. `nodes` enables
/// the not-joined check: without it membership is judged on cloud data only.
pub fn match_cloud_groups(
    provider: ProviderId,
    cluster: &Cluster,
    instance_groups: &[InstanceGroup],
    raw_groups: &[RawCloudGroup],
    warn_unmatched: bool,
    nodes: Option<&[NodeInfo]>,
) -> BTreeMap<String, CloudInstanceGroup> {
    let tagging = GroupTagging::for_provider(provider);
    let cluster_value = tagging.encode(cluster.name());

    let nodes_by_instance: HashMap<&str, &NodeInfo> = nodes
        .unwrap_or_default()
        .iter()
        .filter_map(|n| n.instance_id.as_deref().map(|id| (id, n)))
        .collect();

    let mut sorted: Vec<&RawCloudGroup> = raw_groups.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut matched = BTreeMap::new();
    for raw in sorted {
        if raw.tags.get(tagging.cluster_key) != Some(&cluster_value) {
            continue;
        }

        let ig = raw
            .tags
            .get(tagging.instance_group_key)
            .and_then(|value| {
                instance_groups
                    .iter()
                    .find(|ig| tagging.encode(ig.name()) == *value)
            });

        let Some(ig) = ig else {
            if warn_unmatched {
                tracing::warn!("Found cloud group {} with no matching InstanceGroup", raw.name);
            }
            continue;
        };

        if matched.contains_key(ig.name()) {
            tracing::warn!(
                "Cloud group {} also matches InstanceGroup {}; keeping the first match",
                raw.name,
                ig.name()
            );
            continue;
        }

        let group = classify(raw, ig, &nodes_by_instance, nodes.is_some());
        matched.insert(ig.name().to_string(), group);
    }

    matched
}

fn classify(
    raw: &RawCloudGroup,
    ig: &InstanceGroup,
    nodes: &HashMap<&str, &NodeInfo>,
    check_joined: bool,
) -> CloudInstanceGroup {
    let mut instances: Vec<&RawInstance> = raw.instances.iter().collect();
    instances.sort_by(|a, b| a.id.cmp(&b.id));

    let mut ready = Vec::new();
    let mut need_update = Vec::new();

    for inst in instances {
        let node = nodes.get(inst.id.as_str()).map(|n| (*n).clone());

        let mut reasons = Vec::new();
        if inst.revision != raw.revision {
            reasons.push(UpdateReason::LaunchTemplateChanged);
        }
        if node.as_ref().is_some_and(NodeInfo::needs_update) {
            reasons.push(UpdateReason::NodeAnnotated);
        }
        if check_joined && node.is_none() && !inst.detached {
            reasons.push(UpdateReason::NotJoined);
        }

        let status = if inst.detached {
            CloudInstanceStatus::Detached
        } else if reasons.is_empty() {
            CloudInstanceStatus::Ready
        } else if reasons.contains(&UpdateReason::NotJoined) {
            CloudInstanceStatus::NotJoined
        } else {
            CloudInstanceStatus::NeedsUpdate
        };

        let member = CloudInstance {
            id: inst.id.clone(),
            group_id: raw.id.clone(),
            status,
            reasons,
            node,
            machine_type: inst.machine_type.clone(),
        };

        if status == CloudInstanceStatus::Ready {
            ready.push(member);
        } else {
            need_update.push(member);
        }
    }

    CloudInstanceGroup {
        id: raw.id.clone(),
        human_name: raw.name.clone(),
        instance_group: ig.clone(),
        min_size: raw.min_size,
        max_size: raw.max_size,
        target_size: raw.desired,
        ready,
        need_update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, ig: &str, revision: &str, instances: &[(&str, &str)]) -> RawCloudGroup {
        let tagging = GroupTagging::for_provider(ProviderId::Aws);
        RawCloudGroup {
            id: format!("asg-{name}"),
            name: name.to_string(),
            tags: tagging.group_tags("minimal.example.com", ig),
            min_size: instances.len() as i32,
            max_size: instances.len() as i32,
            desired: instances.len() as i32,
            revision: revision.to_string(),
            instances: instances
                .iter()
                .map(|(id, rev)| RawInstance {
                    id: id.to_string(),
                    revision: rev.to_string(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn fixture() -> (Cluster, Vec<InstanceGroup>) {
        let cluster = Cluster::new("minimal.example.com");
        let igs = vec![
            InstanceGroup::new("master-us-test-1a", InstanceGroupRole::ControlPlane),
            InstanceGroup::new("nodes", InstanceGroupRole::Node),
        ];
        (cluster, igs)
    }

    #[test]
    fn test_classifies_revision_mismatch() {
        let (cluster, igs) = fixture();
        let groups = vec![raw(
            "nodes.minimal.example.com",
            "nodes",
            "lt-1:2",
            &[("i-2", "lt-1:2"), ("i-1", "lt-1:1")],
        )];

        let matched = match_cloud_groups(ProviderId::Aws, &cluster, &igs, &groups, true, None);
        let nodes = &matched["nodes"];
        assert_eq!(nodes.ready.len(), 1);
        assert_eq!(nodes.ready[0].id, "i-2");
        assert_eq!(nodes.need_update.len(), 1);
        assert_eq!(nodes.need_update[0].id, "i-1");
        assert_eq!(
            nodes.need_update[0].reasons,
            vec![UpdateReason::LaunchTemplateChanged]
        );
    }

    #[test]
    fn test_annotation_and_not_joined() {
        let (cluster, igs) = fixture();
        let groups = vec![raw(
            "nodes.minimal.example.com",
            "nodes",
            "r",
            &[("i-1", "r"), ("i-2", "r"), ("i-3", "r")],
        )];
        let nodes = vec![
            NodeInfo {
                name: "node-1".into(),
                instance_id: Some("i-1".into()),
                ready: true,
                ..Default::default()
            },
            NodeInfo {
                name: "node-2".into(),
                instance_id: Some("i-2".into()),
                ready: true,
                annotations: BTreeMap::from([(ANNOTATION_NEEDS_UPDATE.to_string(), String::new())]),
                ..Default::default()
            },
        ];

        let matched =
            match_cloud_groups(ProviderId::Aws, &cluster, &igs, &groups, false, Some(&nodes));
        let group = &matched["nodes"];
        assert_eq!(group.ready.len(), 1);
        assert_eq!(group.ready[0].node.as_ref().map(|n| n.name.as_str()), Some("node-1"));
        assert_eq!(group.need_update[0].reasons, vec![UpdateReason::NodeAnnotated]);
        assert_eq!(group.need_update[0].status, CloudInstanceStatus::NeedsUpdate);
        assert_eq!(group.need_update[1].reasons, vec![UpdateReason::NotJoined]);
        assert_eq!(group.need_update[1].status, CloudInstanceStatus::NotJoined);
    }

    #[test]
    fn test_without_nodes_not_joined_is_skipped() {
        let (cluster, igs) = fixture();
        let groups = vec![raw("nodes.minimal.example.com", "nodes", "r", &[("i-1", "r")])];
        let matched = match_cloud_groups(ProviderId::Aws, &cluster, &igs, &groups, false, None);
        assert_eq!(matched["nodes"].ready.len(), 1);
    }

    #[test]
    fn test_first_match_wins_by_name() {
        let (cluster, igs) = fixture();
        let groups = vec![
            raw("z-nodes", "nodes", "r", &[("i-9", "r")]),
            raw("a-nodes", "nodes", "r", &[("i-1", "r")]),
        ];
        let matched = match_cloud_groups(ProviderId::Aws, &cluster, &igs, &groups, true, None);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched["nodes"].human_name, "a-nodes");
    }

    #[test]
    fn test_ignores_other_clusters_and_unmatched() {
        let (cluster, igs) = fixture();
        let mut foreign = raw("nodes.other.example.com", "nodes", "r", &[]);
        foreign.tags.insert(TAG_CLUSTER.into(), "other.example.com".into());
        let groups = vec![foreign, raw("extra.minimal.example.com", "extra", "r", &[])];

        let matched = match_cloud_groups(ProviderId::Aws, &cluster, &igs, &groups, true, None);
        assert!(matched.is_empty());
    }

    #[test]
    fn test_gce_labels_are_dashed() {
        let tagging = GroupTagging::for_provider(ProviderId::Gce);
        let tags = tagging.group_tags("minimal.example.com", "nodes");
        assert_eq!(tags["k8s-io-cluster-name"], "minimal-example-com");

        let cluster = Cluster::new("minimal.example.com");
        let igs = vec![InstanceGroup::new("nodes", InstanceGroupRole::Node)];
        let group = RawCloudGroup {
            id: "mig-1".into(),
            name: "a-nodes-minimal-example-com".into(),
            tags,
            ..Default::default()
        };
        let matched = match_cloud_groups(ProviderId::Gce, &cluster, &igs, &[group], true, None);
        assert!(matched.contains_key("nodes"));
    }

    #[test]
    fn test_detached_instances_need_update() {
        let (cluster, igs) = fixture();
        let mut group = raw("nodes.minimal.example.com", "nodes", "r", &[("i-1", "r"), ("i-2", "r")]);
        group.instances[0].detached = true;
        let matched = match_cloud_groups(ProviderId::Aws, &cluster, &igs, &[group], false, None);
        let nodes = &matched["nodes"];
        assert_eq!(nodes.need_update[0].status, CloudInstanceStatus::Detached);
        assert_eq!(nodes.current_size(), 1);
    }
}
