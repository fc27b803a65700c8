//! Shared fixtures for the rollout tests

use crate::fake::FakeKube;
use crate::k8s::{KubeClient, Node};
use kopsflow_cloud::{Cloud, CloudInstanceGroup, MockCloud, NodeInfo};
use kopsflow_core::{Cluster, ClusterSubnetSpec, InstanceGroup, InstanceGroupRole, ProviderId};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CLUSTER: &str = "minimal.example.com";

pub struct World {
    pub cluster: Cluster,
    pub instance_groups: Vec<InstanceGroup>,
    pub cloud: Arc<MockCloud>,
    /// Cloud group id by instance group name
    pub group_ids: BTreeMap<String, String>,
}

impl World {
    /// A FakeKube whose nodes follow this world's instances
    pub fn kube(&self) -> FakeKube {
        FakeKube::new()
            .joined_to(self.cloud.clone(), &self.cluster, &self.instance_groups)
            .with_system_pods(&self.cluster)
    }

    pub fn group_id(&self, ig: &str) -> &str {
        self.group_ids.get(ig).map(String::as_str).unwrap_or_default()
    }

    pub async fn groups(&self, kube: Option<&dyn KubeClient>) -> BTreeMap<String, CloudInstanceGroup> {
        let nodes: Option<Vec<NodeInfo>> = match kube {
            Some(kube) => Some(kube.list_nodes().await.unwrap().iter().map(Node::info).collect()),
            None => None,
        };
        self.cloud
            .get_cloud_groups(&self.cluster, &self.instance_groups, false, nodes.as_deref())
            .await
            .unwrap()
    }
}

pub fn cluster() -> Cluster {
    let mut cluster = Cluster::new(CLUSTER);
    cluster.spec.cloud_provider = Some(ProviderId::Aws);
    cluster.spec.kubernetes_version = Some("1.31.4".into());
    cluster.spec.subnets.push(ClusterSubnetSpec {
        name: "us-test-1a".into(),
        zone: "us-test-1a".into(),
        ..Default::default()
    });
    cluster
}

pub fn instance_group(name: &str, role: InstanceGroupRole, min: i32, max: i32) -> InstanceGroup {
    let mut ig = InstanceGroup::new(name, role);
    ig.spec.subnets = vec!["us-test-1a".into()];
    ig.spec.min_size = Some(min);
    ig.spec.max_size = Some(max);
    ig
}

/// Seed a cloud with the given groups, each at its minimum size
pub async fn world(instance_groups: Vec<InstanceGroup>) -> World {
    let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
    let mut group_ids = BTreeMap::new();
    for ig in &instance_groups {
        let id = cloud
            .seed_group(CLUSTER, ig, ig.min_size() as usize)
            .await
            .unwrap();
        group_ids.insert(ig.name().to_string(), id);
    }
    World {
        cluster: cluster(),
        instance_groups,
        cloud,
        group_ids,
    }
}

/// `control_planes` masters at full size and `nodes` workers with room for
/// one more
pub async fn seeded(control_planes: i32, nodes: i32) -> World {
    world(vec![
        instance_group(
            "master-us-test-1a",
            InstanceGroupRole::ControlPlane,
            control_planes,
            control_planes,
        ),
        instance_group("nodes", InstanceGroupRole::Node, nodes, nodes + 1),
    ])
    .await
}
