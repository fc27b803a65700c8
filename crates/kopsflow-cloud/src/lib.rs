//! kopsflow cloud abstraction
//!
//! The task executor, the rolling updater and `delete cluster` talk to the
//! cloud through the [`Cloud`] trait only.
//!
//! ```text
//!   kopsflow-fi (direct target) ──┐
//!   kopsflow-rollout ─────────────┼──► dyn Cloud ──► { MockCloud | provider bindings }
//!   kops delete cluster ──────────┘        │
//!                                          └──► match_cloud_groups (tag matching,
//!                                               NeedUpdate classification)
//! ```
//!
//! Provider SDK bindings are supplied by the embedding binary. The built-in
//! [`MockCloud`] simulates any provider and can persist its state to a file
//! named by `KOPS_MOCK_CLOUD_STATE`.

pub mod error;
pub mod groups;
pub mod mock;
pub mod provider;
pub mod resources;
pub mod state;

use kopsflow_core::Cluster;
use std::sync::Arc;

pub use error::{CloudError, Result};
pub use groups::{
    CloudInstance, CloudInstanceGroup, CloudInstanceStatus, GroupTagging, NodeInfo,
    RawCloudGroup, RawInstance, TAG_CLUSTER, TAG_CLUSTER_OWNERSHIP_PREFIX, TAG_INSTANCE_GROUP,
    UpdateReason, match_cloud_groups,
};
pub use mock::MockCloud;
pub use provider::{ApiIngressStatus, Cloud, ResourceApi, RetryConfig, SubnetInfo, VpcInfo};
pub use resources::{
    CloudResource, DeletionReport, ResourceSpec, ResourceTracker, delete_resources, kinds,
};
pub use state::{MockState, StateFile};

/// Path of the simulator state file
pub const MOCK_CLOUD_STATE_ENV: &str = "KOPS_MOCK_CLOUD_STATE";

/// Region a cluster runs in, from its first subnet's zone
pub fn cluster_region(cluster: &Cluster) -> Result<String> {
    let provider = cluster
        .spec
        .cloud_provider
        .ok_or_else(|| CloudError::InvalidConfig("cluster has no cloud provider".into()))?;
    cluster
        .spec
        .subnets
        .iter()
        .map(|s| s.zone.as_str())
        .find(|z| !z.is_empty())
        .map(|zone| provider.region_of_zone(zone))
        .ok_or_else(|| CloudError::InvalidConfig("cluster has no subnet with a zone".into()))
}

/// Build the cloud for a cluster
pub async fn build_cloud(cluster: &Cluster) -> Result<Arc<dyn Cloud>> {
    let provider = cluster
        .spec
        .cloud_provider
        .ok_or_else(|| CloudError::InvalidConfig("cluster has no cloud provider".into()))?;
    let region = cluster_region(cluster)?;

    match std::env::var(MOCK_CLOUD_STATE_ENV) {
        Ok(path) if !path.is_empty() => {
            let cloud = MockCloud::open(provider, region, path).await?;
            Ok(Arc::new(cloud))
        }
        _ => Err(CloudError::ProviderNotSupported(format!(
            "no API bindings for {provider} in this build; set {MOCK_CLOUD_STATE_ENV} to use the simulator"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kopsflow_core::{ClusterSubnetSpec, ProviderId};

    #[test]
    fn test_cluster_region() {
        let mut cluster = Cluster::new("minimal.example.com");
        assert!(cluster_region(&cluster).is_err());

        cluster.spec.cloud_provider = Some(ProviderId::Aws);
        cluster.spec.subnets.push(ClusterSubnetSpec {
            name: "us-test-1a".into(),
            zone: "us-test-1a".into(),
            ..Default::default()
        });
        assert_eq!(cluster_region(&cluster).unwrap(), "us-test-1");
    }
}
