//! Model builders
//!
//! Each builder turns the completed cluster into tasks for one phase. The
//! apply command runs every builder into its own task map and merges the
//! maps, keeping builders of earlier phases as references when a phase
//! filter is set.

mod autoscaling;
mod config;
mod firewall;
mod network;
mod pki;
mod sshkey;

pub use autoscaling::AutoscalingModelBuilder;
pub use config::ConfigModelBuilder;
pub use firewall::FirewallModelBuilder;
pub use network::NetworkModelBuilder;
pub use pki::{LEAF_KEYPAIRS, PkiModelBuilder};
pub use sshkey::SshKeyModelBuilder;

use crate::assets::AssetList;
use crate::bootstrap::BootstrapScript;
use crate::error::Result;
use crate::phase::{Inclusion, Phase, inclusion};
use kopsflow_cloud::TAG_CLUSTER_OWNERSHIP_PREFIX;
use kopsflow_cloud::TAG_CLUSTER;
use kopsflow_core::{Cluster, InstanceGroup, InstanceGroupRole, ProviderId};
use kopsflow_fi::tasks::types;
use kopsflow_fi::{TaskMap, TaskRef};
use std::collections::BTreeMap;

/// Everything a builder may read
pub struct ModelContext<'a> {
    pub cluster: &'a Cluster,
    pub instance_groups: &'a [InstanceGroup],
    pub assets: &'a AssetList,
    /// Keyed by instance group name
    pub bootstrap: &'a BTreeMap<String, BootstrapScript>,
    pub ssh_public_key: Option<&'a str>,
    pub provider: ProviderId,
    pub region: String,
}

impl ModelContext<'_> {
    pub fn cluster_name(&self) -> &str {
        self.cluster.name()
    }

    /// Tags every resource the cluster owns carries
    pub fn owned_tags(&self, name: &str) -> BTreeMap<String, String> {
        let mut tags = self.cluster.spec.cloud_labels.clone();
        tags.insert(TAG_CLUSTER.to_string(), self.cluster_name().to_string());
        tags.insert("Name".to_string(), name.to_string());
        tags.insert(self.ownership_key(), "owned".to_string());
        tags
    }

    /// Tags put on a pre-existing resource the cluster uses
    pub fn shared_tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.ownership_key(), "shared".to_string())])
    }

    fn ownership_key(&self) -> String {
        format!("{}{}", TAG_CLUSTER_OWNERSHIP_PREFIX, self.cluster_name())
    }

    pub fn vpc(&self) -> TaskRef {
        TaskRef::new(types::VPC, self.cluster_name())
    }

    pub fn subnet_task_name(&self, subnet: &str) -> String {
        format!("{}.{}", subnet, self.cluster_name())
    }

    pub fn subnet(&self, subnet: &str) -> TaskRef {
        TaskRef::new(types::SUBNET, self.subnet_task_name(subnet))
    }

    /// Security group name for machines of `role`
    pub fn security_group_name(&self, role: InstanceGroupRole) -> String {
        let prefix = match role {
            InstanceGroupRole::ControlPlane | InstanceGroupRole::ApiServer => "masters",
            InstanceGroupRole::Node => "nodes",
            InstanceGroupRole::Bastion => "bastion",
        };
        format!("{}.{}", prefix, self.cluster_name())
    }

    pub fn security_group(&self, role: InstanceGroupRole) -> TaskRef {
        TaskRef::new(types::SECURITY_GROUP, self.security_group_name(role))
    }

    pub fn has_role(&self, role: InstanceGroupRole) -> bool {
        self.instance_groups.iter().any(|ig| ig.role() == role)
    }

    /// Name of the SSH key the builders create, if any
    pub fn ssh_key_name(&self) -> Option<&str> {
        self.ssh_public_key?;
        self.cluster.spec.ssh_key_name.as_deref()
    }
}

/// A stage of the apply pipeline
pub trait ModelBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> Phase;

    fn build(&self, ctx: &ModelContext<'_>, tasks: &mut TaskMap) -> Result<()>;
}

/// Builders for an AWS-shaped cluster, in phase order
pub fn default_builders() -> Vec<Box<dyn ModelBuilder>> {
    vec![
        Box::new(NetworkModelBuilder),
        Box::new(SshKeyModelBuilder),
        Box::new(FirewallModelBuilder),
        Box::new(PkiModelBuilder),
        Box::new(ConfigModelBuilder),
        Box::new(AutoscalingModelBuilder),
    ]
}

/// Run `builders` and merge their tasks, honouring the phase filter
pub fn build_tasks(
    ctx: &ModelContext<'_>,
    builders: &[Box<dyn ModelBuilder>],
    filter: Option<Phase>,
) -> Result<TaskMap> {
    let mut merged = TaskMap::new();
    for builder in builders {
        let mode = inclusion(builder.phase(), filter);
        if mode == Inclusion::Skip {
            tracing::debug!("Skipping {} ({} phase)", builder.name(), builder.phase());
            continue;
        }
        let mut tasks = TaskMap::new();
        builder.build(ctx, &mut tasks)?;
        tracing::debug!("{} produced {} task(s)", builder.name(), tasks.len());
        if mode == Inclusion::Reference {
            tasks = tasks.into_references();
        }
        merged.merge(tasks)?;
    }
    Ok(merged)
}
