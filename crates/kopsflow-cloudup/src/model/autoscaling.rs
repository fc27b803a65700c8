//! Launch templates and autoscaling groups, one pair per instance group

use super::{ModelBuilder, ModelContext};
use crate::error::{CloudupError, Result};
use crate::phase::Phase;
use kopsflow_cloud::GroupTagging;
use kopsflow_core::{InstanceGroup, InstanceGroupRole, TopologyKind};
use kopsflow_fi::tasks::{AutoscalingGroup, LaunchTemplate, MixedInstancesPolicy, types};
use kopsflow_fi::{TaskMap, TaskRef};
use std::collections::BTreeMap;

pub struct AutoscalingModelBuilder;

fn role_tag(role: InstanceGroupRole) -> &'static str {
    match role {
        InstanceGroupRole::ControlPlane => "k8s.io/role/control-plane",
        InstanceGroupRole::ApiServer => "k8s.io/role/api-server",
        InstanceGroupRole::Node => "k8s.io/role/node",
        InstanceGroupRole::Bastion => "k8s.io/role/bastion",
    }
}

impl AutoscalingModelBuilder {
    fn tags(ctx: &ModelContext<'_>, ig: &InstanceGroup, name: &str) -> BTreeMap<String, String> {
        let mut tags = ctx.owned_tags(name);
        tags.extend(ig.spec.cloud_labels.clone());
        tags.extend(GroupTagging::for_provider(ctx.provider).group_tags(ctx.cluster_name(), ig.name()));
        tags.insert(role_tag(ig.role()).to_string(), "1".to_string());
        tags
    }

    fn associate_public_ip(ctx: &ModelContext<'_>, ig: &InstanceGroup) -> bool {
        if let Some(explicit) = ig.spec.associate_public_ip {
            return explicit;
        }
        let topology = ctx.cluster.spec.topology.clone().unwrap_or_default();
        match ig.role() {
            InstanceGroupRole::Bastion => true,
            InstanceGroupRole::ControlPlane | InstanceGroupRole::ApiServer => {
                topology.control_plane == TopologyKind::Public
            }
            InstanceGroupRole::Node => topology.nodes == TopologyKind::Public,
        }
    }

    fn build_group(&self, ctx: &ModelContext<'_>, ig: &InstanceGroup, tasks: &mut TaskMap) -> Result<()> {
        let name = ig.cloud_name(ctx.cluster_name());
        let incomplete =
            |field: &str| CloudupError::IncompleteCluster(format!("instance group {} has no {}", ig.name(), field));
        let image_id = ig.spec.image.clone().ok_or_else(|| incomplete("image"))?;
        let machine_type = ig.spec.machine_type.clone().ok_or_else(|| incomplete("machineType"))?;
        let user_data = ctx
            .bootstrap
            .get(ig.name())
            .map(|b| b.user_data.clone())
            .ok_or_else(|| incomplete("bootstrap script"))?;
        let tags = Self::tags(ctx, ig, &name);

        let launch_template = tasks.add(LaunchTemplate {
            name: name.clone(),
            image_id,
            machine_type,
            root_volume_size: ig.spec.root_volume_size.map(i64::from),
            security_groups: vec![ctx.security_group(ig.role())],
            additional_security_groups: ig.spec.additional_security_groups.clone(),
            ssh_key: ctx.ssh_key_name().map(|key| TaskRef::new(types::SSH_KEY, key)),
            associate_public_ip: Some(Self::associate_public_ip(ctx, ig)),
            user_data,
            tags: tags.clone(),
        })?;

        let subnets = ig.spec.subnets.iter().map(|s| ctx.subnet(s)).collect();
        let mixed_instances_policy = ig.spec.mixed_instances_policy.as_ref().map(|p| MixedInstancesPolicy {
            instance_types: p.instances.clone(),
            on_demand_base: p.on_demand_base,
            on_demand_above_base: p.on_demand_above_base,
            spot_allocation_strategy: p.spot_allocation_strategy.clone(),
        });

        tasks.add(AutoscalingGroup {
            name,
            launch_template,
            min_size: i64::from(ig.min_size()),
            max_size: i64::from(ig.max_size()),
            subnets,
            mixed_instances_policy,
            tags,
        })?;
        Ok(())
    }
}

impl ModelBuilder for AutoscalingModelBuilder {
    fn name(&self) -> &'static str {
        "autoscaling"
    }

    fn phase(&self) -> Phase {
        Phase::Cluster
    }

    fn build(&self, ctx: &ModelContext<'_>, tasks: &mut TaskMap) -> Result<()> {
        for ig in ctx.instance_groups {
            self.build_group(ctx, ig, tasks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::Fixture;
    use kopsflow_fi::TaskKey;

    #[test]
    fn test_group_per_instance_group() {
        let fixture = Fixture::minimal();
        let mut tasks = TaskMap::new();
        AutoscalingModelBuilder.build(&fixture.context(), &mut tasks).unwrap();
        assert_eq!(tasks.len(), 4);

        let nodes = tasks
            .get(&TaskKey::new(types::AUTOSCALING_GROUP, "nodes.minimal.example.com"))
            .unwrap();
        assert_eq!(nodes.inputs["tags"]["kops.k8s.io/instancegroup"], "nodes");
        assert_eq!(nodes.inputs["tags"]["k8s.io/role/node"], "1");
        assert!(nodes.dependencies.contains(&TaskKey::new(
            types::SUBNET,
            "us-test-1a.minimal.example.com"
        )));

        let template = tasks
            .get(&TaskKey::new(
                types::LAUNCH_TEMPLATE,
                "master-us-test-1a.masters.minimal.example.com",
            ))
            .unwrap();
        assert!(template.dependencies.contains(&TaskKey::new(
            types::SECURITY_GROUP,
            "masters.minimal.example.com"
        )));
        assert!(template.inputs["userData"].as_str().unwrap().starts_with("#!/bin/bash"));
        assert_eq!(template.inputs["associatePublicIp"], true);
    }

    #[test]
    fn test_missing_image_is_reported() {
        let mut fixture = Fixture::minimal();
        fixture.instance_groups[1].spec.image = None;
        let mut tasks = TaskMap::new();
        let err = AutoscalingModelBuilder
            .build(&fixture.context(), &mut tasks)
            .unwrap_err();
        assert!(err.to_string().contains("nodes has no image"));
    }
}
