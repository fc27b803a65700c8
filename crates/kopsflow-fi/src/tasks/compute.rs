//! Launch templates and autoscaling groups

use super::{cloud, types};
use crate::changes::Changes;
use crate::context::Context;
use crate::error::{FiError, Result};
use crate::target::cloudformation::{self, CloudFormationTarget};
use crate::target::terraform::{HclValue, TerraformTarget};
use crate::task::{Task, TaskRef};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kopsflow_cloud::kinds;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

const ROOT_DEVICE: &str = "/dev/xvda";
const ROOT_VOLUME_TYPE: &str = "gp3";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplate {
    pub name: String,
    pub image_id: String,
    pub machine_type: String,
    pub root_volume_size: Option<i64>,
    pub security_groups: Vec<TaskRef>,
    /// Ids of pre-existing groups attached as well
    pub additional_security_groups: Vec<String>,
    pub ssh_key: Option<TaskRef>,
    pub associate_public_ip: Option<bool>,
    /// Bootstrap script, stored verbatim
    pub user_data: String,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for LaunchTemplate {
    crate::task_identity!(types::LAUNCH_TEMPLATE);

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::LAUNCH_TEMPLATE, &self.name, None).await
    }

    fn check_changes(&self, actual: Option<&Value>, changes: &Changes) -> Result<()> {
        let Some(change) = changes.get("rootVolumeSize") else {
            return Ok(());
        };
        let before = actual
            .and_then(|a| a.get("rootVolumeSize"))
            .and_then(Value::as_i64);
        let after = change.expected.as_i64();
        if let (Some(before), Some(after)) = (before, after)
            && after < before
        {
            return Err(FiError::InvalidChange {
                key: self.key(),
                message: format!("root volume cannot shrink from {before}GB to {after}GB"),
            });
        }
        Ok(())
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::LAUNCH_TEMPLATE, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let mut security_groups = self
            .security_groups
            .iter()
            .map(|sg| tf.link(sg, "id"))
            .collect::<Result<Vec<_>>>()?;
        security_groups.extend(self.additional_security_groups.iter().map(HclValue::str));

        let mut ebs = BTreeMap::from([
            ("delete_on_termination".to_string(), HclValue::Bool(true)),
            ("encrypted".to_string(), HclValue::Bool(true)),
            ("volume_type".to_string(), HclValue::str(ROOT_VOLUME_TYPE)),
        ]);
        if let Some(size) = self.root_volume_size {
            ebs.insert("volume_size".into(), HclValue::Int(size));
        }
        let block_device = BTreeMap::from([
            ("device_name".to_string(), HclValue::str(ROOT_DEVICE)),
            ("ebs".to_string(), HclValue::Blocks(vec![ebs])),
        ]);

        let network_interface = BTreeMap::from([
            (
                "associate_public_ip_address".to_string(),
                HclValue::Bool(self.associate_public_ip.unwrap_or(true)),
            ),
            ("delete_on_termination".to_string(), HclValue::Bool(true)),
            ("security_groups".to_string(), HclValue::List(security_groups)),
        ]);

        let tag_specifications = ["instance", "volume"]
            .iter()
            .map(|resource_type| {
                BTreeMap::from([
                    ("resource_type".to_string(), HclValue::str(*resource_type)),
                    ("tags".to_string(), HclValue::tags(&self.tags)),
                ])
            })
            .collect();

        let mut attrs = BTreeMap::from([
            ("name".to_string(), HclValue::str(&self.name)),
            ("image_id".to_string(), HclValue::str(&self.image_id)),
            ("instance_type".to_string(), HclValue::str(&self.machine_type)),
            ("block_device_mappings".to_string(), HclValue::Blocks(vec![block_device])),
            ("network_interfaces".to_string(), HclValue::Blocks(vec![network_interface])),
            ("tag_specifications".to_string(), HclValue::Blocks(tag_specifications)),
            ("tags".to_string(), HclValue::tags(&self.tags)),
            (
                "user_data".to_string(),
                tf.add_data_file("aws_launch_template", &self.name, "user_data", &self.user_data),
            ),
        ]);
        if let Some(key) = &self.ssh_key {
            attrs.insert("key_name".into(), tf.link(key, "id")?);
        }
        tf.add_resource("aws_launch_template", &self.name, attrs);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        let mut security_groups = self
            .security_groups
            .iter()
            .map(|sg| cf.link(sg))
            .collect::<Result<Vec<_>>>()?;
        security_groups.extend(self.additional_security_groups.iter().map(|id| json!(id)));
        let mut data = json!({
            "ImageId": self.image_id,
            "InstanceType": self.machine_type,
            "UserData": BASE64.encode(&self.user_data),
            "NetworkInterfaces": [{
                "AssociatePublicIpAddress": self.associate_public_ip.unwrap_or(true),
                "DeleteOnTermination": true,
                "DeviceIndex": 0,
                "Groups": security_groups,
            }],
            "BlockDeviceMappings": [{
                "DeviceName": ROOT_DEVICE,
                "Ebs": {
                    "DeleteOnTermination": true,
                    "Encrypted": true,
                    "VolumeType": ROOT_VOLUME_TYPE,
                    "VolumeSize": self.root_volume_size,
                },
            }],
            "TagSpecifications": [
                {"ResourceType": "instance", "Tags": cloudformation::tag_list(&self.tags)},
                {"ResourceType": "volume", "Tags": cloudformation::tag_list(&self.tags)},
            ],
        });
        if let Some(key) = &self.ssh_key {
            data["KeyName"] = cf.link(key)?;
        }
        cf.add_resource(
            "AWS::EC2::LaunchTemplate",
            &self.name,
            json!({"LaunchTemplateName": self.name, "LaunchTemplateData": data}),
        );
        Ok(Value::Null)
    }
}

/// Spot/on-demand split across several instance types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MixedInstancesPolicy {
    pub instance_types: Vec<String>,
    pub on_demand_base: Option<i64>,
    pub on_demand_above_base: Option<i64>,
    pub spot_allocation_strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingGroup {
    pub name: String,
    pub launch_template: TaskRef,
    pub min_size: i64,
    pub max_size: i64,
    pub subnets: Vec<TaskRef>,
    pub mixed_instances_policy: Option<MixedInstancesPolicy>,
    /// Propagated to instances at launch
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for AutoscalingGroup {
    crate::task_identity!(types::AUTOSCALING_GROUP);

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::AUTOSCALING_GROUP, &self.name, None).await
    }

    fn check_changes(&self, _actual: Option<&Value>, _changes: &Changes) -> Result<()> {
        if self.min_size > self.max_size {
            return Err(FiError::InvalidChange {
                key: self.key(),
                message: format!("minSize {} exceeds maxSize {}", self.min_size, self.max_size),
            });
        }
        Ok(())
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::AUTOSCALING_GROUP, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let subnets = self
            .subnets
            .iter()
            .map(|s| tf.link(s, "id"))
            .collect::<Result<Vec<_>>>()?;
        let launch_template = BTreeMap::from([
            ("id".to_string(), tf.link(&self.launch_template, "id")?),
            ("version".to_string(), tf.link(&self.launch_template, "latest_version")?),
        ]);
        let tags = self
            .tags
            .iter()
            .map(|(k, v)| {
                BTreeMap::from([
                    ("key".to_string(), HclValue::str(k)),
                    ("propagate_at_launch".to_string(), HclValue::Bool(true)),
                    ("value".to_string(), HclValue::str(v)),
                ])
            })
            .collect();

        let mut attrs = BTreeMap::from([
            ("name".to_string(), HclValue::str(&self.name)),
            ("min_size".to_string(), HclValue::Int(self.min_size)),
            ("max_size".to_string(), HclValue::Int(self.max_size)),
            ("vpc_zone_identifier".to_string(), HclValue::List(subnets)),
            ("tag".to_string(), HclValue::Blocks(tags)),
        ]);

        match &self.mixed_instances_policy {
            None => {
                attrs.insert("launch_template".into(), HclValue::Blocks(vec![launch_template]));
            }
            Some(policy) => {
                let mut distribution = BTreeMap::new();
                if let Some(base) = policy.on_demand_base {
                    distribution.insert("on_demand_base_capacity".to_string(), HclValue::Int(base));
                }
                if let Some(above) = policy.on_demand_above_base {
                    distribution.insert(
                        "on_demand_percentage_above_base_capacity".to_string(),
                        HclValue::Int(above),
                    );
                }
                if let Some(strategy) = &policy.spot_allocation_strategy {
                    distribution.insert("spot_allocation_strategy".to_string(), HclValue::str(strategy));
                }
                let overrides = policy
                    .instance_types
                    .iter()
                    .map(|t| BTreeMap::from([("instance_type".to_string(), HclValue::str(t))]))
                    .collect();
                let spec = BTreeMap::from([(
                    "launch_template_specification".to_string(),
                    HclValue::Blocks(vec![BTreeMap::from([
                        (
                            "launch_template_id".to_string(),
                            tf.link(&self.launch_template, "id")?,
                        ),
                        (
                            "version".to_string(),
                            tf.link(&self.launch_template, "latest_version")?,
                        ),
                    ])]),
                )]);
                let mut template = spec;
                template.insert("override".into(), HclValue::Blocks(overrides));
                let policy = BTreeMap::from([
                    ("instances_distribution".to_string(), HclValue::Blocks(vec![distribution])),
                    ("launch_template".to_string(), HclValue::Blocks(vec![template])),
                ]);
                attrs.insert("mixed_instances_policy".into(), HclValue::Blocks(vec![policy]));
            }
        }

        tf.add_resource("aws_autoscaling_group", &self.name, attrs);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        let subnets = self
            .subnets
            .iter()
            .map(|s| cf.link(s))
            .collect::<Result<Vec<_>>>()?;
        let template = json!({
            "LaunchTemplateId": cf.link(&self.launch_template)?,
            "Version": cf.get_att(&self.launch_template, "LatestVersionNumber")?,
        });
        let tags: Vec<Value> = self
            .tags
            .iter()
            .map(|(k, v)| json!({"Key": k, "Value": v, "PropagateAtLaunch": true}))
            .collect();

        let mut properties = json!({
            "AutoScalingGroupName": self.name,
            "MinSize": self.min_size.to_string(),
            "MaxSize": self.max_size.to_string(),
            "VPCZoneIdentifier": subnets,
            "Tags": tags,
        });
        match &self.mixed_instances_policy {
            None => properties["LaunchTemplate"] = template,
            Some(policy) => {
                let overrides: Vec<Value> = policy
                    .instance_types
                    .iter()
                    .map(|t| json!({"InstanceType": t}))
                    .collect();
                properties["MixedInstancesPolicy"] = json!({
                    "InstancesDistribution": {
                        "OnDemandBaseCapacity": policy.on_demand_base,
                        "OnDemandPercentageAboveBaseCapacity": policy.on_demand_above_base,
                        "SpotAllocationStrategy": policy.spot_allocation_strategy,
                    },
                    "LaunchTemplate": {
                        "LaunchTemplateSpecification": template,
                        "Overrides": overrides,
                    },
                });
            }
        }
        cf.add_resource("AWS::AutoScaling::AutoScalingGroup", &self.name, properties);
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::executor::Executor;
    use crate::target::Target;
    use crate::taskmap::TaskMap;
    use kopsflow_cloud::{Cloud, CloudInstanceStatus, MockCloud};
    use kopsflow_core::{Cluster, InstanceGroup, InstanceGroupRole, ProviderId};
    use kopsflow_pki::EphemeralKeystore;
    use std::sync::Arc;

    const CLUSTER: &str = "minimal.example.com";

    fn context(cloud: &Arc<MockCloud>) -> Arc<Context> {
        let cloud: Arc<dyn Cloud> = cloud.clone();
        Arc::new(
            Context::new(CLUSTER, Target::Direct, Arc::new(EphemeralKeystore::new())).with_cloud(cloud),
        )
    }

    fn nodes_group(user_data: &str, root_volume: i64) -> TaskMap {
        let mut map = TaskMap::new();
        let lt = map
            .add(LaunchTemplate {
                name: format!("nodes.{CLUSTER}"),
                image_id: "ami-12345678".into(),
                machine_type: "t3.medium".into(),
                root_volume_size: Some(root_volume),
                security_groups: vec![],
                additional_security_groups: vec![],
                ssh_key: None,
                associate_public_ip: None,
                user_data: user_data.into(),
                tags: BTreeMap::new(),
            })
            .unwrap();
        let tags = kopsflow_cloud::GroupTagging::for_provider(ProviderId::Aws).group_tags(CLUSTER, "nodes");
        map.add(AutoscalingGroup {
            name: format!("nodes.{CLUSTER}"),
            launch_template: lt,
            min_size: 2,
            max_size: 2,
            subnets: vec![],
            mixed_instances_policy: None,
            tags,
        })
        .unwrap();
        map
    }

    fn nodes_ig() -> InstanceGroup {
        let mut ig = InstanceGroup::new("nodes", InstanceGroupRole::Node);
        ig.spec.min_size = Some(2);
        ig.spec.max_size = Some(2);
        ig
    }

    #[tokio::test]
    async fn test_user_data_change_marks_members_for_update() {
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        let report = Executor::new()
            .run(&nodes_group("#!/bin/bash\necho v1\n", 64), context(&cloud))
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.failed);

        let groups = cloud
            .get_cloud_groups(&Cluster::new(CLUSTER), &[nodes_ig()], true, None)
            .await
            .unwrap();
        assert_eq!(groups["nodes"].ready.len(), 2);
        assert!(groups["nodes"].need_update.is_empty());

        let report = Executor::new()
            .run(&nodes_group("#!/bin/bash\necho v2\n", 64), context(&cloud))
            .await
            .unwrap();
        assert_eq!(report.actions_by_type(ActionType::Update).len(), 1);

        let groups = cloud
            .get_cloud_groups(&Cluster::new(CLUSTER), &[nodes_ig()], true, None)
            .await
            .unwrap();
        let group = &groups["nodes"];
        assert_eq!(group.need_update.len(), 2);
        assert!(
            group
                .need_update
                .iter()
                .all(|i| i.status == CloudInstanceStatus::NeedsUpdate)
        );
    }

    #[tokio::test]
    async fn test_root_volume_cannot_shrink() {
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        Executor::new()
            .run(&nodes_group("#!/bin/bash\n", 64), context(&cloud))
            .await
            .unwrap();

        let report = Executor::new()
            .run(&nodes_group("#!/bin/bash\n", 32), context(&cloud))
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("cannot shrink"));
        assert_eq!(report.skipped, vec![format!("AutoscalingGroup/nodes.{CLUSTER}")]);
    }

    #[test]
    fn test_terraform_user_data_goes_to_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let tf = TerraformTarget::new(CLUSTER, "us-test-1", dir.path());
        let ctx = Context::new(CLUSTER, Target::DryRun, Arc::new(EphemeralKeystore::new()));
        let map = nodes_group("#!/bin/bash\n", 64);
        for (_, entry) in map.iter() {
            match entry.task.key().type_name.as_str() {
                types::LAUNCH_TEMPLATE | types::AUTOSCALING_GROUP => {
                    entry.task.render_terraform(&ctx, &tf).unwrap();
                }
                _ => {}
            }
        }
        let rendered = tf.render();
        assert!(rendered.contains(
            "user_data     = filebase64(\"${path.module}/data/aws_launch_template_nodes.minimal.example.com_user_data\")"
        ));
        assert!(rendered.contains("id      = aws_launch_template.nodes-minimal-example-com.id"));
        assert!(rendered.contains("version = aws_launch_template.nodes-minimal-example-com.latest_version"));
    }
}
