//! Security groups, their rules and the admin SSH key

use super::{cloud, types};
use crate::changes::Changes;
use crate::context::Context;
use crate::error::Result;
use crate::target::cloudformation::{self, CloudFormationTarget};
use crate::target::terraform::{HclValue, TerraformTarget};
use crate::task::{FieldPolicy, Task, TaskRef};
use async_trait::async_trait;
use kopsflow_cloud::kinds;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    pub name: String,
    pub vpc: TaskRef,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for SecurityGroup {
    crate::task_identity!(types::SECURITY_GROUP);

    fn field_policy(&self, field: &str) -> FieldPolicy {
        match field {
            // Not updatable in EC2; a mismatch is not worth a replacement.
            "description" => FieldPolicy::NotManaged,
            "vpc" => FieldPolicy::Immutable,
            _ => FieldPolicy::Reconcile,
        }
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::SECURITY_GROUP, &self.name, None).await
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::SECURITY_GROUP, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let mut attrs = BTreeMap::from([
            ("name".to_string(), HclValue::str(&self.name)),
            ("vpc_id".to_string(), tf.link(&self.vpc, "id")?),
            ("tags".to_string(), HclValue::tags(&self.tags)),
        ]);
        if let Some(description) = &self.description {
            attrs.insert("description".into(), HclValue::str(description));
        }
        tf.add_resource("aws_security_group", &self.name, attrs);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        cf.add_resource(
            "AWS::EC2::SecurityGroup",
            &self.name,
            json!({
                "GroupName": self.name,
                "VpcId": cf.link(&self.vpc)?,
                "GroupDescription": self.description.clone().unwrap_or_else(|| self.name.clone()),
                "Tags": cloudformation::tag_list(&self.tags),
            }),
        );
        Ok(Value::Null)
    }
}

/// One ingress or egress rule. Rules cannot be edited in place.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupRule {
    pub name: String,
    pub security_group: TaskRef,
    pub source_group: Option<TaskRef>,
    pub cidr: Option<String>,
    /// `tcp`, `udp`, `icmp` or `-1` for all
    pub protocol: String,
    pub from_port: Option<i64>,
    pub to_port: Option<i64>,
    pub egress: bool,
}

#[async_trait]
impl Task for SecurityGroupRule {
    crate::task_identity!(types::SECURITY_GROUP_RULE);

    fn field_policy(&self, _field: &str) -> FieldPolicy {
        FieldPolicy::Immutable
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::SECURITY_GROUP_RULE, &self.name, None).await
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::SECURITY_GROUP_RULE, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let rule_type = if self.egress { "egress" } else { "ingress" };
        let mut attrs = BTreeMap::from([
            ("type".to_string(), HclValue::str(rule_type)),
            ("security_group_id".to_string(), tf.link(&self.security_group, "id")?),
            ("protocol".to_string(), HclValue::str(&self.protocol)),
            ("from_port".to_string(), HclValue::Int(self.from_port.unwrap_or(0))),
            ("to_port".to_string(), HclValue::Int(self.to_port.unwrap_or(0))),
        ]);
        if let Some(source) = &self.source_group {
            attrs.insert("source_security_group_id".into(), tf.link(source, "id")?);
        }
        if let Some(cidr) = &self.cidr {
            attrs.insert("cidr_blocks".into(), HclValue::List(vec![HclValue::str(cidr)]));
        }
        tf.add_resource("aws_security_group_rule", &self.name, attrs);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        let resource_type = if self.egress {
            "AWS::EC2::SecurityGroupEgress"
        } else {
            "AWS::EC2::SecurityGroupIngress"
        };
        let mut properties = json!({
            "GroupId": cf.link(&self.security_group)?,
            "IpProtocol": self.protocol,
            "FromPort": self.from_port.unwrap_or(0),
            "ToPort": self.to_port.unwrap_or(0),
        });
        if let Some(source) = &self.source_group {
            let field = if self.egress { "DestinationSecurityGroupId" } else { "SourceSecurityGroupId" };
            properties[field] = cf.link(source)?;
        }
        if let Some(cidr) = &self.cidr {
            properties["CidrIp"] = json!(cidr);
        }
        cf.add_resource(resource_type, &self.name, properties);
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKey {
    pub name: String,
    pub public_key: String,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for SshKey {
    crate::task_identity!(types::SSH_KEY);

    fn field_policy(&self, field: &str) -> FieldPolicy {
        match field {
            "publicKey" => FieldPolicy::Immutable,
            _ => FieldPolicy::Reconcile,
        }
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::SSH_KEY, &self.name, None).await
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::SSH_KEY, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let attrs = BTreeMap::from([
            ("key_name".to_string(), HclValue::str(&self.name)),
            ("public_key".to_string(), HclValue::str(self.public_key.trim())),
            ("tags".to_string(), HclValue::tags(&self.tags)),
        ]);
        tf.add_resource("aws_key_pair", &self.name, attrs);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        cf.add_resource(
            "AWS::EC2::KeyPair",
            &self.name,
            json!({
                "KeyName": self.name,
                "PublicKeyMaterial": self.public_key.trim(),
                "Tags": cloudformation::tag_list(&self.tags),
            }),
        );
        Ok(Value::Null)
    }
}
