//! CloudFormation target: tasks add resources to one JSON template

use crate::error::{FiError, Result};
use crate::task::{TaskKey, TaskRef};
use crate::tasks::types;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

pub const TEMPLATE_FILE: &str = "kubernetes.json";

/// CloudFormation resource type for a task type
pub fn resource_type(task_type: &str) -> Option<&'static str> {
    Some(match task_type {
        types::VPC => "AWS::EC2::VPC",
        types::SUBNET => "AWS::EC2::Subnet",
        types::INTERNET_GATEWAY => "AWS::EC2::InternetGateway",
        types::ROUTE_TABLE => "AWS::EC2::RouteTable",
        types::SECURITY_GROUP => "AWS::EC2::SecurityGroup",
        types::SECURITY_GROUP_RULE => "AWS::EC2::SecurityGroupIngress",
        types::SSH_KEY => "AWS::EC2::KeyPair",
        types::LAUNCH_TEMPLATE => "AWS::EC2::LaunchTemplate",
        types::AUTOSCALING_GROUP => "AWS::AutoScaling::AutoScalingGroup",
        _ => return None,
    })
}

/// Logical id: the type and name with everything but letters and digits
/// dropped (`AWS::EC2::VPC` + `a.example.com` -> `AWSEC2VPCaexamplecom`)
pub fn logical_id(resource_type: &str, name: &str) -> String {
    resource_type
        .chars()
        .chain(name.chars())
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

#[derive(Default)]
struct Template {
    resources: BTreeMap<String, Value>,
    literals: HashMap<TaskKey, String>,
}

pub struct CloudFormationTarget {
    out_dir: PathBuf,
    template: Mutex<Template>,
}

impl CloudFormationTarget {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            template: Mutex::new(Template::default()),
        }
    }

    fn template(&self) -> std::sync::MutexGuard<'_, Template> {
        self.template.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a resource; returns a `Ref` to it
    pub fn add_resource(&self, resource_type: &str, name: &str, properties: Value) -> Value {
        let id = logical_id(resource_type, name);
        self.template().resources.insert(
            id.clone(),
            json!({"Type": resource_type, "Properties": properties}),
        );
        json!({"Ref": id})
    }

    pub fn register_literal(&self, key: TaskKey, id: impl Into<String>) {
        self.template().literals.insert(key, id.into());
    }

    /// `Ref` to the referenced task's resource, or its literal id when shared
    pub fn link(&self, r: &TaskRef) -> Result<Value> {
        if let Some(id) = self.template().literals.get(r.key()) {
            return Ok(Value::String(id.clone()));
        }
        let resource_type = self.resource_type_of(r)?;
        Ok(json!({"Ref": logical_id(resource_type, &r.key().name)}))
    }

    /// `Fn::GetAtt` on the referenced task's resource
    pub fn get_att(&self, r: &TaskRef, attribute: &str) -> Result<Value> {
        let resource_type = self.resource_type_of(r)?;
        Ok(json!({"Fn::GetAtt": [logical_id(resource_type, &r.key().name), attribute]}))
    }

    fn resource_type_of(&self, r: &TaskRef) -> Result<&'static str> {
        resource_type(&r.key().type_name).ok_or_else(|| FiError::UnsupportedTarget {
            key: r.key().clone(),
            target: "cloudformation".into(),
        })
    }

    pub fn render(&self) -> Result<String> {
        let resources: Map<String, Value> = self
            .template()
            .resources
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut rendered = serde_json::to_string_pretty(&json!({ "Resources": resources }))?;
        rendered.push('\n');
        Ok(rendered)
    }

    pub async fn finish(&self) -> Result<Vec<PathBuf>> {
        let rendered = self.render()?;
        fs::create_dir_all(&self.out_dir).await?;
        let path = self.out_dir.join(TEMPLATE_FILE);
        fs::write(&path, rendered).await?;
        tracing::info!("CloudFormation template written to {}", path.display());
        Ok(vec![path])
    }
}

/// CloudFormation `Tags` list from a tag map
pub fn tag_list(tags: &BTreeMap<String, String>) -> Value {
    Value::Array(
        tags.iter()
            .map(|(k, v)| json!({"Key": k, "Value": v}))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_id() {
        assert_eq!(
            logical_id("AWS::EC2::VPC", "minimal.example.com"),
            "AWSEC2VPCminimalexamplecom"
        );
    }

    #[test]
    fn test_link_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let cf = CloudFormationTarget::new(dir.path());
        cf.add_resource("AWS::EC2::VPC", "a.example.com", json!({"CidrBlock": "10.0.0.0/16"}));

        let vpc = TaskRef::new(types::VPC, "a.example.com");
        assert_eq!(cf.link(&vpc).unwrap(), json!({"Ref": "AWSEC2VPCaexamplecom"}));

        let rendered = cf.render().unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(
            parsed["Resources"]["AWSEC2VPCaexamplecom"]["Properties"]["CidrBlock"],
            "10.0.0.0/16"
        );

        cf.register_literal(vpc.key().clone(), "vpc-1");
        assert_eq!(cf.link(&vpc).unwrap(), json!("vpc-1"));
    }
}
