//! VPC, subnets, internet gateway and route table

use super::{cloud, types};
use crate::changes::Changes;
use crate::context::Context;
use crate::error::{FiError, Result};
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
pub struct Vpc {
    pub name: String,
    /// Set for a pre-existing VPC
    pub id: Option<String>,
    pub cidr: Option<String>,
    pub enable_dns_hostnames: Option<bool>,
    pub enable_dns_support: Option<bool>,
    pub shared: bool,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for Vpc {
    crate::task_identity!(types::VPC);

    fn is_shared(&self) -> bool {
        self.shared
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::VPC, &self.name, self.id.as_deref()).await
    }

    fn check_changes(&self, actual: Option<&Value>, changes: &Changes) -> Result<()> {
        if actual.is_some() && changes.contains("cidr") {
            return Err(FiError::InvalidChange {
                key: self.key(),
                message: "the CIDR of an existing VPC cannot be changed".into(),
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
        cloud::apply(ctx, kinds::VPC, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let mut attrs = BTreeMap::new();
        if let Some(cidr) = &self.cidr {
            attrs.insert("cidr_block".into(), HclValue::str(cidr));
        }
        attrs.insert(
            "enable_dns_hostnames".into(),
            HclValue::Bool(self.enable_dns_hostnames.unwrap_or(true)),
        );
        attrs.insert(
            "enable_dns_support".into(),
            HclValue::Bool(self.enable_dns_support.unwrap_or(true)),
        );
        attrs.insert("tags".into(), HclValue::tags(&self.tags));
        tf.add_resource("aws_vpc", &self.name, attrs);
        tf.add_output("vpc_id", tf.link(&TaskRef(self.key()), "id")?);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        cf.add_resource(
            "AWS::EC2::VPC",
            &self.name,
            json!({
                "CidrBlock": self.cidr,
                "EnableDnsHostnames": self.enable_dns_hostnames.unwrap_or(true),
                "EnableDnsSupport": self.enable_dns_support.unwrap_or(true),
                "Tags": cloudformation::tag_list(&self.tags),
            }),
        );
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub name: String,
    pub id: Option<String>,
    pub vpc: TaskRef,
    pub zone: String,
    pub cidr: Option<String>,
    pub shared: bool,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for Subnet {
    crate::task_identity!(types::SUBNET);

    fn is_shared(&self) -> bool {
        self.shared
    }

    fn field_policy(&self, field: &str) -> FieldPolicy {
        match field {
            "cidr" | "zone" | "vpc" => FieldPolicy::Immutable,
            _ => FieldPolicy::Reconcile,
        }
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::SUBNET, &self.name, self.id.as_deref()).await
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::SUBNET, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let mut attrs = BTreeMap::from([
            ("vpc_id".to_string(), tf.link(&self.vpc, "id")?),
            ("availability_zone".to_string(), HclValue::str(&self.zone)),
            ("tags".to_string(), HclValue::tags(&self.tags)),
        ]);
        if let Some(cidr) = &self.cidr {
            attrs.insert("cidr_block".into(), HclValue::str(cidr));
        }
        tf.add_resource("aws_subnet", &self.name, attrs);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        cf.add_resource(
            "AWS::EC2::Subnet",
            &self.name,
            json!({
                "VpcId": cf.link(&self.vpc)?,
                "AvailabilityZone": self.zone,
                "CidrBlock": self.cidr,
                "Tags": cloudformation::tag_list(&self.tags),
            }),
        );
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternetGateway {
    pub name: String,
    pub vpc: TaskRef,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for InternetGateway {
    crate::task_identity!(types::INTERNET_GATEWAY);

    fn field_policy(&self, field: &str) -> FieldPolicy {
        match field {
            "vpc" => FieldPolicy::Immutable,
            _ => FieldPolicy::Reconcile,
        }
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::INTERNET_GATEWAY, &self.name, None).await
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::INTERNET_GATEWAY, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let attrs = BTreeMap::from([
            ("vpc_id".to_string(), tf.link(&self.vpc, "id")?),
            ("tags".to_string(), HclValue::tags(&self.tags)),
        ]);
        tf.add_resource("aws_internet_gateway", &self.name, attrs);
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        let gateway = cf.add_resource(
            "AWS::EC2::InternetGateway",
            &self.name,
            json!({"Tags": cloudformation::tag_list(&self.tags)}),
        );
        cf.add_resource(
            "AWS::EC2::VPCGatewayAttachment",
            &self.name,
            json!({"VpcId": cf.link(&self.vpc)?, "InternetGatewayId": gateway}),
        );
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTable {
    pub name: String,
    pub vpc: TaskRef,
    /// Default route target
    pub internet_gateway: Option<TaskRef>,
    pub subnets: Vec<TaskRef>,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl Task for RouteTable {
    crate::task_identity!(types::ROUTE_TABLE);

    fn field_policy(&self, field: &str) -> FieldPolicy {
        match field {
            "vpc" => FieldPolicy::Immutable,
            _ => FieldPolicy::Reconcile,
        }
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        cloud::find(ctx, kinds::ROUTE_TABLE, &self.name, None).await
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value> {
        cloud::apply(ctx, kinds::ROUTE_TABLE, self, expected, actual, changes).await
    }

    fn render_terraform(&self, _ctx: &Context, tf: &TerraformTarget) -> Result<Value> {
        let mut attrs = BTreeMap::from([
            ("vpc_id".to_string(), tf.link(&self.vpc, "id")?),
            ("tags".to_string(), HclValue::tags(&self.tags)),
        ]);
        if let Some(igw) = &self.internet_gateway {
            let route = BTreeMap::from([
                ("cidr_block".to_string(), HclValue::str("0.0.0.0/0")),
                ("gateway_id".to_string(), tf.link(igw, "id")?),
            ]);
            attrs.insert("route".into(), HclValue::Blocks(vec![route]));
        }
        let table = tf.add_resource("aws_route_table", &self.name, attrs);

        for subnet in &self.subnets {
            let association = BTreeMap::from([
                ("route_table_id".to_string(), table.clone()),
                ("subnet_id".to_string(), tf.link(subnet, "id")?),
            ]);
            tf.add_resource(
                "aws_route_table_association",
                &format!("{}-{}", subnet.key().name, self.name),
                association,
            );
        }
        Ok(Value::Null)
    }

    fn render_cloudformation(&self, _ctx: &Context, cf: &CloudFormationTarget) -> Result<Value> {
        let table = cf.add_resource(
            "AWS::EC2::RouteTable",
            &self.name,
            json!({"VpcId": cf.link(&self.vpc)?, "Tags": cloudformation::tag_list(&self.tags)}),
        );
        if let Some(igw) = &self.internet_gateway {
            cf.add_resource(
                "AWS::EC2::Route",
                &format!("0.0.0.0/0{}", self.name),
                json!({
                    "RouteTableId": table,
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": cf.link(igw)?,
                }),
            );
        }
        for subnet in &self.subnets {
            cf.add_resource(
                "AWS::EC2::SubnetRouteTableAssociation",
                &format!("{}{}", subnet.key().name, self.name),
                json!({"RouteTableId": table, "SubnetId": cf.link(subnet)?}),
            );
        }
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::target::Target;
    use crate::taskmap::TaskMap;
    use kopsflow_cloud::{Cloud, MockCloud, SubnetInfo};
    use kopsflow_core::ProviderId;
    use kopsflow_pki::EphemeralKeystore;
    use std::sync::Arc;

    const CLUSTER: &str = "minimal.example.com";

    fn context(cloud: &Arc<MockCloud>) -> Arc<Context> {
        let cloud: Arc<dyn Cloud> = cloud.clone();
        Arc::new(
            Context::new(CLUSTER, Target::Direct, Arc::new(EphemeralKeystore::new())).with_cloud(cloud),
        )
    }

    fn owned_tags() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("KubernetesCluster".to_string(), CLUSTER.to_string()),
            (format!("kubernetes.io/cluster/{CLUSTER}"), "owned".to_string()),
        ])
    }

    fn network(cidr: &str) -> TaskMap {
        let mut map = TaskMap::new();
        let vpc = map
            .add(Vpc {
                name: CLUSTER.into(),
                id: None,
                cidr: Some("172.20.0.0/16".into()),
                enable_dns_hostnames: Some(true),
                enable_dns_support: Some(true),
                shared: false,
                tags: owned_tags(),
            })
            .unwrap();
        let subnet = map
            .add(Subnet {
                name: format!("us-test-1a.{CLUSTER}"),
                id: None,
                vpc: vpc.clone(),
                zone: "us-test-1a".into(),
                cidr: Some(cidr.into()),
                shared: false,
                tags: owned_tags(),
            })
            .unwrap();
        let igw = map
            .add(InternetGateway {
                name: CLUSTER.into(),
                vpc: vpc.clone(),
                tags: owned_tags(),
            })
            .unwrap();
        map.add(RouteTable {
            name: CLUSTER.into(),
            vpc,
            internet_gateway: Some(igw),
            subnets: vec![subnet],
            tags: owned_tags(),
        })
        .unwrap();
        map
    }

    #[tokio::test]
    async fn test_network_converges_and_is_idempotent() {
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        let map = network("172.20.32.0/19");

        let report = Executor::new().run(&map, context(&cloud)).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(report.summary().create, 4);

        let vpc = cloud.resource_named(kinds::VPC, CLUSTER).await.unwrap();
        let subnet = cloud
            .resource_named(kinds::SUBNET, "us-test-1a.minimal.example.com")
            .await
            .unwrap();
        assert_eq!(subnet.attributes["vpc"], json!(vpc.id));
        assert_eq!(subnet.depends_on, vec![vpc.id.clone()]);

        let again = Executor::new().run(&map, context(&cloud)).await.unwrap();
        assert!(!again.has_changes());
    }

    fn vpc_and_subnet(cidr: &str) -> TaskMap {
        let mut map = TaskMap::new();
        let vpc = map
            .add(Vpc {
                name: CLUSTER.into(),
                id: None,
                cidr: Some("172.20.0.0/16".into()),
                enable_dns_hostnames: Some(true),
                enable_dns_support: Some(true),
                shared: false,
                tags: owned_tags(),
            })
            .unwrap();
        map.add(Subnet {
            name: format!("us-test-1a.{CLUSTER}"),
            id: None,
            vpc,
            zone: "us-test-1a".into(),
            cidr: Some(cidr.into()),
            shared: false,
            tags: owned_tags(),
        })
        .unwrap();
        map
    }

    #[tokio::test]
    async fn test_immutable_subnet_cidr_recreates() {
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        Executor::new()
            .run(&vpc_and_subnet("172.20.32.0/19"), context(&cloud))
            .await
            .unwrap();
        let before = cloud
            .resource_named(kinds::SUBNET, "us-test-1a.minimal.example.com")
            .await
            .unwrap();

        let report = Executor::new()
            .run(&vpc_and_subnet("172.20.64.0/19"), context(&cloud))
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(report.actions_by_type(crate::action::ActionType::Recreate).len(), 1);

        let after = cloud
            .resource_named(kinds::SUBNET, "us-test-1a.minimal.example.com")
            .await
            .unwrap();
        assert_ne!(before.id, after.id);
        assert_eq!(after.attributes["cidr"], json!("172.20.64.0/19"));
    }

    #[tokio::test]
    async fn test_vpc_cidr_change_rejected() {
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        Executor::new()
            .run(&network("172.20.32.0/19"), context(&cloud))
            .await
            .unwrap();

        let mut map = TaskMap::new();
        map.add(Vpc {
            name: CLUSTER.into(),
            id: None,
            cidr: Some("10.0.0.0/16".into()),
            enable_dns_hostnames: Some(true),
            enable_dns_support: Some(true),
            shared: false,
            tags: owned_tags(),
        })
        .unwrap();
        let report = Executor::new().run(&map, context(&cloud)).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("cannot be changed"));
    }

    #[tokio::test]
    async fn test_shared_subnet_is_only_tagged() {
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        cloud
            .seed_vpc(
                "vpc-12345678",
                "172.20.0.0/16",
                &[SubnetInfo {
                    id: "subnet-12345678".into(),
                    zone: "us-test-1a".into(),
                    cidr: "172.20.32.0/19".into(),
                }],
            )
            .await
            .unwrap();

        let mut map = TaskMap::new();
        let vpc = map
            .add(Vpc {
                name: CLUSTER.into(),
                id: Some("vpc-12345678".into()),
                cidr: None,
                enable_dns_hostnames: None,
                enable_dns_support: None,
                shared: true,
                tags: BTreeMap::new(),
            })
            .unwrap();
        map.add(Subnet {
            name: format!("us-test-1a.{CLUSTER}"),
            id: Some("subnet-12345678".into()),
            vpc,
            zone: "us-test-1a".into(),
            cidr: Some("10.9.0.0/24".into()),
            shared: true,
            tags: BTreeMap::from([(format!("kubernetes.io/cluster/{CLUSTER}"), "shared".to_string())]),
        })
        .unwrap();

        let report = Executor::new().run(&map, context(&cloud)).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(report.actions_by_type(crate::action::ActionType::Update).len(), 1);

        let trackers = cloud.list_resources(CLUSTER).await.unwrap();
        let subnet = trackers.iter().find(|t| t.id == "subnet-12345678").unwrap();
        assert!(subnet.shared);
        let calls = cloud.calls().await;
        assert!(calls.contains(&"TagResource subnet-12345678".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("CreateResource")));
    }

    #[tokio::test]
    async fn test_missing_shared_vpc_fails() {
        let cloud = Arc::new(MockCloud::new(ProviderId::Aws, "us-test-1"));
        let mut map = TaskMap::new();
        map.add(Vpc {
            name: CLUSTER.into(),
            id: Some("vpc-missing".into()),
            cidr: None,
            enable_dns_hostnames: None,
            enable_dns_support: None,
            shared: true,
            tags: BTreeMap::new(),
        })
        .unwrap();
        let report = Executor::new().run(&map, context(&cloud)).await.unwrap();
        assert!(report.failed[0].error.contains("not found"));
    }
}
