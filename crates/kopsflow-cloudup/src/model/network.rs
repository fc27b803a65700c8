//! VPC, subnets and public routing

use super::{ModelBuilder, ModelContext};
use crate::error::Result;
use crate::phase::Phase;
use kopsflow_core::SubnetType;
use kopsflow_fi::TaskMap;
use kopsflow_fi::tasks::{InternetGateway, RouteTable, Subnet, Vpc};

pub struct NetworkModelBuilder;

impl ModelBuilder for NetworkModelBuilder {
    fn name(&self) -> &'static str {
        "network"
    }

    fn phase(&self) -> Phase {
        Phase::Network
    }

    fn build(&self, ctx: &ModelContext<'_>, tasks: &mut TaskMap) -> Result<()> {
        let spec = &ctx.cluster.spec;
        let name = ctx.cluster_name().to_string();
        let shared_vpc = spec.network_id.is_some();

        let vpc = if shared_vpc {
            Vpc {
                name: name.clone(),
                id: spec.network_id.clone(),
                cidr: spec.network_cidr.clone(),
                enable_dns_hostnames: None,
                enable_dns_support: None,
                shared: true,
                tags: Default::default(),
            }
        } else {
            Vpc {
                name: name.clone(),
                id: None,
                cidr: spec.network_cidr.clone(),
                enable_dns_hostnames: Some(true),
                enable_dns_support: Some(true),
                shared: false,
                tags: ctx.owned_tags(&name),
            }
        };
        let vpc = tasks.add(vpc)?;

        let mut routed = Vec::new();
        for subnet in &spec.subnets {
            let task_name = ctx.subnet_task_name(&subnet.name);
            let shared = subnet.is_shared();
            let mut tags = if shared {
                ctx.shared_tags()
            } else {
                ctx.owned_tags(&task_name)
            };
            if !shared {
                let role_tag = match subnet.subnet_type {
                    SubnetType::Private => "kubernetes.io/role/internal-elb",
                    SubnetType::Public | SubnetType::Utility => "kubernetes.io/role/elb",
                };
                tags.insert(role_tag.to_string(), "1".to_string());
                tags.insert("SubnetType".to_string(), format!("{:?}", subnet.subnet_type));
            }
            let subnet_ref = tasks.add(Subnet {
                name: task_name,
                id: subnet.id.clone(),
                vpc: vpc.clone(),
                zone: subnet.zone.clone(),
                cidr: subnet.cidr.clone(),
                shared,
                tags,
            })?;
            if !shared && subnet.subnet_type != SubnetType::Private {
                routed.push(subnet_ref);
            }
        }

        // Routing of a shared VPC belongs to its owner.
        if shared_vpc {
            return Ok(());
        }

        let igw = tasks.add(InternetGateway {
            name: name.clone(),
            vpc: vpc.clone(),
            tags: ctx.owned_tags(&name),
        })?;
        tasks.add(RouteTable {
            name: name.clone(),
            vpc,
            internet_gateway: Some(igw),
            subnets: routed,
            tags: ctx.owned_tags(&name),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::Fixture;
    use kopsflow_core::ClusterSubnetSpec;
    use kopsflow_fi::TaskKey;
    use kopsflow_fi::tasks::types;

    fn build(fixture: &Fixture) -> TaskMap {
        let mut tasks = TaskMap::new();
        NetworkModelBuilder.build(&fixture.context(), &mut tasks).unwrap();
        tasks
    }

    #[test]
    fn test_owned_network() {
        let fixture = Fixture::minimal();
        let tasks = build(&fixture);
        assert_eq!(tasks.len(), 4);

        let subnet = tasks
            .get(&TaskKey::new(types::SUBNET, "us-test-1a.minimal.example.com"))
            .unwrap();
        assert_eq!(subnet.inputs["tags"]["kubernetes.io/cluster/minimal.example.com"], "owned");
        assert_eq!(subnet.inputs["tags"]["KubernetesCluster"], "minimal.example.com");
        assert_eq!(subnet.inputs["cidr"], "172.20.0.0/19");

        let routes = tasks
            .get(&TaskKey::new(types::ROUTE_TABLE, "minimal.example.com"))
            .unwrap();
        assert_eq!(routes.dependencies.len(), 3);
    }

    #[test]
    fn test_shared_vpc_and_subnet() {
        let mut cluster = Fixture::minimal().cluster;
        cluster.spec.network_id = Some("vpc-12345678".into());
        cluster.spec.network_cidr = Some("10.0.0.0/16".into());
        cluster.spec.subnets = vec![ClusterSubnetSpec {
            name: "us-test-1a".into(),
            zone: "us-test-1a".into(),
            id: Some("subnet-12345678".into()),
            cidr: Some("10.0.1.0/24".into()),
            ..Default::default()
        }];
        let fixture = Fixture::complete(cluster, Fixture::minimal().instance_groups);
        let tasks = build(&fixture);

        assert_eq!(tasks.len(), 2);
        let vpc = tasks.get(&TaskKey::new(types::VPC, "minimal.example.com")).unwrap();
        assert_eq!(vpc.inputs["id"], "vpc-12345678");
        assert!(vpc.task.is_shared());

        let subnet = tasks
            .get(&TaskKey::new(types::SUBNET, "us-test-1a.minimal.example.com"))
            .unwrap();
        assert!(subnet.task.is_shared());
        assert_eq!(
            subnet.inputs["tags"],
            serde_json::json!({"kubernetes.io/cluster/minimal.example.com": "shared"})
        );
    }
}
