//! Security groups and the rules between them

use super::{ModelBuilder, ModelContext};
use crate::error::Result;
use crate::phase::Phase;
use kopsflow_core::InstanceGroupRole;
use kopsflow_fi::tasks::{SecurityGroup, SecurityGroupRule};
use kopsflow_fi::{TaskMap, TaskRef};

const ANYWHERE: &str = "0.0.0.0/0";

/// Node to control plane, leaving out the etcd client and peer ports
const NODE_TO_MASTER: [(&str, i64, i64); 4] = [
    ("tcp", 1, 2379),
    ("tcp", 2382, 4000),
    ("tcp", 4003, 65535),
    ("udp", 1, 65535),
];

pub struct FirewallModelBuilder;

struct Rule {
    name: String,
    group: TaskRef,
    source_group: Option<TaskRef>,
    cidr: Option<String>,
    protocol: &'static str,
    ports: Option<(i64, i64)>,
    egress: bool,
}

impl Rule {
    fn all(name: String, group: &TaskRef, source: &TaskRef) -> Self {
        Rule {
            name,
            group: group.clone(),
            source_group: Some(source.clone()),
            cidr: None,
            protocol: "-1",
            ports: None,
            egress: false,
        }
    }

    fn tcp_from_cidr(name: String, group: &TaskRef, cidr: &str, port: i64) -> Self {
        Rule {
            name,
            group: group.clone(),
            source_group: None,
            cidr: Some(cidr.to_string()),
            protocol: "tcp",
            ports: Some((port, port)),
            egress: false,
        }
    }

    fn egress(name: String, group: &TaskRef) -> Self {
        Rule {
            name,
            group: group.clone(),
            source_group: None,
            cidr: Some(ANYWHERE.to_string()),
            protocol: "-1",
            ports: None,
            egress: true,
        }
    }

    fn into_task(self) -> SecurityGroupRule {
        SecurityGroupRule {
            name: self.name,
            security_group: self.group,
            source_group: self.source_group,
            cidr: self.cidr,
            protocol: self.protocol.to_string(),
            from_port: self.ports.map(|p| p.0),
            to_port: self.ports.map(|p| p.1),
            egress: self.egress,
        }
    }
}

impl ModelBuilder for FirewallModelBuilder {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn phase(&self) -> Phase {
        Phase::Security
    }

    fn build(&self, ctx: &ModelContext<'_>, tasks: &mut TaskMap) -> Result<()> {
        let spec = &ctx.cluster.spec;
        let with_bastion = ctx.has_role(InstanceGroupRole::Bastion)
            || spec.topology.as_ref().is_some_and(|t| t.bastion);

        let mut group = |role: InstanceGroupRole, description: &str| -> Result<TaskRef> {
            let name = ctx.security_group_name(role);
            Ok(tasks.add(SecurityGroup {
                tags: ctx.owned_tags(&name),
                name,
                vpc: ctx.vpc(),
                description: Some(description.to_string()),
            })?)
        };
        let masters = group(InstanceGroupRole::ControlPlane, "Security group for masters")?;
        let nodes = group(InstanceGroupRole::Node, "Security group for nodes")?;
        let bastion = if with_bastion {
            Some(group(InstanceGroupRole::Bastion, "Security group for bastion")?)
        } else {
            None
        };

        let mut rules = vec![
            Rule::egress("master-egress".into(), &masters),
            Rule::egress("node-egress".into(), &nodes),
            Rule::all("all-master-to-master".into(), &masters, &masters),
            Rule::all("all-master-to-node".into(), &nodes, &masters),
            Rule::all("all-node-to-node".into(), &nodes, &nodes),
        ];
        for (protocol, from, to) in NODE_TO_MASTER {
            rules.push(Rule {
                name: format!("node-to-master-{protocol}-{from}-{to}"),
                group: masters.clone(),
                source_group: Some(nodes.clone()),
                cidr: None,
                protocol,
                ports: Some((from, to)),
                egress: false,
            });
        }

        match &bastion {
            Some(bastion) => {
                rules.push(Rule::egress("bastion-egress".into(), bastion));
                for cidr in &spec.ssh_access {
                    rules.push(Rule::tcp_from_cidr(
                        format!("ssh-external-to-bastion-{cidr}"),
                        bastion,
                        cidr,
                        22,
                    ));
                }
                for (target, label) in [(&masters, "master"), (&nodes, "node")] {
                    rules.push(Rule {
                        name: format!("bastion-to-{label}-ssh"),
                        group: target.clone(),
                        source_group: Some(bastion.clone()),
                        cidr: None,
                        protocol: "tcp",
                        ports: Some((22, 22)),
                        egress: false,
                    });
                }
            }
            None => {
                for cidr in &spec.ssh_access {
                    rules.push(Rule::tcp_from_cidr(
                        format!("ssh-external-to-master-{cidr}"),
                        &masters,
                        cidr,
                        22,
                    ));
                    rules.push(Rule::tcp_from_cidr(
                        format!("ssh-external-to-node-{cidr}"),
                        &nodes,
                        cidr,
                        22,
                    ));
                }
            }
        }

        for cidr in &spec.kubernetes_api_access {
            rules.push(Rule::tcp_from_cidr(
                format!("https-external-to-master-{cidr}"),
                &masters,
                cidr,
                443,
            ));
        }

        for rule in rules {
            tasks.add(rule.into_task())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::Fixture;
    use kopsflow_core::InstanceGroup;
    use kopsflow_fi::TaskKey;
    use kopsflow_fi::tasks::types;

    fn rule_names(tasks: &TaskMap) -> Vec<String> {
        tasks
            .keys()
            .filter(|k| k.type_name == types::SECURITY_GROUP_RULE)
            .map(|k| k.name.clone())
            .collect()
    }

    #[test]
    fn test_default_rules() {
        let fixture = Fixture::minimal();
        let mut tasks = TaskMap::new();
        FirewallModelBuilder.build(&fixture.context(), &mut tasks).unwrap();

        let names = rule_names(&tasks);
        assert!(names.contains(&"ssh-external-to-node-0.0.0.0/0".to_string()));
        assert!(names.contains(&"https-external-to-master-0.0.0.0/0".to_string()));
        assert!(names.contains(&"node-to-master-udp-1-65535".to_string()));
        assert!(!tasks.contains(&TaskKey::new(types::SECURITY_GROUP, "bastion.minimal.example.com")));

        let https = tasks
            .get(&TaskKey::new(types::SECURITY_GROUP_RULE, "https-external-to-master-0.0.0.0/0"))
            .unwrap();
        assert_eq!(https.inputs["fromPort"], 443);
    }

    #[test]
    fn test_bastion_fronts_ssh() {
        let base = Fixture::minimal();
        let mut igs = base.instance_groups.clone();
        let mut bastion = InstanceGroup::new("bastions", InstanceGroupRole::Bastion);
        bastion.spec.subnets = vec!["us-test-1a".into()];
        igs.push(bastion);
        let fixture = Fixture::complete(base.cluster.clone(), igs);

        let mut tasks = TaskMap::new();
        FirewallModelBuilder.build(&fixture.context(), &mut tasks).unwrap();
        let names = rule_names(&tasks);
        assert!(names.contains(&"ssh-external-to-bastion-0.0.0.0/0".to_string()));
        assert!(names.contains(&"bastion-to-node-ssh".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("ssh-external-to-node")));
    }
}
