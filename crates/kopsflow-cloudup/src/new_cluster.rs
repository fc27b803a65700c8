//! Initial cluster and instance group specs for `create cluster`
//!
//! [`new_cluster`] only lays out what the operator asked for: subnets per
//! zone, one control-plane group per control-plane slot, a `nodes` group and
//! optionally a bastion group. Defaults that do not depend on the flags are
//! left to [`kopsflow_core::completion`].

use crate::error::{CloudupError, Result};
use kopsflow_core::completion::build_etcd_clusters;
use kopsflow_core::{
    AccessSpec, Cluster, ClusterSubnetSpec, InstanceGroup, InstanceGroupRole,
    LoadBalancerAccessSpec, LoadBalancerType, NetworkingSpec, ProviderId, SubnetType, TopologyKind,
    TopologySpec, completion, validation,
};
use std::collections::{BTreeMap, BTreeSet};

const NODES_GROUP: &str = "nodes";
const BASTION_GROUP: &str = "bastions";

#[derive(Debug, Clone, Default)]
pub struct NewClusterOptions {
    pub name: String,
    /// Inferred from the first zone when unset
    pub cloud_provider: Option<ProviderId>,
    pub zones: Vec<String>,
    /// Defaults to `zones`
    pub control_plane_zones: Vec<String>,
    /// Defaults to one per control-plane zone, or 1 when those default too
    pub control_plane_count: Option<usize>,
    pub node_count: Option<i32>,
    pub control_plane_size: Option<String>,
    pub node_size: Option<String>,
    pub image: Option<String>,
    pub channel: Option<String>,
    pub kubernetes_version: Option<String>,
    pub networking: Option<String>,
    pub network_cidr: Option<String>,
    /// Existing VPC to build the cluster in
    pub network_id: Option<String>,
    /// Existing subnets, one per zone in `zones` order
    pub subnet_ids: Vec<String>,
    pub topology: TopologyKind,
    pub bastion: bool,
    pub api_load_balancer: Option<LoadBalancerType>,
    pub admin_access: Vec<String>,
    pub ssh_access: Vec<String>,
    pub cloud_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewClusterResult {
    pub cluster: Cluster,
    pub instance_groups: Vec<InstanceGroup>,
}

fn invalid(message: impl Into<String>) -> CloudupError {
    CloudupError::InvalidOptions(message.into())
}

pub fn new_cluster(opts: &NewClusterOptions) -> Result<NewClusterResult> {
    if opts.name.is_empty() {
        return Err(invalid("--name is required"));
    }
    if opts.zones.is_empty() {
        return Err(invalid("must specify at least one zone for the cluster (use --zones)"));
    }
    let zones = dedupe(&opts.zones)?;
    if let Some(stray) = opts.control_plane_zones.iter().find(|z| !zones.contains(z)) {
        return Err(invalid(format!("control-plane zone {stray:?} is not one of the cluster zones")));
    }

    let provider = match opts.cloud_provider {
        Some(p) => p,
        None => ProviderId::infer_from_zone(&zones[0]).ok_or_else(|| {
            invalid(format!("cannot infer the cloud provider from zone {:?}; set --cloud", zones[0]))
        })?,
    };

    let mut cluster = Cluster::new(&opts.name);
    cluster.spec.cloud_provider = Some(provider);
    cluster.spec.channel = opts.channel.clone();
    cluster.spec.kubernetes_version = opts.kubernetes_version.clone();
    cluster.spec.network_cidr = opts.network_cidr.clone();
    cluster.spec.network_id = opts.network_id.clone();
    cluster.spec.kubernetes_api_access = opts.admin_access.clone();
    cluster.spec.ssh_access = if opts.ssh_access.is_empty() {
        opts.admin_access.clone()
    } else {
        opts.ssh_access.clone()
    };
    cluster.spec.cloud_labels = opts.cloud_labels.clone();

    if let Some(name) = opts.networking.as_deref() {
        cluster.spec.networking =
            Some(NetworkingSpec::named(name).ok_or_else(|| invalid(format!("unknown networking mode {name:?}")))?);
    }

    setup_subnets(opts, &zones, &mut cluster)?;
    setup_topology(opts, &mut cluster)?;

    let mut instance_groups = setup_control_plane(opts, &zones, &cluster)?;
    instance_groups.push(setup_nodes(opts, &cluster));
    if opts.bastion {
        instance_groups.push(setup_bastion(&cluster));
    }
    if let Some(image) = &opts.image {
        for ig in instance_groups.iter_mut() {
            ig.spec.image = Some(image.clone());
        }
    }

    let control_planes: Vec<&InstanceGroup> =
        instance_groups.iter().filter(|ig| ig.is_control_plane()).collect();
    cluster.spec.etcd_clusters = build_etcd_clusters(&control_planes, provider);

    Ok(NewClusterResult {
        cluster,
        instance_groups,
    })
}

/// Complete a new cluster and run the full validation `create cluster`
/// requires before anything is written
pub fn validate_new_cluster(result: &NewClusterResult, ssh_fingerprint: Option<&str>) -> Result<()> {
    let cluster = completion::complete_cluster(&result.cluster, &result.instance_groups, ssh_fingerprint)?;
    let instance_groups = result
        .instance_groups
        .iter()
        .map(|ig| completion::complete_instance_group(&cluster, ig))
        .collect::<kopsflow_core::Result<Vec<_>>>()?;
    validation::deep_validate(&cluster, &instance_groups, true).map_err(kopsflow_core::CoreError::from)?;
    Ok(())
}

fn dedupe(zones: &[String]) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for zone in zones {
        let zone = zone.trim();
        if zone.is_empty() {
            return Err(invalid("zone names must not be empty"));
        }
        if seen.insert(zone.to_string()) {
            out.push(zone.to_string());
        }
    }
    Ok(out)
}

fn setup_subnets(opts: &NewClusterOptions, zones: &[String], cluster: &mut Cluster) -> Result<()> {
    if !opts.subnet_ids.is_empty() {
        if opts.network_id.is_none() {
            return Err(invalid("--subnets requires --vpc"));
        }
        if opts.subnet_ids.len() != zones.len() {
            return Err(invalid(format!(
                "got {} subnet ids for {} zones; give one per zone",
                opts.subnet_ids.len(),
                zones.len()
            )));
        }
    }

    let main_type = match opts.topology {
        TopologyKind::Public => SubnetType::Public,
        TopologyKind::Private => SubnetType::Private,
    };
    for (i, zone) in zones.iter().enumerate() {
        cluster.spec.subnets.push(ClusterSubnetSpec {
            name: zone.clone(),
            zone: zone.clone(),
            id: opts.subnet_ids.get(i).cloned(),
            subnet_type: main_type,
            ..Default::default()
        });
    }
    if opts.topology == TopologyKind::Private {
        for zone in zones {
            cluster.spec.subnets.push(ClusterSubnetSpec {
                name: format!("utility-{zone}"),
                zone: zone.clone(),
                subnet_type: SubnetType::Utility,
                ..Default::default()
            });
        }
    }
    Ok(())
}

fn setup_topology(opts: &NewClusterOptions, cluster: &mut Cluster) -> Result<()> {
    if opts.bastion && opts.topology != TopologyKind::Private {
        return Err(invalid("a bastion requires --topology private"));
    }
    cluster.spec.topology = Some(TopologySpec {
        control_plane: opts.topology,
        nodes: opts.topology,
        bastion: opts.bastion,
    });

    // A private control plane is only reachable through a load balancer.
    let lb_type = opts
        .api_load_balancer
        .or((opts.topology == TopologyKind::Private).then_some(LoadBalancerType::Public));
    if let Some(lb_type) = lb_type {
        cluster.spec.api = Some(AccessSpec {
            dns: None,
            load_balancer: Some(LoadBalancerAccessSpec { lb_type }),
        });
    }
    Ok(())
}

fn setup_control_plane(opts: &NewClusterOptions, zones: &[String], cluster: &Cluster) -> Result<Vec<InstanceGroup>> {
    let (cp_zones, count) = if opts.control_plane_zones.is_empty() {
        (zones.to_vec(), opts.control_plane_count.unwrap_or(1))
    } else {
        let cp_zones = dedupe(&opts.control_plane_zones)?;
        let count = match opts.control_plane_count {
            Some(n) if n < cp_zones.len() => {
                return Err(invalid(format!(
                    "specified {} control-plane zones, but also requested {} control-plane nodes; the count must cover every zone",
                    cp_zones.len(),
                    n
                )));
            }
            Some(n) => n,
            None => cp_zones.len(),
        };
        (cp_zones, count)
    };
    if count == 0 {
        return Err(invalid("the control-plane count must be at least 1"));
    }

    let mut groups = Vec::with_capacity(count);
    for i in 0..count {
        let zone = &cp_zones[i % cp_zones.len()];
        let mut name = format!("master-{zone}");
        if count > cp_zones.len() {
            name = format!("{name}-{}", 1 + i / cp_zones.len());
        }
        let mut ig = InstanceGroup::new(name, InstanceGroupRole::ControlPlane);
        ig.spec.min_size = Some(1);
        ig.spec.max_size = Some(1);
        if let Some(subnet) = main_subnet(cluster, zone) {
            ig.spec.subnets.push(subnet);
        }
        ig.spec.machine_type = opts.control_plane_size.clone();
        groups.push(ig);
    }
    Ok(groups)
}

fn setup_nodes(opts: &NewClusterOptions, cluster: &Cluster) -> InstanceGroup {
    let mut ig = InstanceGroup::new(NODES_GROUP, InstanceGroupRole::Node);
    ig.spec.subnets = cluster
        .spec
        .subnets
        .iter()
        .filter(|s| s.subnet_type != SubnetType::Utility)
        .map(|s| s.name.clone())
        .collect();
    if let Some(count) = opts.node_count {
        ig.spec.min_size = Some(count);
        ig.spec.max_size = Some(count);
    }
    ig.spec.machine_type = opts.node_size.clone();
    ig
}

fn setup_bastion(cluster: &Cluster) -> InstanceGroup {
    let mut ig = InstanceGroup::new(BASTION_GROUP, InstanceGroupRole::Bastion);
    ig.spec.subnets = cluster
        .spec
        .subnets
        .iter()
        .filter(|s| s.subnet_type == SubnetType::Utility)
        .map(|s| s.name.clone())
        .collect();
    ig.spec.min_size = Some(1);
    ig.spec.max_size = Some(1);
    ig
}

fn main_subnet(cluster: &Cluster, zone: &str) -> Option<String> {
    cluster
        .spec
        .subnets
        .iter()
        .find(|s| s.zone == zone && s.subnet_type != SubnetType::Utility)
        .map(|s| s.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(name: &str, zones: &[&str], cp_zones: &[&str]) -> NewClusterOptions {
        NewClusterOptions {
            name: name.into(),
            zones: zones.iter().map(|z| z.to_string()).collect(),
            control_plane_zones: cp_zones.iter().map(|z| z.to_string()).collect(),
            ..Default::default()
        }
    }

    fn names(igs: &[InstanceGroup]) -> Vec<&str> {
        igs.iter().map(|ig| ig.name()).collect()
    }

    #[test]
    fn test_minimal_single_zone() {
        let result = new_cluster(&options("minimal.example.com", &["us-test-1a"], &[])).unwrap();
        assert_eq!(result.cluster.spec.cloud_provider, Some(ProviderId::Aws));
        assert_eq!(names(&result.instance_groups), vec!["master-us-test-1a", "nodes"]);
        assert_eq!(result.cluster.spec.etcd_clusters.len(), 2);
        assert_eq!(result.cluster.spec.etcd_clusters[0].etcd_members[0].name, "a");
        validate_new_cluster(&result, None).unwrap();
    }

    #[test]
    fn test_ha_three_zones() {
        let zones = ["us-test-1a", "us-test-1b", "us-test-1c"];
        let result = new_cluster(&options("ha.example.com", &zones, &zones)).unwrap();
        assert_eq!(
            names(&result.instance_groups),
            vec!["master-us-test-1a", "master-us-test-1b", "master-us-test-1c", "nodes"]
        );
        let members: Vec<&str> = result.cluster.spec.etcd_clusters[0]
            .etcd_members
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(members, vec!["a", "b", "c"]);
        validate_new_cluster(&result, None).unwrap();
    }

    #[test]
    fn test_even_control_plane_zones_rejected() {
        let result = new_cluster(&options(
            "ha.example.com",
            &["us-test-1a", "us-test-1b"],
            &["us-test-1a", "us-test-1b"],
        ))
        .unwrap();
        let err = validate_new_cluster(&result, None).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("odd-quorum"), "{err}");
    }

    #[test]
    fn test_control_plane_count_round_robin() {
        let mut opts = options("ha.example.com", &["us-test-1a"], &[]);
        opts.control_plane_count = Some(3);
        let result = new_cluster(&opts).unwrap();
        assert_eq!(
            &names(&result.instance_groups)[..3],
            &["master-us-test-1a-1", "master-us-test-1a-2", "master-us-test-1a-3"]
        );

        let mut opts = options("ha.example.com", &["us-test-1a", "us-test-1b", "us-test-1c"], &["us-test-1a", "us-test-1b", "us-test-1c"]);
        opts.control_plane_count = Some(1);
        assert!(matches!(new_cluster(&opts), Err(CloudupError::InvalidOptions(_))));
    }

    #[test]
    fn test_private_topology_with_bastion() {
        let mut opts = options("private.example.com", &["us-test-1a"], &[]);
        opts.topology = TopologyKind::Private;
        opts.bastion = true;
        let result = new_cluster(&opts).unwrap();

        let subnets: Vec<(&str, SubnetType)> = result
            .cluster
            .spec
            .subnets
            .iter()
            .map(|s| (s.name.as_str(), s.subnet_type))
            .collect();
        assert_eq!(
            subnets,
            vec![("us-test-1a", SubnetType::Private), ("utility-us-test-1a", SubnetType::Utility)]
        );
        let bastion = result.instance_groups.iter().find(|ig| ig.name() == "bastions").unwrap();
        assert_eq!(bastion.spec.subnets, vec!["utility-us-test-1a"]);
        let lb = result.cluster.spec.api.as_ref().and_then(|a| a.load_balancer.as_ref());
        assert_eq!(lb.map(|l| l.lb_type), Some(LoadBalancerType::Public));
        validate_new_cluster(&result, None).unwrap();
    }

    #[test]
    fn test_bastion_needs_private_topology() {
        let mut opts = options("minimal.example.com", &["us-test-1a"], &[]);
        opts.bastion = true;
        assert!(new_cluster(&opts).is_err());
    }

    #[test]
    fn test_shared_vpc_subnets() {
        let mut opts = options("shared.example.com", &["us-test-1a"], &[]);
        opts.network_id = Some("vpc-12345678".into());
        opts.network_cidr = Some("10.0.0.0/16".into());
        opts.subnet_ids = vec!["subnet-12345678".into()];
        let result = new_cluster(&opts).unwrap();
        assert_eq!(result.cluster.spec.subnets[0].id.as_deref(), Some("subnet-12345678"));
        assert!(result.cluster.uses_shared_network());

        opts.network_id = None;
        assert!(new_cluster(&opts).is_err());
    }

    #[test]
    fn test_unknown_networking_and_zone() {
        let mut opts = options("minimal.example.com", &["us-test-1a"], &[]);
        opts.networking = Some("flannel-classic".into());
        assert!(new_cluster(&opts).is_err());

        let opts = options("minimal.example.com", &["us-test-1a"], &["us-test-1b"]);
        assert!(new_cluster(&opts).is_err());

        let opts = options("minimal.example.com", &["somewhere"], &[]);
        assert!(new_cluster(&opts).is_err());
    }
}
