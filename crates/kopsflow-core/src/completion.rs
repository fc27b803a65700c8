//! Completion: fill in defaults a user did not specify
//!
//! Every function here is idempotent: completing an already complete object
//! returns it unchanged.

use crate::channel::{Channel, DEFAULT_CHANNEL, default_machine_type};
use crate::error::{CoreError, Result};
use crate::model::{
    AccessSpec, Cluster, EmptySpec, EtcdClusterSpec, EtcdMemberSpec, InstanceGroup,
    InstanceGroupRole, NetworkingSpec, ProviderId, SubnetType, TopologyKind,
};
use crate::net::Ipv4Cidr;
use crate::validation::{FieldErrorKind, ValidationErrors};
use std::collections::BTreeSet;

pub const DEFAULT_NON_MASQUERADE_CIDR: &str = "100.64.0.0/10";
pub const DEFAULT_NETWORKING: &str = "cilium";
pub const ETCD_CLUSTERS: [&str; 2] = ["main", "events"];
const ANYWHERE: &str = "0.0.0.0/0";

pub fn default_network_cidr(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::Aws => "172.20.0.0/16",
        _ => "10.0.0.0/16",
    }
}

/// `kubernetes.<cluster>-<fingerprint>`
pub fn ssh_key_name(cluster_name: &str, fingerprint: &str) -> String {
    format!("kubernetes.{}-{}", cluster_name, fingerprint)
}

/// Infer the provider when every subnet zone points to the same one
pub fn infer_provider(cluster: &Cluster) -> Option<ProviderId> {
    let found: BTreeSet<Option<ProviderId>> = cluster
        .spec
        .subnets
        .iter()
        .map(|s| ProviderId::infer_from_zone(&s.zone))
        .collect();
    match found.into_iter().collect::<Vec<_>>().as_slice() {
        [Some(p)] => Some(*p),
        _ => None,
    }
}

/// Zones an instance group's subnets live in
pub fn zones_for_instance_group(cluster: &Cluster, ig: &InstanceGroup) -> Vec<String> {
    let zones: BTreeSet<String> = ig
        .spec
        .subnets
        .iter()
        .filter_map(|name| cluster.subnet(name))
        .map(|s| s.zone.clone())
        .collect();
    zones.into_iter().collect()
}

/// Fill cluster defaults.
///
/// `instance_groups` drives etcd membership; `ssh_fingerprint` (when the
/// admin key is known) names the cloud SSH key.
pub fn complete_cluster(
    cluster: &Cluster,
    instance_groups: &[InstanceGroup],
    ssh_fingerprint: Option<&str>,
) -> Result<Cluster> {
    let mut c = cluster.clone();
    let name = c.metadata.name.clone();

    let provider = match c.spec.cloud_provider {
        Some(p) => p,
        None => {
            let p = infer_provider(&c).ok_or_else(|| {
                CoreError::InvalidSpec(
                    "cannot infer the cloud provider from the subnet zones; set spec.cloudProvider"
                        .to_string(),
                )
            })?;
            tracing::debug!("Inferred cloud provider {} for {}", p, name);
            c.spec.cloud_provider = Some(p);
            p
        }
    };

    let channel_name = c
        .spec
        .channel
        .get_or_insert_with(|| DEFAULT_CHANNEL.to_string())
        .clone();
    if c.spec.kubernetes_version.is_none() {
        let channel = Channel::find(&channel_name)?;
        c.spec.kubernetes_version = Some(channel.kubernetes_version.to_string());
    }

    if c.spec.network_cidr.is_none() && c.spec.network_id.is_none() {
        c.spec.network_cidr = Some(default_network_cidr(provider).to_string());
    }

    let non_masq = c
        .spec
        .non_masquerade_cidr
        .get_or_insert_with(|| DEFAULT_NON_MASQUERADE_CIDR.to_string())
        .clone();
    if c.spec.service_cluster_ip_range.is_none() {
        let nm: Ipv4Cidr = non_masq.parse().map_err(CoreError::InvalidSpec)?;
        // First eighth of the non-masquerade range
        if let Some(first) = nm.subdivide(nm.prefix().saturating_add(3).min(32)).first() {
            c.spec.service_cluster_ip_range = Some(first.to_string());
        }
    }

    if c.spec.networking.is_none() {
        c.spec.networking = NetworkingSpec::named(DEFAULT_NETWORKING);
    }
    if c.spec.api.is_none() {
        c.spec.api = Some(AccessSpec {
            dns: Some(EmptySpec {}),
            load_balancer: None,
        });
    }
    if c.spec.ssh_access.is_empty() {
        c.spec.ssh_access.push(ANYWHERE.to_string());
    }
    if c.spec.kubernetes_api_access.is_empty() {
        c.spec.kubernetes_api_access.push(ANYWHERE.to_string());
    }

    if c.spec.master_public_name.is_none() {
        c.spec.master_public_name = Some(format!("api.{}", name));
    }
    if c.spec.master_internal_name.is_none() {
        c.spec.master_internal_name = Some(format!("api.internal.{}", name));
    }

    assign_subnet_cidrs(&mut c)?;

    if c.spec.etcd_clusters.is_empty() {
        let control_planes: Vec<&InstanceGroup> = instance_groups
            .iter()
            .filter(|ig| ig.is_control_plane())
            .collect();
        // One etcd member per control-plane group
        let count = control_planes.len();
        if count % 2 == 0 && count > 0 {
            let mut errs = ValidationErrors::default();
            errs.push(
                FieldErrorKind::Invalid,
                "instanceGroups",
                format!(
                    "{count} control-plane instance groups would give etcd {count} members; an odd number is required for etcd quorum (odd-quorum)"
                ),
            );
            return Err(CoreError::Validation(errs));
        }
        if count > 0 {
            c.spec.etcd_clusters = build_etcd_clusters(&control_planes, provider);
        }
    }

    if c.spec.ssh_key_name.is_none() {
        if let Some(fp) = ssh_fingerprint {
            c.spec.ssh_key_name = Some(ssh_key_name(&name, fp));
        }
    }

    Ok(c)
}

/// Carve CIDRs for subnets that have neither a CIDR nor a shared id.
///
/// Public and private subnets get blocks of `/19` (or network prefix + 3
/// for small networks); utility subnets are cut into `/22`s from the last
/// of those blocks.
pub fn assign_subnet_cidrs(cluster: &mut Cluster) -> Result<()> {
    let needs: Vec<usize> = cluster
        .spec
        .subnets
        .iter()
        .enumerate()
        .filter(|(_, s)| s.cidr.is_none() && s.id.is_none())
        .map(|(i, _)| i)
        .collect();
    if needs.is_empty() {
        return Ok(());
    }
    let Some(network) = cluster.spec.network_cidr.as_deref() else {
        return Ok(());
    };
    let network: Ipv4Cidr = network.parse().map_err(CoreError::InvalidSpec)?;

    let main_prefix = network.prefix().saturating_add(3).max(19);
    let utility_prefix = main_prefix + 3;
    if utility_prefix > 30 {
        return Err(CoreError::InvalidSpec(format!(
            "network {} is too small to allocate subnets",
            network
        )));
    }
    let mut blocks = network.subdivide(main_prefix);
    let utility_pool = match blocks.pop() {
        Some(last) => last.subdivide(utility_prefix),
        None => Vec::new(),
    };

    let mut used: Vec<Ipv4Cidr> = cluster
        .spec
        .subnets
        .iter()
        .filter_map(|s| s.cidr.as_deref())
        .filter_map(|c| c.parse().ok())
        .collect();

    for idx in needs {
        let subnet = &mut cluster.spec.subnets[idx];
        let pool = if subnet.subnet_type == SubnetType::Utility {
            &utility_pool
        } else {
            &blocks
        };
        let block = pool
            .iter()
            .find(|b| !used.iter().any(|u| u.overlaps(b)))
            .copied()
            .ok_or_else(|| {
                CoreError::InvalidSpec(format!(
                    "no free CIDR left in {} for subnet {}",
                    network, subnet.name
                ))
            })?;
        tracing::debug!("Assigned {} to subnet {}", block, subnet.name);
        subnet.cidr = Some(block.to_string());
        used.push(block);
    }
    Ok(())
}

/// Strip the leading characters shared by every name (`us-test-1a`,
/// `us-test-1b` become `a`, `b`)
fn trim_common_prefix(mut names: Vec<String>) -> Vec<String> {
    while !names.is_empty() && names[0].len() > 1 {
        let prefix = names[0].chars().next().unwrap_or_default();
        if !names.iter().all(|n| n.len() > 1 && n.starts_with(prefix)) {
            break;
        }
        for n in names.iter_mut() {
            n.remove(0);
        }
    }
    names
        .into_iter()
        .map(|n| {
            if n.starts_with(|c: char| c.is_ascii_digit()) {
                format!("etcd-{}", n)
            } else {
                n
            }
        })
        .collect()
}

/// One member per control-plane instance group in each of `main` and `events`
pub fn build_etcd_clusters(
    control_planes: &[&InstanceGroup],
    provider: ProviderId,
) -> Vec<EtcdClusterSpec> {
    let mut groups: Vec<&InstanceGroup> = control_planes.to_vec();
    groups.sort_by(|a, b| a.name().cmp(b.name()));

    let names = trim_common_prefix(
        groups
            .iter()
            .map(|ig| {
                let n = ig.name();
                n.strip_prefix("control-plane-")
                    .or_else(|| n.strip_prefix("master-"))
                    .unwrap_or(n)
                    .to_string()
            })
            .collect(),
    );
    let encrypted = (provider == ProviderId::Aws).then_some(true);

    ETCD_CLUSTERS
        .iter()
        .map(|cluster| EtcdClusterSpec {
            name: cluster.to_string(),
            etcd_members: groups
                .iter()
                .zip(names.iter())
                .map(|(ig, member)| EtcdMemberSpec {
                    name: member.clone(),
                    instance_group: Some(ig.name().to_string()),
                    encrypted_volume: encrypted,
                })
                .collect(),
        })
        .collect()
}

fn default_sizes(role: InstanceGroupRole) -> (i32, i32) {
    match role {
        InstanceGroupRole::ControlPlane | InstanceGroupRole::Bastion => (1, 1),
        InstanceGroupRole::ApiServer | InstanceGroupRole::Node => (2, 2),
    }
}

/// Fill instance group defaults from the (completed) cluster
pub fn complete_instance_group(cluster: &Cluster, ig: &InstanceGroup) -> Result<InstanceGroup> {
    let mut g = ig.clone();
    let role = g.spec.role;

    if let Some(provider) = cluster.spec.cloud_provider {
        if g.spec.machine_type.is_none() {
            g.spec.machine_type = default_machine_type(provider, role).map(str::to_string);
        }
        if g.spec.image.is_none() {
            let channel = Channel::find(cluster.spec.channel.as_deref().unwrap_or(DEFAULT_CHANNEL))?;
            g.spec.image = channel.default_image(provider).map(str::to_string);
        }
    }

    let (default_min, default_max) = default_sizes(role);
    match (g.spec.min_size, g.spec.max_size) {
        (None, None) => {
            g.spec.min_size = Some(default_min);
            g.spec.max_size = Some(default_max);
        }
        (Some(min), None) => g.spec.max_size = Some(min.max(default_max)),
        (None, Some(max)) => g.spec.min_size = Some(default_min.min(max)),
        (Some(_), Some(_)) => {}
    }

    if g.spec.subnets.is_empty() && role != InstanceGroupRole::ControlPlane {
        g.spec.subnets = default_subnets(cluster, role);
    }

    Ok(g)
}

fn default_subnets(cluster: &Cluster, role: InstanceGroupRole) -> Vec<String> {
    let private_nodes = cluster
        .spec
        .topology
        .as_ref()
        .is_some_and(|t| t.nodes == TopologyKind::Private);
    let wanted = match role {
        InstanceGroupRole::Bastion if private_nodes => SubnetType::Utility,
        _ if private_nodes => SubnetType::Private,
        _ => SubnetType::Public,
    };
    cluster
        .spec
        .subnets
        .iter()
        .filter(|s| s.subnet_type == wanted)
        .map(|s| s.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClusterSubnetSpec;

    fn subnet(name: &str, t: SubnetType) -> ClusterSubnetSpec {
        ClusterSubnetSpec {
            name: name.to_string(),
            zone: name.trim_start_matches("utility-").to_string(),
            subnet_type: t,
            ..Default::default()
        }
    }

    fn ha_cluster() -> (Cluster, Vec<InstanceGroup>) {
        let mut c = Cluster::new("ha.example.com");
        let mut igs = Vec::new();
        for z in ["us-test-1a", "us-test-1b", "us-test-1c"] {
            c.spec.subnets.push(subnet(z, SubnetType::Public));
            let mut ig = InstanceGroup::new(format!("master-{}", z), InstanceGroupRole::ControlPlane);
            ig.spec.subnets.push(z.to_string());
            igs.push(ig);
        }
        igs.push(InstanceGroup::new("nodes", InstanceGroupRole::Node));
        (c, igs)
    }

    #[test]
    fn test_complete_minimal_aws() {
        let (c, igs) = ha_cluster();
        let full = complete_cluster(&c, &igs, Some("aa:bb")).unwrap();
        assert_eq!(full.spec.cloud_provider, Some(ProviderId::Aws));
        assert_eq!(full.spec.kubernetes_version.as_deref(), Some("1.31.4"));
        assert_eq!(full.spec.network_cidr.as_deref(), Some("172.20.0.0/16"));
        assert_eq!(full.spec.service_cluster_ip_range.as_deref(), Some("100.64.0.0/13"));
        assert_eq!(full.spec.master_public_name.as_deref(), Some("api.ha.example.com"));
        assert_eq!(
            full.spec.master_internal_name.as_deref(),
            Some("api.internal.ha.example.com")
        );
        assert_eq!(
            full.spec.ssh_key_name.as_deref(),
            Some("kubernetes.ha.example.com-aa:bb")
        );
        let cidrs: Vec<_> = full
            .spec
            .subnets
            .iter()
            .map(|s| s.cidr.clone().unwrap())
            .collect();
        assert_eq!(cidrs, vec!["172.20.0.0/19", "172.20.32.0/19", "172.20.64.0/19"]);
    }

    #[test]
    fn test_completion_is_idempotent() {
        let (c, igs) = ha_cluster();
        let once = complete_cluster(&c, &igs, Some("aa:bb")).unwrap();
        let twice = complete_cluster(&once, &igs, Some("aa:bb")).unwrap();
        assert_eq!(once, twice);

        let ig = complete_instance_group(&once, &igs[3]).unwrap();
        assert_eq!(complete_instance_group(&once, &ig).unwrap(), ig);
    }

    #[test]
    fn test_etcd_members_named_after_zones() {
        let (c, igs) = ha_cluster();
        let full = complete_cluster(&c, &igs, None).unwrap();
        assert_eq!(full.spec.etcd_clusters.len(), 2);
        let main = &full.spec.etcd_clusters[0];
        assert_eq!(main.name, "main");
        let names: Vec<_> = main.etcd_members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(
            main.etcd_members[0].instance_group.as_deref(),
            Some("master-us-test-1a")
        );
    }

    #[test]
    fn test_even_control_planes_not_completed() {
        let (c, mut igs) = ha_cluster();
        igs.retain(|ig| ig.name() != "master-us-test-1c");
        let err = complete_cluster(&c, &igs, None).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("odd-quorum"), "{err}");
    }

    #[test]
    fn test_utility_subnets_from_last_block() {
        let mut c = Cluster::new("p.example.com");
        c.spec.cloud_provider = Some(ProviderId::Aws);
        c.spec.network_cidr = Some("172.20.0.0/16".to_string());
        c.spec.subnets.push(subnet("us-test-1a", SubnetType::Private));
        c.spec.subnets.push(subnet("utility-us-test-1a", SubnetType::Utility));
        assign_subnet_cidrs(&mut c).unwrap();
        assert_eq!(c.spec.subnets[0].cidr.as_deref(), Some("172.20.0.0/19"));
        assert_eq!(c.spec.subnets[1].cidr.as_deref(), Some("172.20.224.0/22"));
    }

    #[test]
    fn test_carving_skips_taken_blocks() {
        let mut c = Cluster::new("p.example.com");
        c.spec.network_cidr = Some("10.0.0.0/16".to_string());
        let mut taken = subnet("a", SubnetType::Public);
        taken.cidr = Some("10.0.0.0/20".to_string());
        c.spec.subnets.push(taken);
        c.spec.subnets.push(subnet("b", SubnetType::Public));
        assign_subnet_cidrs(&mut c).unwrap();
        assert_eq!(c.spec.subnets[1].cidr.as_deref(), Some("10.0.32.0/19"));
    }

    #[test]
    fn test_shared_subnets_untouched() {
        let mut c = Cluster::new("s.example.com");
        c.spec.network_cidr = Some("10.0.0.0/16".to_string());
        let mut shared = subnet("us-test-1a", SubnetType::Public);
        shared.id = Some("subnet-12345678".to_string());
        c.spec.subnets.push(shared);
        assign_subnet_cidrs(&mut c).unwrap();
        assert!(c.spec.subnets[0].cidr.is_none());
    }

    #[test]
    fn test_provider_required_when_ambiguous() {
        let mut c = Cluster::new("x.example.com");
        c.spec.subnets.push(subnet("zone-one", SubnetType::Public));
        assert!(matches!(
            complete_cluster(&c, &[], None),
            Err(CoreError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_instance_group_defaults() {
        let (c, igs) = ha_cluster();
        let full = complete_cluster(&c, &igs, None).unwrap();
        let nodes = complete_instance_group(&full, &igs[3]).unwrap();
        assert_eq!(nodes.spec.machine_type.as_deref(), Some("t3.medium"));
        assert_eq!(nodes.spec.min_size, Some(2));
        assert_eq!(nodes.spec.max_size, Some(2));
        assert_eq!(nodes.spec.subnets.len(), 3);
        assert!(nodes.spec.image.is_some());

        let mut sized = igs[3].clone();
        sized.spec.min_size = Some(4);
        let sized = complete_instance_group(&full, &sized).unwrap();
        assert_eq!(sized.spec.max_size, Some(4));
    }

    #[test]
    fn test_trim_common_prefix() {
        assert_eq!(
            trim_common_prefix(vec!["us-test-1a".into()]),
            vec!["a".to_string()]
        );
        assert_eq!(
            trim_common_prefix(vec!["1a".into(), "1b".into()]),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            trim_common_prefix(vec!["a1".into(), "a2".into()]),
            vec!["etcd-1".to_string(), "etcd-2".to_string()]
        );
    }
}
