//! Cluster and instance group validation
//!
//! Three levels: shape (required fields, enum values), structural (subnets
//! exist, CIDRs don't overlap, odd etcd quorum) and deep (cross-object
//! checks across the cluster and all its instance groups).

use crate::completion::zones_for_instance_group;
use crate::model::{Cluster, InstanceGroup, InstanceGroupRole, SubnetType};
use crate::net::Ipv4Cidr;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorKind {
    Required,
    Invalid,
    Duplicate,
    NotFound,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub kind: FieldErrorKind,
    pub field: String,
    pub detail: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FieldErrorKind::Required => "Required value",
            FieldErrorKind::Invalid => "Invalid value",
            FieldErrorKind::Duplicate => "Duplicate value",
            FieldErrorKind::NotFound => "Not found",
            FieldErrorKind::Forbidden => "Forbidden",
        };
        write!(f, "{}: {}: {}", self.field, kind, self.detail)
    }
}

/// Aggregated field errors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    pub(crate) fn push(&mut self, kind: FieldErrorKind, field: impl Into<String>, detail: impl Into<String>) {
        self.0.push(FieldError {
            kind,
            field: field.into(),
            detail: detail.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// RFC 1123 subdomain
fn is_dns_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

fn is_kubernetes_version(v: &str) -> bool {
    let v = v.strip_prefix('v').unwrap_or(v);
    let core = v.split(['-', '+']).next().unwrap_or("");
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.parse::<u64>().is_ok())
}

fn parse_cidr(
    errs: &mut ValidationErrors,
    field: &str,
    value: Option<&str>,
    required: bool,
) -> Option<Ipv4Cidr> {
    match value {
        None if required => {
            errs.push(FieldErrorKind::Required, field, "a CIDR is required");
            None
        }
        None => None,
        Some(v) => match v.parse::<Ipv4Cidr>() {
            Ok(c) => Some(c),
            Err(e) => {
                errs.push(FieldErrorKind::Invalid, field, e);
                None
            }
        },
    }
}

/// Shape and structural checks on a cluster alone
pub fn validate_cluster(cluster: &Cluster, strict: bool) -> ValidationErrors {
    let mut errs = ValidationErrors::default();
    let spec = &cluster.spec;
    let name = cluster.name();

    if name.is_empty() {
        errs.push(
            FieldErrorKind::Required,
            "metadata.name",
            "cluster name is required (e.g. --name=mycluster.example.com)",
        );
    } else if !is_dns_subdomain(name) {
        errs.push(FieldErrorKind::Invalid, "metadata.name", "must be a valid DNS name");
    } else if !name.contains('.') {
        errs.push(
            FieldErrorKind::Invalid,
            "metadata.name",
            "must be a fully-qualified DNS name (e.g. mycluster.example.com)",
        );
    }

    if spec.cloud_provider.is_none() {
        errs.push(FieldErrorKind::Required, "spec.cloudProvider", "cloud provider is required");
    }

    if spec.subnets.is_empty() {
        errs.push(
            FieldErrorKind::Required,
            "spec.subnets",
            "must configure at least one subnet (use --zones)",
        );
    }

    match spec.kubernetes_version.as_deref() {
        None if strict => errs.push(
            FieldErrorKind::Required,
            "spec.kubernetesVersion",
            "kubernetes version is required",
        ),
        Some(v) if !is_kubernetes_version(v) => errs.push(
            FieldErrorKind::Invalid,
            "spec.kubernetesVersion",
            format!("unable to parse kubernetes version {:?}", v),
        ),
        _ => {}
    }

    let network = parse_cidr(
        &mut errs,
        "spec.networkCIDR",
        spec.network_cidr.as_deref(),
        strict,
    );
    let non_masq = parse_cidr(
        &mut errs,
        "spec.nonMasqueradeCIDR",
        spec.non_masquerade_cidr.as_deref(),
        strict,
    );
    let service = parse_cidr(
        &mut errs,
        "spec.serviceClusterIPRange",
        spec.service_cluster_ip_range.as_deref(),
        strict,
    );
    if let (Some(net), Some(nm)) = (network, non_masq) {
        if net.overlaps(&nm) {
            errs.push(
                FieldErrorKind::Invalid,
                "spec.nonMasqueradeCIDR",
                format!("{} must not overlap the network CIDR {}", nm, net),
            );
        }
    }
    if let (Some(nm), Some(svc)) = (non_masq, service) {
        if !nm.contains(&svc) {
            errs.push(
                FieldErrorKind::Invalid,
                "spec.serviceClusterIPRange",
                format!("{} must be within the non-masquerade CIDR {}", svc, nm),
            );
        }
    }

    if let Some(networking) = &spec.networking {
        let selected = networking.selected();
        if selected.len() > 1 {
            errs.push(
                FieldErrorKind::Forbidden,
                "spec.networking",
                format!("only one networking option may be set, found {}", selected.join(", ")),
            );
        }
    }

    // Subnets
    let mut names = BTreeSet::new();
    let mut cidrs: Vec<(String, Ipv4Cidr)> = Vec::new();
    for (i, subnet) in spec.subnets.iter().enumerate() {
        let field = format!("spec.subnets[{}]", i);
        if subnet.name.is_empty() {
            errs.push(FieldErrorKind::Required, format!("{}.name", field), "subnet name is required");
        } else if !names.insert(subnet.name.clone()) {
            errs.push(
                FieldErrorKind::Duplicate,
                format!("{}.name", field),
                format!("subnet {:?} is declared twice", subnet.name),
            );
        }
        if subnet.zone.is_empty() {
            errs.push(FieldErrorKind::Required, format!("{}.zone", field), "subnet zone is required");
        }
        let required = strict && subnet.id.is_none();
        if let Some(cidr) = parse_cidr(&mut errs, &format!("{}.cidr", field), subnet.cidr.as_deref(), required) {
            if let Some(net) = network {
                if !net.contains(&cidr) && subnet.id.is_none() {
                    errs.push(
                        FieldErrorKind::Invalid,
                        format!("{}.cidr", field),
                        format!("{} is not within the network CIDR {}", cidr, net),
                    );
                }
            }
            for (other, other_cidr) in &cidrs {
                if cidr.overlaps(other_cidr) {
                    errs.push(
                        FieldErrorKind::Invalid,
                        format!("{}.cidr", field),
                        format!(
                            "{} of subnet {:?} overlaps {} of subnet {:?}",
                            cidr, subnet.name, other_cidr, other
                        ),
                    );
                }
            }
            cidrs.push((subnet.name.clone(), cidr));
        }
    }

    if spec.network_id.is_none() && spec.subnets.iter().any(|s| s.id.is_some()) {
        errs.push(
            FieldErrorKind::Forbidden,
            "spec.subnets",
            "shared subnets require spec.networkID",
        );
    }

    // Etcd
    if spec.etcd_clusters.is_empty() && strict {
        errs.push(
            FieldErrorKind::Required,
            "spec.etcdClusters",
            "at least one etcd cluster is required",
        );
    }
    for (i, etcd) in spec.etcd_clusters.iter().enumerate() {
        let field = format!("spec.etcdClusters[{}]", i);
        if etcd.name.is_empty() {
            errs.push(FieldErrorKind::Required, format!("{}.name", field), "etcd cluster name is required");
        }
        let count = etcd.etcd_members.len();
        if count == 0 {
            errs.push(
                FieldErrorKind::Required,
                format!("{}.etcdMembers", field),
                format!("no members defined in etcd cluster {:?}", etcd.name),
            );
        } else if count % 2 == 0 {
            errs.push(
                FieldErrorKind::Invalid,
                format!("{}.etcdMembers", field),
                format!(
                    "etcd cluster {:?} has {} members; an odd number of control-plane zones is required for etcd quorum (odd-quorum). Hint: use --zones and --master-zones to declare node zones and control-plane zones separately",
                    etcd.name, count
                ),
            );
        }
        let mut member_names = BTreeSet::new();
        for (j, member) in etcd.etcd_members.iter().enumerate() {
            if member.name.is_empty() {
                errs.push(
                    FieldErrorKind::Required,
                    format!("{}.etcdMembers[{}].name", field, j),
                    "member name is required",
                );
            } else if !member_names.insert(&member.name) {
                errs.push(
                    FieldErrorKind::Duplicate,
                    format!("{}.etcdMembers[{}].name", field, j),
                    format!("member {:?} is declared twice", member.name),
                );
            }
            if member.instance_group.is_none() {
                errs.push(
                    FieldErrorKind::Required,
                    format!("{}.etcdMembers[{}].instanceGroup", field, j),
                    "member instance group is required",
                );
            }
        }
    }

    for (field, list) in [
        ("spec.sshAccess", &spec.ssh_access),
        ("spec.kubernetesApiAccess", &spec.kubernetes_api_access),
    ] {
        for (i, cidr) in list.iter().enumerate() {
            if cidr.contains(':') {
                // IPv6 ranges are passed through to the cloud as-is
                continue;
            }
            if let Err(e) = cidr.parse::<Ipv4Cidr>() {
                errs.push(FieldErrorKind::Invalid, format!("{}[{}]", field, i), e);
            }
        }
    }

    errs
}

/// Checks on one instance group, against its cluster when given
pub fn validate_instance_group(
    ig: &InstanceGroup,
    cluster: Option<&Cluster>,
    strict: bool,
) -> ValidationErrors {
    let mut errs = ValidationErrors::default();
    let spec = &ig.spec;

    if ig.name().is_empty() {
        errs.push(FieldErrorKind::Required, "metadata.name", "instance group name is required");
    } else if !is_dns_subdomain(ig.name()) {
        errs.push(FieldErrorKind::Invalid, "metadata.name", "must be a valid DNS label");
    }

    if let Some(min) = spec.min_size {
        if min < 0 {
            errs.push(FieldErrorKind::Invalid, "spec.minSize", "must be non-negative");
        }
    }
    if let (Some(min), Some(max)) = (spec.min_size, spec.max_size) {
        if min > max {
            errs.push(
                FieldErrorKind::Invalid,
                "spec.maxSize",
                format!("maxSize ({}) must be at least minSize ({})", max, min),
            );
        }
    }
    if strict && spec.machine_type.is_none() {
        errs.push(FieldErrorKind::Required, "spec.machineType", "machine type is required");
    }
    if let Some(size) = spec.root_volume_size {
        if size <= 0 {
            errs.push(FieldErrorKind::Invalid, "spec.rootVolumeSize", "must be positive");
        }
    }

    if let Some(policy) = &spec.mixed_instances_policy {
        if policy.instances.is_empty() {
            errs.push(
                FieldErrorKind::Required,
                "spec.mixedInstancesPolicy.instances",
                "at least one instance type is required",
            );
        }
        if let Some(pct) = policy.on_demand_above_base {
            if !(0..=100).contains(&pct) {
                errs.push(
                    FieldErrorKind::Invalid,
                    "spec.mixedInstancesPolicy.onDemandAboveBase",
                    "must be between 0 and 100",
                );
            }
        }
        if let Some(base) = policy.on_demand_base {
            if base < 0 {
                errs.push(
                    FieldErrorKind::Invalid,
                    "spec.mixedInstancesPolicy.onDemandBase",
                    "must be non-negative",
                );
            }
        }
        if let Some(strategy) = policy.spot_allocation_strategy.as_deref() {
            if !["lowest-price", "capacity-optimized", "capacity-optimized-prioritized", "price-capacity-optimized"]
                .contains(&strategy)
            {
                errs.push(
                    FieldErrorKind::Invalid,
                    "spec.mixedInstancesPolicy.spotAllocationStrategy",
                    format!("unsupported strategy {:?}", strategy),
                );
            }
        }
    }

    for (i, taint) in spec.taints.iter().enumerate() {
        let effect = taint.rsplit_once(':').map(|(_, e)| e);
        if !matches!(effect, Some("NoSchedule" | "PreferNoSchedule" | "NoExecute")) {
            errs.push(
                FieldErrorKind::Invalid,
                format!("spec.taints[{}]", i),
                format!("{:?} must end in :NoSchedule, :PreferNoSchedule or :NoExecute", taint),
            );
        }
    }

    if spec.subnets.is_empty() {
        errs.push(FieldErrorKind::Required, "spec.subnets", "at least one subnet is required");
    }
    if let Some(cluster) = cluster {
        for (i, subnet) in spec.subnets.iter().enumerate() {
            match cluster.subnet(subnet) {
                None => errs.push(
                    FieldErrorKind::NotFound,
                    format!("spec.subnets[{}]", i),
                    format!("subnet {:?} is not defined in cluster {}", subnet, cluster.name()),
                ),
                Some(s) if s.subnet_type == SubnetType::Utility && ig.role() != InstanceGroupRole::Bastion => {
                    errs.push(
                        FieldErrorKind::Forbidden,
                        format!("spec.subnets[{}]", i),
                        format!("utility subnet {:?} may only host bastions", subnet),
                    )
                }
                Some(_) => {}
            }
        }
    }

    errs
}

/// Cluster plus every instance group, including cross-object invariants
pub fn deep_validate(
    cluster: &Cluster,
    instance_groups: &[InstanceGroup],
    strict: bool,
) -> Result<(), ValidationErrors> {
    let mut errs = validate_cluster(cluster, strict);

    if instance_groups.is_empty() {
        errs.push(FieldErrorKind::Required, "instanceGroups", "must configure at least one instance group");
    }
    let control_planes: Vec<&InstanceGroup> =
        instance_groups.iter().filter(|g| g.is_control_plane()).collect();
    if !instance_groups.is_empty() && control_planes.is_empty() {
        errs.push(
            FieldErrorKind::Required,
            "instanceGroups",
            "must configure at least one control-plane instance group",
        );
    }
    if strict && !instance_groups.iter().any(|g| g.role() == InstanceGroupRole::Node) {
        errs.push(FieldErrorKind::Required, "instanceGroups", "must configure at least one node instance group");
    }

    let mut seen = BTreeSet::new();
    for ig in instance_groups {
        if !seen.insert(ig.name()) {
            errs.push(
                FieldErrorKind::Duplicate,
                format!("instanceGroups[{}]", ig.name()),
                "instance group is declared twice",
            );
        }
        for e in validate_instance_group(ig, Some(cluster), strict).0 {
            errs.push(e.kind, format!("instanceGroups[{}].{}", ig.name(), e.field), e.detail);
        }
    }

    // Control-plane zones must form an odd set for etcd quorum
    let zones: BTreeSet<String> = control_planes
        .iter()
        .flat_map(|ig| zones_for_instance_group(cluster, ig))
        .collect();
    if !zones.is_empty() && zones.len() % 2 == 0 {
        errs.push(
            FieldErrorKind::Invalid,
            "instanceGroups",
            format!(
                "control-plane instance groups span {} zones; an odd number is required for etcd quorum (odd-quorum)",
                zones.len()
            ),
        );
    }

    for etcd in &cluster.spec.etcd_clusters {
        for member in &etcd.etcd_members {
            if let Some(group) = member.instance_group.as_deref() {
                match instance_groups.iter().find(|g| g.name() == group) {
                    None => errs.push(
                        FieldErrorKind::NotFound,
                        format!("spec.etcdClusters[{}].etcdMembers[{}]", etcd.name, member.name),
                        format!("instance group {:?} does not exist", group),
                    ),
                    Some(g) if !g.is_control_plane() => errs.push(
                        FieldErrorKind::Invalid,
                        format!("spec.etcdClusters[{}].etcdMembers[{}]", etcd.name, member.name),
                        format!("instance group {:?} is not a control-plane group", group),
                    ),
                    Some(_) => {}
                }
            }
        }
    }

    errs.into_result()
}
