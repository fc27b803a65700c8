//! Leaf certificates and shared secrets the control plane needs

use super::{ModelBuilder, ModelContext};
use crate::error::{CloudupError, Result};
use crate::phase::Phase;
use kopsflow_core::net::Ipv4Cidr;
use kopsflow_fi::TaskMap;
use kopsflow_fi::tasks::{GeneratedSecret, Keypair};
use kopsflow_pki::{CertType, names};

/// Leaf keypairs signed by the kubernetes CA; dropping them makes the next
/// apply reissue them from the current primary
pub const LEAF_KEYPAIRS: [&str; 5] = [
    "kubernetes-master",
    "kubelet",
    "kube-proxy",
    "kubecfg",
    "kops-controller",
];

/// Secrets generated once and never rotated by apply
const SECRETS: [&str; 2] = ["admin", "kube"];

pub struct PkiModelBuilder;

impl PkiModelBuilder {
    fn apiserver_names(ctx: &ModelContext<'_>) -> Result<Vec<String>> {
        let spec = &ctx.cluster.spec;
        let mut names: Vec<String> = [
            "kubernetes",
            "kubernetes.default",
            "kubernetes.default.svc",
            "kubernetes.default.svc.cluster.local",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        names.extend(spec.master_public_name.iter().cloned());
        names.extend(spec.master_internal_name.iter().cloned());

        let range = spec.service_cluster_ip_range.as_deref().ok_or_else(|| {
            CloudupError::IncompleteCluster("serviceClusterIPRange is not set".into())
        })?;
        let range: Ipv4Cidr = range.parse().map_err(CloudupError::IncompleteCluster)?;
        // The first service address belongs to the kubernetes service.
        let first = u32::from(range.network()).saturating_add(1);
        names.push(std::net::Ipv4Addr::from(first).to_string());
        Ok(names)
    }
}

impl ModelBuilder for PkiModelBuilder {
    fn name(&self) -> &'static str {
        "pki"
    }

    fn phase(&self) -> Phase {
        Phase::Cluster
    }

    fn build(&self, ctx: &ModelContext<'_>, tasks: &mut TaskMap) -> Result<()> {
        let ca = names::KUBERNETES_CA;

        tasks.add(
            Keypair::new("kubernetes-master", "kubernetes-master", CertType::Server, ca)
                .with_alternate_names(Self::apiserver_names(ctx)?),
        )?;
        tasks.add(
            Keypair::new("kubelet", "kubelet", CertType::Client, ca)
                .with_organizations(vec!["system:nodes".into()]),
        )?;
        tasks.add(Keypair::new("kube-proxy", "system:kube-proxy", CertType::Client, ca))?;
        tasks.add(
            Keypair::new("kubecfg", "kubecfg", CertType::Client, ca)
                .with_organizations(vec!["system:masters".into()]),
        )?;
        if ctx.cluster.uses_kops_controller_bootstrap() {
            tasks.add(
                Keypair::new("kops-controller", "kops-controller", CertType::Server, ca)
                    .with_alternate_names(vec![format!(
                        "kops-controller.internal.{}",
                        ctx.cluster_name()
                    )]),
            )?;
        }

        for name in SECRETS {
            tasks.add(GeneratedSecret { name: name.into() })?;
        }
        Ok(())
    }
}
