//! Built-in release channels

use crate::error::{CoreError, Result};
use crate::model::{InstanceGroupRole, ProviderId};

pub const DEFAULT_CHANNEL: &str = "stable";

/// Recommended versions and images for a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: &'static str,
    pub kubernetes_version: &'static str,
}

const CHANNELS: &[Channel] = &[
    Channel {
        name: "stable",
        kubernetes_version: "1.31.4",
    },
    Channel {
        name: "alpha",
        kubernetes_version: "1.32.0",
    },
];

impl Channel {
    pub fn find(name: &str) -> Result<&'static Channel> {
        CHANNELS
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CoreError::UnknownChannel(name.to_string()))
    }

    /// Default OS image for a provider
    pub fn default_image(&self, provider: ProviderId) -> Option<&'static str> {
        match provider {
            ProviderId::Aws => {
                Some("099720109477/ubuntu/images/hvm-ssd-gp3/ubuntu-noble-24.04-amd64-server-20241109")
            }
            ProviderId::Gce => Some("ubuntu-os-cloud/ubuntu-2404-noble-amd64-v20241115"),
            ProviderId::Azure => Some("Canonical:ubuntu-24_04-lts:server:24.04.202411030"),
            ProviderId::Digitalocean => Some("ubuntu-24-04-x64"),
            ProviderId::Hetzner => Some("ubuntu-24.04"),
            ProviderId::Openstack => Some("Ubuntu-24.04"),
            ProviderId::Vsphere => None,
        }
    }
}

/// Default machine type for a provider and role
pub fn default_machine_type(provider: ProviderId, role: InstanceGroupRole) -> Option<&'static str> {
    let bastion = role == InstanceGroupRole::Bastion;
    match provider {
        ProviderId::Aws => Some(if bastion { "t3.micro" } else { "t3.medium" }),
        ProviderId::Gce => Some(if bastion { "e2-micro" } else { "e2-medium" }),
        ProviderId::Azure => Some(if bastion { "Standard_B1s" } else { "Standard_B2ms" }),
        ProviderId::Digitalocean => Some(if bastion { "s-1vcpu-1gb" } else { "s-2vcpu-4gb" }),
        ProviderId::Hetzner => Some(if bastion { "cx22" } else { "cx32" }),
        ProviderId::Openstack | ProviderId::Vsphere => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find() {
        assert_eq!(Channel::find("stable").unwrap().kubernetes_version, "1.31.4");
        assert!(matches!(
            Channel::find("nightly"),
            Err(CoreError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(
            default_machine_type(ProviderId::Aws, InstanceGroupRole::Bastion),
            Some("t3.micro")
        );
        assert!(default_machine_type(ProviderId::Openstack, InstanceGroupRole::Node).is_none());
    }
}
