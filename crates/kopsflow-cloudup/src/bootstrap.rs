//! Boot-time configuration for instance group machines
//!
//! Each instance group gets a nodeup configuration published to the
//! registry and a user-data script that fetches it, checks its hash and
//! hands over to nodeup. Output depends only on the inputs, so an unchanged
//! cluster renders byte-identical user data.

use crate::assets::{AssetList, sha256_hex};
use crate::error::{CloudupError, Result};
use kopsflow_core::{Cluster, InstanceGroup, InstanceGroupRole, UserData};
use serde::Serialize;
use std::collections::BTreeMap;

const MIME_BOUNDARY: &str = "MIMEBOUNDARY";

/// Template for nodes that run nodeup
const NODEUP_SCRIPT: &str = r#"#!/bin/bash
set -o errexit
set -o nounset
set -o pipefail

NODEUP_CONFIG_URL={{CONFIG_URL}}
NODEUP_CONFIG_HASH={{CONFIG_HASH}}
{{ASSET_VARS}}
INSTALL_DIR=/opt/kops

download_or_bust() {
  local url="$1"
  local file="$2"
  local hash="$3"
  for attempt in 1 2 3 4 5; do
    if curl -fsSL --retry 3 -o "${file}" "${url}"; then
      if [[ -z "${hash}" ]] || echo "${hash}  ${file}" | sha256sum -c - >/dev/null; then
        return 0
      fi
      echo "== hash mismatch for ${url} =="
      rm -f "${file}"
    fi
    echo "== download of ${url} failed (attempt ${attempt}) =="
    sleep 10
  done
  echo "== giving up on ${url} =="
  exit 1
}

echo "== kops bootstrap: cluster {{CLUSTER_NAME}}, group {{INSTANCE_GROUP}} ({{ROLE}}) =="
mkdir -p "${INSTALL_DIR}/bin"
cd "${INSTALL_DIR}"

download_or_bust "${NODEUP_CONFIG_URL}" nodeupconfig.yaml "${NODEUP_CONFIG_HASH}"
{{ASSET_DOWNLOADS}}
chmod +x bin/*

echo "== running nodeup =="
"${INSTALL_DIR}/bin/nodeup" --conf="${INSTALL_DIR}/nodeupconfig.yaml" --v=8
echo "== kops bootstrap complete =="
"#;

/// Bastions only need SSH
const BASTION_SCRIPT: &str = r#"#!/bin/bash
set -o errexit
echo "== kops bastion: cluster {{CLUSTER_NAME}}, group {{INSTANCE_GROUP}} =="
"#;

/// What nodeup reads at boot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeupConfig {
    pub cluster_name: String,
    pub instance_group: String,
    pub role: InstanceGroupRole,
    pub kubernetes_version: String,
    pub config_base: String,
    pub api_server: String,
    /// `<sha256>@<url>`
    pub assets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// PEM trust bundle of the cluster CA
    pub ca_certificates: String,
    pub use_kops_controller_bootstrap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networking: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub etcd_clusters: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

/// Rendered boot material for one instance group
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapScript {
    pub instance_group: String,
    /// Registry path of the nodeup config, relative to the cluster root;
    /// bastions have none
    pub config_location: Option<String>,
    pub config: Option<String>,
    pub user_data: String,
}

/// Registry location of an instance group's nodeup config
pub fn nodeup_config_location(ig: &InstanceGroup) -> String {
    format!(
        "igconfig/{}/{}/nodeupconfig.yaml",
        ig.role().as_str().to_ascii_lowercase(),
        ig.name()
    )
}

pub struct BootstrapScriptBuilder<'a> {
    cluster: &'a Cluster,
    assets: &'a AssetList,
    ca_bundle: &'a str,
}

impl<'a> BootstrapScriptBuilder<'a> {
    pub fn new(cluster: &'a Cluster, assets: &'a AssetList, ca_bundle: &'a str) -> Self {
        Self {
            cluster,
            assets,
            ca_bundle,
        }
    }

    fn nodeup_config(&self, ig: &InstanceGroup) -> Result<NodeupConfig> {
        let spec = &self.cluster.spec;
        let config_base = spec
            .config_base
            .clone()
            .ok_or_else(|| CloudupError::IncompleteCluster("configBase is not set".into()))?;
        let kubernetes_version = spec
            .kubernetes_version
            .clone()
            .ok_or_else(|| CloudupError::IncompleteCluster("kubernetesVersion is not set".into()))?;
        let internal_name = spec
            .master_internal_name
            .clone()
            .unwrap_or_else(|| format!("api.internal.{}", self.cluster.name()));

        let control_plane = ig.is_control_plane();
        Ok(NodeupConfig {
            cluster_name: self.cluster.name().to_string(),
            instance_group: ig.name().to_string(),
            role: ig.role(),
            kubernetes_version,
            config_base: config_base.clone(),
            api_server: format!("https://{internal_name}"),
            assets: self.assets.files.iter().map(|f| f.pinned()).collect(),
            images: if control_plane {
                self.assets.images.clone()
            } else {
                Vec::new()
            },
            ca_certificates: self.ca_bundle.to_string(),
            use_kops_controller_bootstrap: self.cluster.uses_kops_controller_bootstrap(),
            networking: spec
                .networking
                .as_ref()
                .and_then(|n| n.selected().first().map(|s| s.to_string())),
            node_labels: ig.spec.node_labels.clone(),
            taints: ig.spec.taints.clone(),
            etcd_clusters: if control_plane {
                spec.etcd_clusters.iter().map(|e| e.name.clone()).collect()
            } else {
                Vec::new()
            },
            channels: if control_plane {
                spec.addons.iter().map(|a| a.manifest.clone()).collect()
            } else {
                Vec::new()
            },
        })
    }

    pub fn build(&self, ig: &InstanceGroup) -> Result<BootstrapScript> {
        if ig.role() == InstanceGroupRole::Bastion {
            let script = BASTION_SCRIPT
                .replace("{{CLUSTER_NAME}}", self.cluster.name())
                .replace("{{INSTANCE_GROUP}}", ig.name());
            return Ok(BootstrapScript {
                instance_group: ig.name().to_string(),
                config_location: None,
                config: None,
                user_data: with_additional_user_data(script, &ig.spec.additional_user_data),
            });
        }

        let config = self.nodeup_config(ig)?;
        let rendered = serde_yaml::to_string(&config)?;
        let location = nodeup_config_location(ig);
        let config_url = format!("{}/{}", config.config_base.trim_end_matches('/'), location);

        let mut asset_vars = String::new();
        let mut asset_downloads = String::new();
        for asset in &self.assets.files {
            let var = asset.name.to_ascii_uppercase().replace('-', "_");
            asset_vars.push_str(&format!("{var}_URL={}\n{var}_HASH={}\n", asset.url, asset.sha256));
            asset_downloads.push_str(&format!(
                "download_or_bust \"${{{var}_URL}}\" \"bin/{}\" \"${{{var}_HASH}}\"\n",
                asset.name
            ));
        }

        let script = NODEUP_SCRIPT
            .replace("{{CONFIG_URL}}", &config_url)
            .replace("{{CONFIG_HASH}}", &sha256_hex(rendered.as_bytes()))
            .replace("{{ASSET_VARS}}", asset_vars.trim_end())
            .replace("{{ASSET_DOWNLOADS}}", asset_downloads.trim_end())
            .replace("{{CLUSTER_NAME}}", self.cluster.name())
            .replace("{{INSTANCE_GROUP}}", ig.name())
            .replace("{{ROLE}}", ig.role().as_str());

        Ok(BootstrapScript {
            instance_group: ig.name().to_string(),
            config_location: Some(location),
            config: Some(rendered),
            user_data: with_additional_user_data(script, &ig.spec.additional_user_data),
        })
    }
}

/// Wrap the boot script and any extra parts in a MIME multipart document
fn with_additional_user_data(script: String, extra: &[UserData]) -> String {
    if extra.is_empty() {
        return script;
    }
    let mut out = format!(
        "Content-Type: multipart/mixed; boundary=\"{MIME_BOUNDARY}\"\nMIME-Version: 1.0\n\n"
    );
    let mut part = |name: &str, content_type: &str, content: &str| {
        out.push_str(&format!(
            "--{MIME_BOUNDARY}\nContent-Disposition: attachment; filename=\"{name}\"\n\
             Content-Transfer-Encoding: 7bit\nContent-Type: {content_type}\nMime-Version: 1.0\n\n{content}\n"
        ));
    };
    part("nodeup.sh", "text/x-shellscript", &script);
    for data in extra {
        part(&data.name, &data.content_type, &data.content);
    }
    out.push_str(&format!("--{MIME_BOUNDARY}--\n"));
    out
}
