use crate::GlobalArgs;
use crate::utils;
use anyhow::{anyhow, bail};
use colored::Colorize;
use kopsflow_core::codec::{self, AnyObject};
use kopsflow_core::validation::{validate_cluster, validate_instance_group};
use kopsflow_core::{Cluster, InstanceGroup};
use std::path::Path;

/// Instance groups name their cluster with this label in multi-cluster manifests
const CLUSTER_LABEL: &str = "kops.k8s.io/cluster";

/// Which cluster an instance group in the manifest belongs to
fn owning_cluster(ig: &InstanceGroup, global: &GlobalArgs, clusters: &[&Cluster]) -> anyhow::Result<String> {
    if let Some(name) = ig.metadata.labels.get(CLUSTER_LABEL) {
        return Ok(name.clone());
    }
    if let Some(name) = &global.name {
        return Ok(name.clone());
    }
    match clusters {
        [only] => Ok(only.name().to_string()),
        _ => Err(anyhow!(
            "cannot tell which cluster instance group {} belongs to; pass --name or label it {CLUSTER_LABEL}",
            ig.name()
        )),
    }
}

pub async fn handle(global: &GlobalArgs, filename: &Path, force: bool) -> anyhow::Result<()> {
    let data = utils::read_file(filename)?;
    let objects = codec::decode_documents(data.as_bytes())?;
    if objects.is_empty() {
        bail!("{} contains no objects", filename.display());
    }
    let session = utils::session(global).await?;

    let clusters: Vec<&Cluster> = objects
        .iter()
        .filter_map(|o| match o {
            AnyObject::Cluster(c) => Some(c),
            AnyObject::InstanceGroup(_) => None,
        })
        .collect();

    // Clusters first so instance groups of a new cluster have a parent
    for cluster in &clusters {
        validate_cluster(cluster, false)
            .into_result()
            .map_err(|errors| anyhow!("cluster {} is invalid:\n{errors}", cluster.name()))?;
        if session.clientset.get_cluster(cluster.name()).await?.is_some() {
            session.clientset.update_cluster(cluster, None).await?;
            println!("{} {}", "✓ Replaced cluster".green().bold(), cluster.name().cyan());
        } else if force {
            session.clientset.create_cluster(cluster).await?;
            println!("{} {}", "✓ Created cluster".green().bold(), cluster.name().cyan());
        } else {
            bail!("cluster {} does not exist; use --force to create it", cluster.name());
        }
    }

    for object in &objects {
        let AnyObject::InstanceGroup(ig) = object else {
            continue;
        };
        let cluster_name = owning_cluster(ig, global, &clusters)?;
        let cluster = session.clientset.require_cluster(&cluster_name).await?;
        validate_instance_group(ig, Some(&cluster), false)
            .into_result()
            .map_err(|errors| anyhow!("instance group {} is invalid:\n{errors}", ig.name()))?;

        let client = session.clientset.instance_groups_for(&cluster);
        if client.get(ig.name()).await?.is_some() {
            client.update(ig).await?;
            println!("{} {}", "✓ Replaced instance group".green().bold(), ig.name().cyan());
        } else if force {
            client.create(ig).await?;
            println!("{} {}", "✓ Created instance group".green().bold(), ig.name().cyan());
        } else {
            bail!(
                "instance group {} does not exist in cluster {cluster_name}; use --force to create it",
                ig.name()
            );
        }
    }
    Ok(())
}
