use crate::GlobalArgs;
use crate::output::Table;
use crate::utils;
use anyhow::bail;
use colored::Colorize;
use kopsflow_cloud::{CloudInstance, build_cloud, delete_resources};
use kopsflow_pki::{Keystore, SecretStore};
use kopsflow_rollout::{DrainOptions, Drainer};
use std::fmt::Display;
use tokio_util::sync::CancellationToken;

/// Deleting something that is already gone succeeds
fn nothing_to_delete(what: impl Display) {
    println!("{}", format!("{what} not found, nothing to delete").dimmed());
}

pub async fn handle_cluster(
    global: &GlobalArgs,
    cluster: Option<String>,
    yes: bool,
    unregister: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(cluster, global)?;
    let session = utils::session(global).await?;
    let Some(cluster) = session.clientset.get_cluster(&name).await? else {
        nothing_to_delete(format_args!("Cluster {name}"));
        return Ok(());
    };

    if !unregister {
        let cloud = build_cloud(&cluster).await?;
        let trackers = cloud.list_resources(&name).await?;

        let mut table = Table::new(&["TYPE", "NAME", "ID", "SHARED"]);
        for tracker in &trackers {
            table.row(vec![
                tracker.kind.clone(),
                tracker.name.clone(),
                tracker.id.clone(),
                if tracker.shared { "shared".into() } else { String::new() },
            ]);
        }
        if table.is_empty() {
            println!("{}", "No cloud resources found".dimmed());
        } else {
            table.print();
        }

        if !yes {
            utils::print_yes_hint("delete the cluster");
            return Ok(());
        }

        println!();
        println!("{}", format!("Deleting cloud resources of {}...", name).blue());
        let report = delete_resources(cloud.as_ref(), trackers, &cancel).await?;
        for (round, deleted) in report.rounds.iter().enumerate() {
            tracing::info!(round, count = deleted.len(), "Deleted resources");
        }
        println!("  deleted {} resources", report.deleted().count());
        for retained in &report.retained {
            println!("  {} {} (shared, left in place)", "-".dimmed(), retained);
        }
    } else if !yes {
        utils::print_yes_hint("unregister the cluster");
        return Ok(());
    }

    session.clientset.delete_cluster(&name).await?;
    println!("{} {}", "✓ Deleted cluster".green().bold(), name.cyan());
    Ok(())
}

pub async fn handle_instance(
    global: &GlobalArgs,
    instance: &str,
    yes: bool,
    surge: bool,
    cloud_only: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let (cluster, instance_groups) = session.load(&name).await?;
    let cloud = build_cloud(&cluster).await?;
    let kube = if cloud_only {
        None
    } else {
        Some(utils::kube_client().await?)
    };
    let nodes = match &kube {
        Some(kube) => Some(utils::node_infos(kube.as_ref()).await?),
        None => None,
    };

    let groups = cloud
        .get_cloud_groups(&cluster, &instance_groups, false, nodes.as_deref())
        .await?;
    let found: Option<(String, CloudInstance)> = groups
        .values()
        .flat_map(|g| g.members().map(move |m| (g.instance_group.name().to_string(), m.clone())))
        .find(|(_, m)| m.id == instance || m.node.as_ref().is_some_and(|n| n.name == instance));
    let Some((group, member)) = found else {
        nothing_to_delete(format_args!("Instance {instance} of cluster {name}"));
        return Ok(());
    };

    let node = member.node.as_ref().map(|n| n.name.clone());
    println!(
        "Instance {} of group {}{}",
        member.id.cyan(),
        group.cyan(),
        node.as_deref().map(|n| format!(" (node {n})")).unwrap_or_default()
    );
    if !yes {
        utils::print_yes_hint("delete the instance");
        return Ok(());
    }

    if let (Some(kube), Some(node)) = (&kube, &node) {
        println!("{}", format!("Draining {node}...").blue());
        Drainer::new(kube.as_ref(), DrainOptions::default())
            .drain(node, &cancel)
            .await?;
    }

    if surge {
        cloud.detach_instance(&member).await?;
        println!("{} {}", "✓ Detached instance".green().bold(), member.id.cyan());
    } else {
        cloud.delete_instance(&member).await?;
        if let (Some(kube), Some(node)) = (&kube, &node) {
            kube.delete_node(node).await?;
        }
        println!("{} {}", "✓ Deleted instance".green().bold(), member.id.cyan());
    }
    Ok(())
}

pub async fn handle_instance_group(global: &GlobalArgs, group: &str, yes: bool) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let (cluster, instance_groups) = session.load(&name).await?;
    let Some(ig) = instance_groups.iter().find(|ig| ig.name() == group) else {
        nothing_to_delete(format_args!("Instance group {group}"));
        return Ok(());
    };
    if ig.is_control_plane()
        && instance_groups.iter().filter(|g| g.is_control_plane()).count() == 1
    {
        bail!("{group} is the last control-plane instance group and cannot be deleted");
    }

    if !yes {
        println!("Instance group {} would be deleted with its cloud group", group.cyan());
        utils::print_yes_hint("delete the instance group");
        return Ok(());
    }

    // Without a cloud there is nothing to tear down but the registry entry
    match build_cloud(&cluster).await {
        Ok(cloud) => {
            let groups = cloud
                .get_cloud_groups(&cluster, std::slice::from_ref(ig), false, None)
                .await?;
            if let Some(cloud_group) = groups.get(group) {
                cloud.delete_group(cloud_group).await?;
                println!("  deleted cloud group {}", cloud_group.human_name);
            }
        }
        Err(e) => tracing::warn!("Not deleting cloud group: {}", e),
    }

    session.clientset.instance_groups_for(&cluster).delete(group).await?;
    println!("{} {}", "✓ Deleted instance group".green().bold(), group.cyan());
    Ok(())
}

pub async fn handle_keypair(global: &GlobalArgs, keyset: &str, id: &str) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    match session.clientset.key_store(&cluster).delete_keyset_item(keyset, id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            nothing_to_delete(format_args!("Item {id} of {keyset}"));
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }
    println!("{} {} from {}", "✓ Deleted item".green().bold(), id.cyan(), keyset);
    Ok(())
}

pub async fn handle_ssh_public_key(global: &GlobalArgs, yes: bool) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    if !yes {
        utils::print_yes_hint("delete the SSH public keys");
        return Ok(());
    }
    session
        .clientset
        .ssh_credential_store(&cluster)
        .delete_ssh_credentials()
        .await?;
    println!("{}", "✓ Deleted SSH public keys".green().bold());
    Ok(())
}

pub async fn handle_secret(global: &GlobalArgs, secret: &str) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let store = session.clientset.secret_store(&cluster);
    if store.find_secret(secret).await?.is_none() {
        nothing_to_delete(format_args!("Secret {secret}"));
        return Ok(());
    }
    store.delete_secret(secret).await?;
    println!("{} {}", "✓ Deleted secret".green().bold(), secret.cyan());
    Ok(())
}
