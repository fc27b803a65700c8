use crate::GlobalArgs;
use crate::output::Table;
use crate::utils;
use anyhow::bail;
use colored::Colorize;
use kopsflow_cloud::build_cloud;
use kopsflow_cloudup::CA_KEYSETS;
use kopsflow_pki::{Keystore, names};
use kopsflow_rollout::{CaRotation, ClusterRotationDriver, RollingUpdateOptions, keyset_stage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// `ca` stands for every CA keyset; anything else is a keyset name
fn expand_keysets(requested: &[String]) -> Vec<String> {
    let mut keysets: Vec<String> = Vec::new();
    for name in requested {
        let expanded: Vec<String> = if name == "ca" || name == "all" {
            CA_KEYSETS.iter().map(|s| s.to_string()).collect()
        } else {
            vec![name.clone()]
        };
        for keyset in expanded {
            if !keysets.contains(&keyset) {
                keysets.push(keyset);
            }
        }
    }
    keysets
}

pub async fn handle_keypair(
    global: &GlobalArgs,
    requested: &[String],
    yes: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let keysets = expand_keysets(requested);

    let keystore = session.clientset.key_store(&cluster);
    let mut table = Table::new(&["KEYSET", "STAGE", "PRIMARY", "ITEMS"]);
    for keyset in &keysets {
        match keystore.find_keyset(keyset).await? {
            Some(found) => table.row(vec![
                keyset.clone(),
                format!("{:?}", keyset_stage(&found)),
                found.primary_id().unwrap_or_default().to_string(),
                found.items().len().to_string(),
            ]),
            None => table.row(vec![keyset.clone(), "Missing".into(), String::new(), "0".into()]),
        }
    }
    table.print();

    if !yes {
        utils::print_yes_hint("rotate the keypairs");
        return Ok(());
    }

    let cloud = build_cloud(&cluster).await?;
    let mut driver = ClusterRotationDriver::new(
        session.clientset.clone(),
        name.clone(),
        cloud,
        session.hash_resolver()?,
        RollingUpdateOptions::default(),
    )
    .with_cancel(cancel);
    match utils::kube_client().await {
        Ok(kube) => driver = driver.with_kube(kube),
        Err(e) => tracing::warn!("Rolling without Kubernetes API access: {:#}", e),
    }

    println!();
    println!("{}", format!("Rotating {} keysets of {}...", keysets.len(), name).blue());
    let report = CaRotation::new(session.clientset.clone(), cluster, Arc::new(driver))
        .with_keysets(keysets)
        .run()
        .await?;
    for step in &report.steps {
        println!("  {} {}", "-".dimmed(), step);
    }
    println!("{}", format!("✓ Keypair rotation completed for cluster {name}").green().bold());
    Ok(())
}

/// Secrets backed by a keyset rotate through that keyset
pub async fn handle_secret(
    global: &GlobalArgs,
    secret: &str,
    yes: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if secret != names::SERVICE_ACCOUNT {
        bail!("rotating secret {secret:?} is not supported; only {} can be rotated", names::SERVICE_ACCOUNT);
    }
    handle_keypair(global, &[names::SERVICE_ACCOUNT.to_string()], yes, cancel).await
}
