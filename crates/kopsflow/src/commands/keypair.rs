use crate::GlobalArgs;
use crate::utils;
use anyhow::anyhow;
use colored::Colorize;
use kopsflow_pki::{Keyset, Keystore, compare_ids};

async fn load(global: &GlobalArgs, keyset: &str) -> anyhow::Result<(utils::Session, kopsflow_core::Cluster, Keyset)> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let found = session.clientset.key_store(&cluster).get_keyset(keyset).await?;
    Ok((session, cluster, found))
}

/// Promote `id`, or the newest staged item when no id is given
pub async fn handle_promote(global: &GlobalArgs, keyset: &str, id: Option<String>) -> anyhow::Result<()> {
    let (session, cluster, mut found) = load(global, keyset).await?;
    let id = match id {
        Some(id) => id,
        None => found
            .staged_items()
            .iter()
            .map(|i| i.id.as_str())
            .max_by(|a, b| compare_ids(a, b))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("keyset {keyset} has no staged item to promote"))?,
    };
    found.promote(&id)?;
    session.clientset.key_store(&cluster).store_keyset(&found).await?;
    println!("{} {} of {}", "✓ Promoted item".green().bold(), id.cyan(), keyset);
    Ok(())
}

/// Distrust `ids`, or every item except the primary when none are given
pub async fn handle_distrust(global: &GlobalArgs, keyset: &str, ids: &[String]) -> anyhow::Result<()> {
    let (session, cluster, mut found) = load(global, keyset).await?;
    let ids: Vec<String> = if ids.is_empty() {
        found
            .items()
            .iter()
            .filter(|i| found.primary_id() != Some(i.id.as_str()) && !i.is_distrusted())
            .map(|i| i.id.clone())
            .collect()
    } else {
        ids.to_vec()
    };
    if ids.is_empty() {
        println!("{}", format!("No items of {keyset} left to distrust").dimmed());
        return Ok(());
    }

    let now = chrono::Utc::now();
    for id in &ids {
        found.distrust(id, now)?;
    }
    session.clientset.key_store(&cluster).store_keyset(&found).await?;
    println!("{} {} of {}", "✓ Distrusted".green().bold(), ids.join(", ").cyan(), keyset);
    Ok(())
}

pub async fn handle_trust(global: &GlobalArgs, keyset: &str, ids: &[String]) -> anyhow::Result<()> {
    let (session, cluster, mut found) = load(global, keyset).await?;
    for id in ids {
        found.trust(id)?;
    }
    session.clientset.key_store(&cluster).store_keyset(&found).await?;
    println!("{} {} of {}", "✓ Trusted".green().bold(), ids.join(", ").cyan(), keyset);
    Ok(())
}
