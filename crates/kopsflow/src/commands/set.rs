use crate::GlobalArgs;
use crate::fieldpath;
use crate::utils;
use anyhow::{anyhow, bail};
use colored::Colorize;
use kopsflow_core::validation::{validate_cluster, validate_instance_group};
use serde_json::Value;
use std::collections::BTreeMap;

/// Flattened spec fields the model does not know absorb typos, so any
/// key that appears only after the edit is rejected
fn reject_new_unknown_fields(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> anyhow::Result<()> {
    if let Some(key) = after.keys().find(|k| !before.contains_key(*k)) {
        bail!("unknown field spec.{key}");
    }
    Ok(())
}

fn verb(unset: bool) -> &'static str {
    if unset { "Unset" } else { "Set" }
}

pub async fn handle_cluster(global: &GlobalArgs, fields: &[String], unset: bool) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;

    let updated = fieldpath::apply(&cluster, fields, unset)?;
    reject_new_unknown_fields(&cluster.spec.unknown_fields, &updated.spec.unknown_fields)?;
    validate_cluster(&updated, false)
        .into_result()
        .map_err(|errors| anyhow!("cluster {name} is invalid after the change:\n{errors}"))?;

    session.clientset.update_cluster(&updated, None).await?;
    println!(
        "{} {} on cluster {}",
        format!("✓ {}", verb(unset)).green().bold(),
        fields.join(", "),
        name.cyan()
    );
    Ok(())
}

pub async fn handle_instance_group(
    global: &GlobalArgs,
    group: &str,
    fields: &[String],
    unset: bool,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let client = session.clientset.instance_groups_for(&cluster);
    let ig = client.require(group).await?;

    let updated = fieldpath::apply(&ig, fields, unset)?;
    if updated.name() != ig.name() {
        bail!("the name of instance group {group} cannot be changed");
    }
    reject_new_unknown_fields(&ig.spec.unknown_fields, &updated.spec.unknown_fields)?;
    validate_instance_group(&updated, Some(&cluster), false)
        .into_result()
        .map_err(|errors| anyhow!("instance group {group} is invalid after the change:\n{errors}"))?;

    client.update(&updated).await?;
    println!(
        "{} {} on instance group {}",
        format!("✓ {}", verb(unset)).green().bold(),
        fields.join(", "),
        group.cyan()
    );
    Ok(())
}
