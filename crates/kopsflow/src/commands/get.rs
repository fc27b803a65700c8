use crate::GlobalArgs;
use crate::output::{self, OutputFormat, Table};
use crate::utils;
use anyhow::bail;
use colored::Colorize;
use kopsflow_cloud::build_cloud;
use kopsflow_cloudup::assets::build_assets;
use kopsflow_core::{Cluster, InstanceGroup, completion};
use kopsflow_pki::{Keystore, SecretStore};
use serde::Serialize;
use std::collections::BTreeSet;

fn cluster_zones(cluster: &Cluster) -> String {
    let zones: BTreeSet<&str> = cluster
        .spec
        .subnets
        .iter()
        .map(|s| s.zone.as_str())
        .filter(|z| !z.is_empty())
        .collect();
    zones.into_iter().collect::<Vec<_>>().join(",")
}

fn cluster_table(clusters: &[Cluster]) -> Table {
    let mut table = Table::new(&["NAME", "CLOUD", "ZONES"]);
    for cluster in clusters {
        table.row(vec![
            cluster.name().to_string(),
            cluster.spec.cloud_provider.map(|p| p.to_string()).unwrap_or_default(),
            cluster_zones(cluster),
        ]);
    }
    table
}

fn instance_group_table(cluster: &Cluster, instance_groups: &[InstanceGroup]) -> Table {
    let mut table = Table::new(&["NAME", "ROLE", "MACHINETYPE", "MIN", "MAX", "ZONES"]);
    for ig in instance_groups {
        table.row(vec![
            ig.name().to_string(),
            ig.role().to_string(),
            ig.spec.machine_type.clone().unwrap_or_default(),
            ig.min_size().to_string(),
            ig.max_size().to_string(),
            completion::zones_for_instance_group(cluster, ig).join(","),
        ]);
    }
    table
}

fn print_table_or_empty(table: &Table, what: &str) {
    if table.is_empty() {
        println!("{}", format!("No {what} found").dimmed());
    } else {
        table.print();
    }
}

pub async fn handle_all(global: &GlobalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let (cluster, instance_groups) = session.load(&name).await?;
    match format {
        OutputFormat::Table | OutputFormat::Plaintext => {
            println!("{}", "Cluster".bold());
            cluster_table(std::slice::from_ref(&cluster)).print();
            println!();
            println!("{}", "Instance Groups".bold());
            print_table_or_empty(&instance_group_table(&cluster, &instance_groups), "instance groups");
        }
        _ => output::print_objects(std::slice::from_ref(&cluster), &instance_groups, format)?,
    }
    Ok(())
}

pub async fn handle_clusters(global: &GlobalArgs, names: &[String], format: OutputFormat) -> anyhow::Result<()> {
    let session = utils::session(global).await?;
    let mut clusters = session.clientset.list_clusters().await?;
    let mut wanted: Vec<String> = names.to_vec();
    if wanted.is_empty() {
        wanted.extend(global.name.clone());
    }
    if !wanted.is_empty() {
        clusters.retain(|c| wanted.iter().any(|n| n == c.name()));
        if let Some(missing) = wanted.iter().find(|n| !clusters.iter().any(|c| c.name() == n.as_str())) {
            bail!("cluster {missing:?} not found");
        }
    }
    match format {
        OutputFormat::Table | OutputFormat::Plaintext => print_table_or_empty(&cluster_table(&clusters), "clusters"),
        _ => output::print_objects(&clusters, &[], format)?,
    }
    Ok(())
}

pub async fn handle_instance_groups(
    global: &GlobalArgs,
    names: &[String],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let (cluster, mut instance_groups) = session.load(&name).await?;
    if !names.is_empty() {
        instance_groups.retain(|ig| names.iter().any(|n| n == ig.name()));
        if let Some(missing) = names.iter().find(|n| !instance_groups.iter().any(|ig| ig.name() == n.as_str())) {
            bail!("instance group {missing:?} not found");
        }
    }
    match format {
        OutputFormat::Table | OutputFormat::Plaintext => {
            print_table_or_empty(&instance_group_table(&cluster, &instance_groups), "instance groups")
        }
        _ => output::print_objects(&[], &instance_groups, format)?,
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeypairRow {
    keyset: String,
    id: String,
    common_name: Option<String>,
    primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    distrust_timestamp: Option<String>,
}

pub async fn handle_keypairs(
    global: &GlobalArgs,
    keysets: &[String],
    distrusted: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;

    let mut rows = Vec::new();
    for keyset in session.clientset.key_store(&cluster).list_keysets().await? {
        if !keysets.is_empty() && !keysets.iter().any(|k| k == keyset.name()) {
            continue;
        }
        for item in keyset.items() {
            if item.is_distrusted() && !distrusted {
                continue;
            }
            rows.push(KeypairRow {
                keyset: keyset.name().to_string(),
                id: item.id.clone(),
                common_name: item.certificate.common_name()?,
                primary: keyset.primary_id() == Some(item.id.as_str()),
                distrust_timestamp: item.distrust_timestamp.map(|t| t.to_rfc3339()),
            });
        }
    }

    match format {
        OutputFormat::Table | OutputFormat::Plaintext => {
            let mut table = Table::new(&["KEYSET", "ID", "COMMON NAME", "PRIMARY", "DISTRUSTED"]);
            for row in &rows {
                table.row(vec![
                    row.keyset.clone(),
                    row.id.clone(),
                    row.common_name.clone().unwrap_or_default(),
                    if row.primary { "✓".to_string() } else { String::new() },
                    row.distrust_timestamp.clone().unwrap_or_default(),
                ]);
            }
            print_table_or_empty(&table, "keypairs");
        }
        _ => output::print_structured(&rows, format)?,
    }
    Ok(())
}

pub async fn handle_secrets(global: &GlobalArgs, names: &[String], format: OutputFormat) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let store = session.clientset.secret_store(&cluster);

    let mut secrets = store.list_secrets().await?;
    secrets.sort();
    if !names.is_empty() {
        secrets.retain(|s| names.contains(s));
    }

    match format {
        // Only plaintext reveals values
        OutputFormat::Plaintext => {
            for secret in &secrets {
                println!("{}", store.get_secret(secret).await?.as_string()?);
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new(&["NAME"]);
            for secret in &secrets {
                table.row(vec![secret.clone()]);
            }
            print_table_or_empty(&table, "secrets");
        }
        _ => output::print_structured(&secrets, format)?,
    }
    Ok(())
}

#[derive(Serialize)]
struct SshKeyRow {
    fingerprint: String,
    key: String,
}

pub async fn handle_ssh_public_keys(global: &GlobalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;

    let mut rows = Vec::new();
    for key in session.clientset.ssh_credential_store(&cluster).find_ssh_public_keys().await? {
        rows.push(SshKeyRow {
            fingerprint: key.fingerprint()?,
            key: key.text().trim().to_string(),
        });
    }
    match format {
        OutputFormat::Table => {
            let mut table = Table::new(&["FINGERPRINT", "KEY"]);
            for row in &rows {
                let short: String = row.key.chars().take(40).collect();
                table.row(vec![row.fingerprint.clone(), format!("{short}...")]);
            }
            print_table_or_empty(&table, "SSH public keys");
        }
        OutputFormat::Plaintext => {
            for row in &rows {
                println!("{}", row.key);
            }
        }
        _ => output::print_structured(&rows, format)?,
    }
    Ok(())
}

pub async fn handle_assets(global: &GlobalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let (cluster, instance_groups) = session.load(&name).await?;
    let cluster = completion::complete_cluster(&cluster, &instance_groups, None)?;
    let assets = build_assets(&cluster, session.hash_resolver()?.as_ref()).await?;

    match format {
        OutputFormat::Table => {
            let mut table = Table::new(&["KIND", "NAME", "LOCATION", "SHA256"]);
            for file in &assets.files {
                table.row(vec!["File".into(), file.name.clone(), file.url.clone(), file.sha256.clone()]);
            }
            for image in &assets.images {
                table.row(vec!["Image".into(), String::new(), image.clone(), String::new()]);
            }
            table.print();
        }
        OutputFormat::Plaintext => {
            for file in &assets.files {
                println!("{}", file.pinned());
            }
            for image in &assets.images {
                println!("{image}");
            }
        }
        _ => output::print_structured(&assets, format)?,
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRow {
    id: String,
    node_name: Option<String>,
    status: String,
    role: String,
    instance_group: String,
    machine_type: Option<String>,
}

pub async fn handle_instances(global: &GlobalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let (cluster, instance_groups) = session.load(&name).await?;
    let cloud = build_cloud(&cluster).await?;
    let groups = cloud.get_cloud_groups(&cluster, &instance_groups, false, None).await?;

    let mut rows = Vec::new();
    for group in groups.values() {
        for member in group.members() {
            rows.push(InstanceRow {
                id: member.id.clone(),
                node_name: member.node.as_ref().map(|n| n.name.clone()),
                status: member.status.to_string(),
                role: group.role().to_string(),
                instance_group: group.instance_group.name().to_string(),
                machine_type: member.machine_type.clone(),
            });
        }
    }
    rows.sort_by(|a, b| (&a.instance_group, &a.id).cmp(&(&b.instance_group, &b.id)));

    match format {
        OutputFormat::Table | OutputFormat::Plaintext => {
            let mut table = Table::new(&["ID", "NODE-NAME", "STATUS", "ROLES", "INSTANCE-GROUP", "MACHINE-TYPE"]);
            for row in &rows {
                table.row(vec![
                    row.id.clone(),
                    row.node_name.clone().unwrap_or_default(),
                    row.status.clone(),
                    row.role.clone(),
                    row.instance_group.clone(),
                    row.machine_type.clone().unwrap_or_default(),
                ]);
            }
            print_table_or_empty(&table, "instances");
        }
        _ => output::print_structured(&rows, format)?,
    }
    Ok(())
}

pub async fn handle_addons(global: &GlobalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let addons = session.clientset.addons_for(&cluster);
    let names = addons.list().await?;

    match format {
        OutputFormat::Table => {
            let mut table = Table::new(&["NAME", "LOCATION"]);
            for addon in &names {
                table.row(vec![addon.clone(), addons.path(addon).to_string()]);
            }
            print_table_or_empty(&table, "addons");
        }
        OutputFormat::Plaintext => {
            for addon in &names {
                if let Some(manifest) = addons.get(addon).await? {
                    println!("# {addon}");
                    print!("{manifest}");
                }
            }
        }
        _ => output::print_structured(&names, format)?,
    }
    Ok(())
}
