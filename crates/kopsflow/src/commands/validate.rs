use crate::GlobalArgs;
use crate::output::{self, OutputFormat, Table};
use crate::utils;
use colored::Colorize;
use kopsflow_cloud::build_cloud;
use kopsflow_core::{InstanceGroup, completion};
use kopsflow_rollout::{ClusterValidator, ValidationResult, Validator, failure_summary};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

fn print_table(name: &str, cluster: &kopsflow_core::Cluster, instance_groups: &[InstanceGroup], result: &ValidationResult) {
    println!("{}", "INSTANCE GROUPS".bold());
    let mut groups = Table::new(&["NAME", "ROLE", "MACHINETYPE", "MIN", "MAX", "SUBNETS"]);
    for ig in instance_groups {
        groups.row(vec![
            ig.name().to_string(),
            ig.role().to_string(),
            ig.spec.machine_type.clone().unwrap_or_default(),
            ig.min_size().to_string(),
            ig.max_size().to_string(),
            completion::zones_for_instance_group(cluster, ig).join(","),
        ]);
    }
    groups.print();
    println!();

    println!("{}", "NODE STATUS".bold());
    let mut nodes = Table::new(&["NAME", "ROLE", "READY"]);
    for node in &result.nodes {
        nodes.row(vec![node.name.clone(), node.role.clone(), node.ready.to_string()]);
    }
    nodes.print();
    println!();

    if result.passed() {
        println!("{}", format!("✓ Your cluster {name} is ready").green().bold());
        return;
    }
    println!("{}", "VALIDATION ERRORS".bold());
    let mut failures = Table::new(&["KIND", "NAME", "MESSAGE"]);
    for failure in &result.failures {
        failures.row(vec![failure.kind.to_string(), failure.name.clone(), failure.message.clone()]);
    }
    failures.print();
    println!();
    let summary: Vec<String> = failure_summary(result)
        .into_iter()
        .map(|(kind, count)| format!("{count} {kind}"))
        .collect();
    eprintln!("{} {}", "✗ Validation failed:".red().bold(), summary.join(", "));
}

/// Validate once, or until `count` consecutive passes within `wait`.
/// Returns whether the last validation passed.
pub async fn handle(
    global: &GlobalArgs,
    cluster: Option<String>,
    wait: Option<Duration>,
    count: u32,
    format: OutputFormat,
    cancel: CancellationToken,
) -> anyhow::Result<bool> {
    let name = utils::cluster_name(cluster, global)?;
    let session = utils::session(global).await?;
    let (cluster, instance_groups) = session.load(&name).await?;
    let cloud = build_cloud(&cluster).await?;
    let kube = utils::kube_client().await?;
    let validator = ClusterValidator::new(cluster.clone(), instance_groups.clone(), cloud, kube);

    let deadline = wait.map(|w| Instant::now() + w);
    let mut passes = 0;
    let result = loop {
        let result = validator.validate().await?;
        if result.passed() {
            passes += 1;
            if deadline.is_none() || passes >= count.max(1) {
                break result;
            }
        } else {
            passes = 0;
        }
        match deadline {
            Some(deadline) if Instant::now() < deadline => {
                if !result.passed() {
                    tracing::info!("Validation failed; retrying in {:?}", POLL_INTERVAL);
                }
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => break result,
                }
            }
            _ => break result,
        }
    };

    match format {
        OutputFormat::Table | OutputFormat::Plaintext => print_table(&name, &cluster, &instance_groups, &result),
        _ => output::print_structured(&result, format)?,
    }
    Ok(result.passed())
}
