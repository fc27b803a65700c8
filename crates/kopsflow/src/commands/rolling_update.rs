use crate::GlobalArgs;
use crate::output::Table;
use crate::utils::{self, PromptConfirm, Session};
use anyhow::anyhow;
use clap::{ArgAction, Args};
use colored::Colorize;
use kopsflow_cloud::{CloudInstanceGroup, build_cloud};
use kopsflow_core::InstanceGroupRole;
use kopsflow_rollout::{ClusterValidator, RollingUpdateCluster, RollingUpdateOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Clone)]
pub struct RollingUpdateArgs {
    /// Cluster name (or --name)
    pub cluster: Option<String>,
    /// Perform the update; without it only the plan is shown
    #[arg(short, long)]
    pub yes: bool,
    /// Replace every instance, not only the out-of-date ones
    #[arg(long)]
    pub force: bool,
    /// Replace instances without draining or validating through the Kubernetes API
    #[arg(long)]
    pub cloudonly: bool,
    /// Only these instance groups
    #[arg(long = "instance-group", value_delimiter = ',')]
    pub instance_groups: Vec<String>,
    /// Only groups with these roles
    #[arg(long = "instance-group-roles", value_delimiter = ',')]
    pub roles: Vec<String>,
    /// Ask before replacing each instance
    #[arg(long)]
    pub interactive: bool,
    /// Stop when a node cannot be drained
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub fail_on_drain_error: bool,
    /// Stop when the cluster does not validate after a replacement
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub fail_on_validate_error: bool,
    #[arg(long, value_parser = utils::parse_duration, default_value = "15m")]
    pub drain_timeout: Duration,
    /// Wait after draining before terminating
    #[arg(long, value_parser = utils::parse_duration, default_value = "5s")]
    pub post_drain_delay: Duration,
    #[arg(long, value_parser = utils::parse_duration, default_value = "15m")]
    pub validation_timeout: Duration,
    /// Consecutive passing validations required after each replacement
    #[arg(long, default_value_t = 2)]
    pub validate_count: u32,
    #[arg(long, alias = "master-interval", value_parser = utils::parse_duration, default_value = "15s")]
    pub control_plane_interval: Duration,
    #[arg(long, value_parser = utils::parse_duration, default_value = "15s")]
    pub node_interval: Duration,
    #[arg(long, value_parser = utils::parse_duration, default_value = "15s")]
    pub bastion_interval: Duration,
}

impl RollingUpdateArgs {
    pub fn options(&self) -> anyhow::Result<RollingUpdateOptions> {
        let roles = self
            .roles
            .iter()
            .map(|r| InstanceGroupRole::parse(r).ok_or_else(|| anyhow!("unknown instance group role {r:?}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(RollingUpdateOptions {
            master_interval: self.control_plane_interval,
            node_interval: self.node_interval,
            bastion_interval: self.bastion_interval,
            drain_timeout: self.drain_timeout,
            post_drain_delay: self.post_drain_delay,
            validation_timeout: self.validation_timeout,
            validate_count: self.validate_count,
            fail_on_drain_error: self.fail_on_drain_error,
            fail_on_validate_error: self.fail_on_validate_error,
            cloud_only: self.cloudonly,
            force: self.force,
            interactive: self.interactive,
            instance_groups: self.instance_groups.clone(),
            roles,
            ..Default::default()
        })
    }
}

fn selected(options: &RollingUpdateOptions, group: &CloudInstanceGroup) -> bool {
    (options.instance_groups.is_empty()
        || options.instance_groups.iter().any(|n| n == group.instance_group.name()))
        && (options.roles.is_empty() || options.roles.contains(&group.role()))
}

fn print_groups(groups: &BTreeMap<String, CloudInstanceGroup>, force: bool) {
    let mut table = Table::new(&["NAME", "STATUS", "NEEDUPDATE", "READY", "MIN", "TARGET", "MAX", "NODES"]);
    for group in groups.values() {
        let need_update = if force {
            group.members().count()
        } else {
            group.need_update.len()
        };
        let status = if need_update > 0 { "NeedsUpdate" } else { "Ready" };
        table.row(vec![
            group.instance_group.name().to_string(),
            status.to_string(),
            need_update.to_string(),
            group.ready.len().to_string(),
            group.min_size.to_string(),
            group.target_size.to_string(),
            group.max_size.to_string(),
            group.members().filter(|m| m.node.is_some()).count().to_string(),
        ]);
    }
    table.print();
}

/// Show the cluster's groups and, with `yes`, replace whatever is out of date
pub async fn roll(
    session: &Session,
    name: &str,
    options: RollingUpdateOptions,
    yes: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (cluster, instance_groups) = session.load(name).await?;
    let cloud = build_cloud(&cluster).await?;
    let kube = if options.cloud_only {
        None
    } else {
        Some(utils::kube_client().await?)
    };
    let nodes = match &kube {
        Some(kube) => Some(utils::node_infos(kube.as_ref()).await?),
        None => None,
    };

    let groups: BTreeMap<String, CloudInstanceGroup> = cloud
        .get_cloud_groups(&cluster, &instance_groups, true, nodes.as_deref())
        .await?
        .into_iter()
        .filter(|(_, g)| selected(&options, g))
        .collect();
    print_groups(&groups, options.force);

    if !RollingUpdateCluster::needs_update(&groups, options.force) {
        println!();
        println!("{}", "No rolling-update required.".green());
        return Ok(());
    }
    if !yes {
        utils::print_yes_hint("rolling-update");
        return Ok(());
    }

    let interactive = options.interactive;
    let mut update = RollingUpdateCluster::new(cluster.clone(), cloud.clone(), options).with_cancel(cancel);
    if let Some(kube) = kube {
        let validator = ClusterValidator::new(cluster, instance_groups, cloud, kube.clone());
        update = update.with_kube(kube).with_validator(Arc::new(validator));
    }
    if interactive {
        update = update.with_confirm(Arc::new(PromptConfirm));
    }

    let report = update.run(&groups).await?;
    println!();
    for instance in &report.instances {
        let last = instance
            .states
            .last()
            .map(|s| s.to_string())
            .unwrap_or_default();
        println!(
            "  {} {} {} {}",
            instance.group.cyan(),
            instance.instance,
            instance.node.as_deref().unwrap_or("-").dimmed(),
            last
        );
    }
    for warning in &report.warnings {
        println!("{} {}", "⚠".yellow(), warning.yellow());
    }
    println!(
        "{}",
        format!("✓ Rolling update completed for cluster {name}").green().bold()
    );
    Ok(())
}

pub async fn handle(global: &GlobalArgs, args: RollingUpdateArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let name = utils::cluster_name(args.cluster.clone(), global)?;
    let session = utils::session(global).await?;
    roll(&session, &name, args.options()?, args.yes, cancel).await
}
