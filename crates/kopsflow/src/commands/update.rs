use crate::GlobalArgs;
use crate::utils::{self, Session};
use anyhow::bail;
use clap::Args;
use colored::Colorize;
use kopsflow_cloudup::{ApplyClusterCmd, ApplyResults, Phase};
use kopsflow_fi::{ActionType, LifecycleOverrides, TargetKind};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Clone)]
pub struct UpdateClusterArgs {
    /// Cluster name (or --name)
    pub cluster: Option<String>,
    /// Apply changes; without it the direct target only previews them
    #[arg(short, long)]
    pub yes: bool,
    /// direct, dryrun, terraform or cloudformation
    #[arg(long, default_value = "direct")]
    pub target: TargetKind,
    /// Output directory for terraform and cloudformation targets
    #[arg(long)]
    pub out: Option<PathBuf>,
    /// Only run one phase: network, security or cluster
    #[arg(long)]
    pub phase: Option<Phase>,
    /// TaskType=Lifecycle pairs, e.g. SecurityGroup=Ignore
    #[arg(long, value_delimiter = ',')]
    pub lifecycle_overrides: Vec<String>,
    /// Tasks run concurrently
    #[arg(long, default_value_t = 4)]
    pub max_concurrency: usize,
}

impl UpdateClusterArgs {
    /// A confirmed full update of `cluster`
    pub fn apply_now(cluster: String, target: TargetKind, out: Option<PathBuf>) -> Self {
        Self {
            cluster: Some(cluster),
            yes: true,
            target,
            out,
            phase: None,
            lifecycle_overrides: Vec::new(),
            max_concurrency: 4,
        }
    }

    /// Without --yes a direct update becomes a dry run; emitting targets
    /// always write their files
    pub fn effective_target(&self) -> TargetKind {
        if self.target == TargetKind::Direct && !self.yes {
            TargetKind::DryRun
        } else {
            self.target
        }
    }
}

pub async fn apply(
    session: &Session,
    name: &str,
    args: &UpdateClusterArgs,
    cancel: CancellationToken,
) -> anyhow::Result<ApplyResults> {
    let (cluster, instance_groups) = session.load(name).await?;
    let mut cmd = ApplyClusterCmd::new(
        cluster,
        instance_groups,
        args.effective_target(),
        session.hash_resolver()?,
    )
    .with_phase(args.phase)
    .with_lifecycle_overrides(LifecycleOverrides::parse(&args.lifecycle_overrides)?)
    .with_max_concurrency(args.max_concurrency)
    .with_cancel(cancel);
    if let Some(out) = &args.out {
        cmd = cmd.with_out_dir(out);
    }
    Ok(cmd.run(&session.clientset).await?)
}

fn print_changes(results: &ApplyResults) {
    let creates: Vec<_> = results
        .report
        .actions
        .iter()
        .filter(|a| a.action_type == ActionType::Create)
        .collect();
    let updates: Vec<_> = results
        .report
        .actions
        .iter()
        .filter(|a| matches!(a.action_type, ActionType::Update | ActionType::Recreate))
        .collect();

    if !creates.is_empty() {
        println!("Will create resources:");
        for action in creates {
            println!("  {}", action.task.cyan());
        }
        println!();
    }
    if !updates.is_empty() {
        println!("Will modify resources:");
        for action in updates {
            let marker = if action.action_type == ActionType::Recreate {
                " (recreate)".yellow().to_string()
            } else {
                String::new()
            };
            println!("  {}{}", action.task.cyan(), marker);
            for change in &action.changes {
                println!("    {}", change.to_string().dimmed());
            }
        }
        println!();
    }
    for action in results.report.actions.iter().filter(|a| a.action_type == ActionType::Warn) {
        println!("{} {} has drifted; left alone by its lifecycle", "⚠".yellow(), action.task);
    }
}

fn check_failures(results: &ApplyResults) -> anyhow::Result<()> {
    if results.report.is_success() {
        return Ok(());
    }
    for failure in &results.report.failed {
        eprintln!("  {} {}: {}", "✗".red(), failure.task, failure.error);
    }
    for skipped in &results.report.skipped {
        eprintln!("  {} {} (skipped)", "-".dimmed(), skipped);
    }
    bail!(
        "{} tasks failed and {} were skipped",
        results.report.failed.len(),
        results.report.skipped.len()
    )
}

/// Print what an apply did, or would do, for its target
pub fn print_results(name: &str, target: TargetKind, results: &ApplyResults) -> anyhow::Result<()> {
    check_failures(results)?;
    match target {
        TargetKind::DryRun => {
            if results.report.has_changes() {
                print_changes(results);
            } else {
                println!("{}", "No changes need to be applied".green());
            }
            println!("{}", results.report.summary().to_string().dimmed());
        }
        TargetKind::Terraform | TargetKind::CloudFormation => {
            // The main file sits at the top of the output directory
            let dir = results
                .files
                .iter()
                .min_by_key(|f| f.components().count())
                .and_then(|f| f.parent())
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            println!(
                "{} {}",
                format!("✓ {target} output has been placed into").green().bold(),
                dir.cyan()
            );
            for file in &results.files {
                println!("  {}", file.display().to_string().dimmed());
            }
        }
        TargetKind::Direct => {
            println!("{}", results.report.summary().to_string().dimmed());
            println!("{}", "✓ Cluster changes have been applied to the cloud.".green().bold());
            println!();
            println!(
                "Changes may require instances to restart: {}",
                format!("kops rolling-update cluster --name {name}").cyan()
            );
        }
    }
    Ok(())
}

pub async fn handle(global: &GlobalArgs, args: UpdateClusterArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let name = utils::cluster_name(args.cluster.clone(), global)?;
    let session = utils::session(global).await?;
    let target = args.effective_target();
    if target == TargetKind::Direct {
        println!("{}", format!("Updating cluster {}...", name).blue());
    }

    let results = apply(&session, &name, &args, cancel).await?;
    print_results(&name, target, &results)?;

    if target == TargetKind::DryRun && results.report.has_changes() {
        utils::print_yes_hint("apply changes");
    }
    Ok(())
}
