use crate::GlobalArgs;
use crate::commands::rolling_update;
use crate::commands::update::{self, UpdateClusterArgs};
use crate::utils;
use colored::Colorize;
use kopsflow_core::InstanceGroupRole;
use kopsflow_fi::TargetKind;
use kopsflow_rollout::RollingUpdateOptions;
use tokio_util::sync::CancellationToken;

/// Apply, roll the control plane, apply again, then roll everything else.
///
/// Without `yes` this is the same preview `update cluster` prints.
pub async fn handle(
    global: &GlobalArgs,
    cluster: Option<String>,
    yes: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(cluster, global)?;
    let session = utils::session(global).await?;

    let mut args = UpdateClusterArgs::apply_now(name.clone(), TargetKind::Direct, None);
    args.yes = yes;
    if !yes {
        let results = update::apply(&session, &name, &args, cancel).await?;
        update::print_results(&name, args.effective_target(), &results)?;
        if results.report.has_changes() {
            utils::print_yes_hint("reconcile the cluster");
        }
        return Ok(());
    }

    println!("{}", "Updating control plane configuration".blue());
    let results = update::apply(&session, &name, &args, cancel.clone()).await?;
    update::print_results(&name, TargetKind::Direct, &results)?;

    println!();
    println!("{}", "Doing rolling-update for control plane".blue());
    let control_plane = RollingUpdateOptions {
        roles: vec![InstanceGroupRole::ControlPlane, InstanceGroupRole::ApiServer],
        ..Default::default()
    };
    rolling_update::roll(&session, &name, control_plane, true, cancel.clone()).await?;

    println!();
    println!("{}", "Updating node configuration".blue());
    let results = update::apply(&session, &name, &args, cancel.clone()).await?;
    update::print_results(&name, TargetKind::Direct, &results)?;

    println!();
    println!("{}", "Doing rolling-update for nodes".blue());
    rolling_update::roll(&session, &name, RollingUpdateOptions::default(), true, cancel).await?;

    println!();
    println!("{}", format!("✓ Cluster {name} is reconciled").green().bold());
    Ok(())
}
