//! Rolling update of cloud instance groups
//!
//! Groups are visited bastions first, then control plane, API servers and
//! nodes. Within a group every outdated member is drained, replaced and the
//! cluster revalidated before the next one is touched, so at most one member
//! per group is out of service at a time.

use crate::drain::{DrainOptions, Drainer};
use crate::error::{Result, RolloutError};
use crate::k8s::{KubeClient, Node};
use crate::validator::{Validator, failure_summary};
use crate::wait;
use kopsflow_cloud::{Cloud, CloudInstance, CloudInstanceGroup, CloudInstanceStatus, NodeInfo};
use kopsflow_core::{Cluster, InstanceGroup, InstanceGroupRole};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RollingUpdateOptions {
    pub master_interval: Duration,
    pub node_interval: Duration,
    pub bastion_interval: Duration,
    pub drain_timeout: Duration,
    pub post_drain_delay: Duration,
    pub validation_timeout: Duration,
    /// Consecutive passing validations required after each replacement
    pub validate_count: u32,
    pub validate_success_duration: Duration,
    pub poll_interval: Duration,
    pub fail_on_drain_error: bool,
    pub fail_on_validate_error: bool,
    /// Replace instances without draining or validating
    pub cloud_only: bool,
    /// Replace every member, not just the outdated ones
    pub force: bool,
    pub interactive: bool,
    /// Only these instance groups, when non-empty
    pub instance_groups: Vec<String>,
    /// Only groups of these roles, when non-empty
    pub roles: Vec<InstanceGroupRole>,
}

impl Default for RollingUpdateOptions {
    fn default() -> Self {
        Self {
            master_interval: Duration::from_secs(15),
            node_interval: Duration::from_secs(15),
            bastion_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(15 * 60),
            post_drain_delay: Duration::from_secs(5),
            validation_timeout: Duration::from_secs(15 * 60),
            validate_count: 2,
            validate_success_duration: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            fail_on_drain_error: true,
            fail_on_validate_error: true,
            cloud_only: false,
            force: false,
            interactive: false,
            instance_groups: Vec::new(),
            roles: Vec::new(),
        }
    }
}

impl RollingUpdateOptions {
    fn interval(&self, role: InstanceGroupRole) -> Duration {
        match role {
            InstanceGroupRole::Bastion => self.bastion_interval,
            InstanceGroupRole::ControlPlane | InstanceGroupRole::ApiServer => self.master_interval,
            InstanceGroupRole::Node => self.node_interval,
        }
    }

    fn selects(&self, group: &CloudInstanceGroup) -> bool {
        (self.instance_groups.is_empty() || self.instance_groups.iter().any(|n| n == group.instance_group.name()))
            && (self.roles.is_empty() || self.roles.contains(&group.role()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Pending,
    Draining,
    Drained,
    DrainFailed,
    Replacing,
    Validated,
    ValidationTimedOut,
    Done,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The path one instance took through the update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceUpdate {
    pub group: String,
    pub instance: String,
    pub node: Option<String>,
    pub states: Vec<InstanceState>,
}

impl InstanceUpdate {
    fn enter(&mut self, state: InstanceState) {
        tracing::debug!(instance = %self.instance, "{}", state);
        self.states.push(state);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollingUpdateReport {
    pub instances: Vec<InstanceUpdate>,
    /// Drain and validation failures that were recorded and skipped
    pub warnings: Vec<String>,
}

/// Asks the operator before an instance is replaced
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

pub struct RollingUpdateCluster {
    cluster: Cluster,
    cloud: Arc<dyn Cloud>,
    kube: Option<Arc<dyn KubeClient>>,
    validator: Option<Arc<dyn Validator>>,
    confirm: Option<Arc<dyn Confirm>>,
    options: RollingUpdateOptions,
    cancel: CancellationToken,
}

impl RollingUpdateCluster {
    pub fn new(cluster: Cluster, cloud: Arc<dyn Cloud>, options: RollingUpdateOptions) -> Self {
        Self {
            cluster,
            cloud,
            kube: None,
            validator: None,
            confirm: None,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_kube(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = Some(confirm);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether any group has work to do
    pub fn needs_update(groups: &BTreeMap<String, CloudInstanceGroup>, force: bool) -> bool {
        groups.values().any(|g| !update_list(g, force).is_empty())
    }

    fn kube_for_drain(&self) -> Option<&dyn KubeClient> {
        if self.options.cloud_only {
            return None;
        }
        self.kube.as_deref()
    }

    async fn node_infos(&self) -> Result<Option<Vec<NodeInfo>>> {
        match self.kube_for_drain() {
            Some(kube) => Ok(Some(kube.list_nodes().await?.iter().map(Node::info).collect())),
            None => Ok(None),
        }
    }

    pub async fn run(&self, groups: &BTreeMap<String, CloudInstanceGroup>) -> Result<RollingUpdateReport> {
        let mut ordered: Vec<&CloudInstanceGroup> = groups.values().filter(|g| self.options.selects(g)).collect();
        ordered.sort_by(|a, b| {
            (a.role(), a.instance_group.name()).cmp(&(b.role(), b.instance_group.name()))
        });

        // A lone control plane is terminated in place, never detached
        let control_plane_min: i32 = groups
            .values()
            .filter(|g| g.role() == InstanceGroupRole::ControlPlane)
            .map(|g| g.min_size)
            .sum();
        let single_control_plane = control_plane_min <= 1;

        let instance_groups: Vec<InstanceGroup> = groups.values().map(|g| g.instance_group.clone()).collect();

        let mut report = RollingUpdateReport::default();
        for group in ordered {
            self.update_group(group, single_control_plane, &instance_groups, &mut report)
                .await?;
        }
        Ok(report)
    }

    async fn update_group(
        &self,
        group: &CloudInstanceGroup,
        single_control_plane: bool,
        instance_groups: &[InstanceGroup],
        report: &mut RollingUpdateReport,
    ) -> Result<()> {
        let name = group.instance_group.name();
        let update = update_list(group, self.options.force);
        if update.is_empty() {
            tracing::debug!("Instance group {} is up to date", name);
            return Ok(());
        }

        let surge = surge_budget(group, single_control_plane);
        tracing::info!(
            "Rolling update of {} ({}): {} instance(s), surge {}",
            name,
            group.role().as_str(),
            update.len(),
            surge
        );

        for (i, instance) in update.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(RolloutError::Cancelled);
            }
            let outcome = self
                .update_instance(group, instance, surge, instance_groups, report)
                .await?;
            report.instances.push(outcome);

            if i + 1 < update.len() {
                wait::sleep(self.options.interval(group.role()), &self.cancel).await?;
            }
        }
        Ok(())
    }

    async fn update_instance(
        &self,
        group: &CloudInstanceGroup,
        instance: &CloudInstance,
        surge: usize,
        instance_groups: &[InstanceGroup],
        report: &mut RollingUpdateReport,
    ) -> Result<InstanceUpdate> {
        let group_name = group.instance_group.name().to_string();
        let node = instance.node.as_ref().map(|n| n.name.clone());
        let mut update = InstanceUpdate {
            group: group_name.clone(),
            instance: instance.id.clone(),
            node: node.clone(),
            states: Vec::new(),
        };
        update.enter(InstanceState::Pending);

        let drain_target = self.kube_for_drain().zip(node.as_deref());
        if let Some((kube, node)) = drain_target {
            update.enter(InstanceState::Draining);
            let options = DrainOptions {
                timeout: self.options.drain_timeout,
                ..Default::default()
            };
            match Drainer::new(kube, options).drain(node, &self.cancel).await {
                Ok(_) => update.enter(InstanceState::Drained),
                Err(RolloutError::Cancelled) => return Err(RolloutError::Cancelled),
                Err(e) => {
                    update.enter(InstanceState::DrainFailed);
                    if self.options.fail_on_drain_error {
                        return Err(RolloutError::GroupFailed {
                            group: group_name,
                            message: e.to_string(),
                        });
                    }
                    tracing::warn!("Ignoring drain failure of {}: {}", node, e);
                    report.warnings.push(e.to_string());
                }
            }
            // The node is cordoned from here on; sleeps run to completion
            tokio::time::sleep(self.options.post_drain_delay).await;
        }

        if self.options.interactive
            && let Some(confirm) = &self.confirm
        {
            let prompt = format!("Replace instance {} in {}?", instance.id, group_name);
            if !confirm.confirm(&prompt) {
                if let Some((kube, node)) = drain_target {
                    kube.set_unschedulable(node, false).await?;
                }
                return Err(RolloutError::Declined(instance.id.clone()));
            }
        }

        update.enter(InstanceState::Replacing);
        if matches!(group.role(), InstanceGroupRole::ControlPlane | InstanceGroupRole::ApiServer) {
            self.cloud.deregister_instance(instance).await?;
        }

        if surge > 0 {
            let before = self.member_ids(&group_name, instance_groups).await?;
            tracing::info!("Detaching instance {} from {}", instance.id, group_name);
            self.cloud.detach_instance(instance).await?;
            self.wait_for_replacement(&group_name, &before, instance_groups)
                .await?;
        }
        tracing::info!(
            "Stopping instance {}{} in group {}",
            instance.id,
            node.as_deref().map(|n| format!(", node {n},")).unwrap_or_default(),
            group_name
        );
        self.cloud.delete_instance(instance).await?;

        if let Some(kube) = self.kube_for_drain()
            && let Some(node) = &node
        {
            match kube.delete_node(node).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }

        if let Some(validator) = self.validator.as_deref()
            && !self.options.cloud_only
        {
            match self.validate(validator).await {
                Ok(()) => update.enter(InstanceState::Validated),
                Err(e @ RolloutError::ValidationTimeout { .. }) => {
                    update.enter(InstanceState::ValidationTimedOut);
                    if self.options.fail_on_validate_error {
                        return Err(e);
                    }
                    tracing::warn!("Continuing after failed validation: {}", e);
                    report.warnings.push(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        update.enter(InstanceState::Done);
        Ok(update)
    }

    async fn member_ids(&self, group_name: &str, instance_groups: &[InstanceGroup]) -> Result<BTreeSet<String>> {
        let groups = self
            .cloud
            .get_cloud_groups(&self.cluster, instance_groups, false, None)
            .await?;
        Ok(groups
            .get(group_name)
            .map(|g| g.members().map(|m| m.id.clone()).collect())
            .unwrap_or_default())
    }

    /// Poll until the group has a member that was not in `before` and is
    /// ready
    async fn wait_for_replacement(
        &self,
        group_name: &str,
        before: &BTreeSet<String>,
        instance_groups: &[InstanceGroup],
    ) -> Result<()> {
        let deadline = Instant::now() + self.options.validation_timeout;
        loop {
            let nodes = self.node_infos().await?;
            let groups = self
                .cloud
                .get_cloud_groups(&self.cluster, instance_groups, false, nodes.as_deref())
                .await?;
            let replaced = groups.get(group_name).is_some_and(|g| {
                g.members()
                    .any(|m| m.status == CloudInstanceStatus::Ready && !before.contains(&m.id))
            });
            if replaced {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RolloutError::ReplacementTimeout {
                    group: group_name.to_string(),
                });
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Require `validate_count` consecutive passes within the validation
    /// timeout
    async fn validate(&self, validator: &dyn Validator) -> Result<()> {
        if self.options.validate_count == 0 {
            return Ok(());
        }
        let deadline = Instant::now() + self.options.validation_timeout;
        let mut successes = 0;
        let mut last = String::new();
        loop {
            match validator.validate().await {
                Ok(result) if result.passed() => {
                    successes += 1;
                    if successes >= self.options.validate_count {
                        tracing::info!("Cluster validated");
                        return Ok(());
                    }
                    wait::sleep(self.options.validate_success_duration, &self.cancel).await?;
                    continue;
                }
                Ok(result) => {
                    successes = 0;
                    last = format!("{:?}", failure_summary(&result));
                    tracing::info!("Cluster did not pass validation, will retry: {}", last);
                }
                Err(e) => {
                    successes = 0;
                    last = e.to_string();
                    tracing::info!("Cluster did not validate, will retry: {}", e);
                }
            }
            if Instant::now() >= deadline {
                return Err(RolloutError::ValidationTimeout {
                    timeout: humantime::format_duration(self.options.validation_timeout).to_string(),
                    message: last,
                });
            }
            wait::sleep(self.options.poll_interval, &self.cancel).await?;
        }
    }
}

/// Members to replace, ordered by instance id
fn update_list(group: &CloudInstanceGroup, force: bool) -> Vec<CloudInstance> {
    let mut list: Vec<CloudInstance> = group
        .members()
        .filter(|m| match m.status {
            CloudInstanceStatus::NeedsUpdate | CloudInstanceStatus::NotJoined => true,
            CloudInstanceStatus::Ready => force,
            CloudInstanceStatus::Detached => false,
        })
        .cloned()
        .collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    list
}

/// How many members may be detached ahead of termination
fn surge_budget(group: &CloudInstanceGroup, single_control_plane: bool) -> usize {
    match group.role() {
        InstanceGroupRole::Bastion => 0,
        InstanceGroupRole::ControlPlane if single_control_plane => 0,
        _ => {
            let current = group.current_size();
            if group.max_size > current {
                (group.max_size - current).min(1) as usize
            } else {
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeKube;
    use crate::testing::{World, instance_group, seeded, world};
    use crate::validator::{ClusterValidator, ValidationResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn fast() -> RollingUpdateOptions {
        RollingUpdateOptions {
            post_drain_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn updater(world: &World, kube: &Arc<FakeKube>, options: RollingUpdateOptions) -> RollingUpdateCluster {
        let validator = ClusterValidator::new(
            world.cluster.clone(),
            world.instance_groups.clone(),
            world.cloud.clone(),
            kube.clone(),
        );
        RollingUpdateCluster::new(world.cluster.clone(), world.cloud.clone(), options)
            .with_kube(kube.clone())
            .with_validator(Arc::new(validator))
    }

    struct Failing;

    #[async_trait]
    impl Validator for Failing {
        async fn validate(&self) -> Result<ValidationResult> {
            let mut result = ValidationResult::default();
            result.failures.push(crate::validator::ValidationFailure {
                kind: crate::validator::FailureKind::Pod,
                name: "kube-system/coredns-0".into(),
                message: "not ready".into(),
            });
            Ok(result)
        }
    }

    struct Answer(bool, Mutex<Vec<String>>);

    impl Confirm for Answer {
        fn confirm(&self, prompt: &str) -> bool {
            self.1.lock().unwrap().push(prompt.to_string());
            self.0
        }
    }

    #[test]
    fn test_update_list_by_status() {
        let member = |id: &str, status| CloudInstance {
            id: id.to_string(),
            group_id: "nodes".to_string(),
            status,
            reasons: vec![],
            node: None,
            machine_type: None,
        };
        let group = CloudInstanceGroup {
            id: "nodes".to_string(),
            human_name: "nodes".to_string(),
            instance_group: instance_group("nodes", InstanceGroupRole::Node, 4, 4),
            min_size: 4,
            max_size: 4,
            target_size: 4,
            ready: vec![member("i-1", CloudInstanceStatus::Ready)],
            need_update: vec![
                member("i-4", CloudInstanceStatus::NotJoined),
                member("i-3", CloudInstanceStatus::Detached),
                member("i-2", CloudInstanceStatus::NeedsUpdate),
            ],
        };

        let ids = |force| update_list(&group, force).into_iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids(false), vec!["i-2", "i-4"]);
        assert_eq!(ids(true), vec!["i-1", "i-2", "i-4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_to_do() {
        let world = seeded(1, 2).await;
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;

        assert!(!RollingUpdateCluster::needs_update(&groups, false));
        assert!(RollingUpdateCluster::needs_update(&groups, true));
        let report = updater(&world, &kube, fast()).run(&groups).await.unwrap();
        assert!(report.instances.is_empty());
        assert!(world.cloud.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nodes_replaced_with_surge() {
        let world = seeded(1, 2).await;
        world.cloud.bump_revision(world.group_id("nodes")).await.unwrap();
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;
        let old: Vec<String> = groups["nodes"].members().map(|m| m.id.clone()).collect();

        let report = updater(&world, &kube, fast()).run(&groups).await.unwrap();

        assert_eq!(report.instances.len(), 2);
        assert_eq!(
            report.instances[0].states,
            vec![
                InstanceState::Pending,
                InstanceState::Draining,
                InstanceState::Drained,
                InstanceState::Replacing,
                InstanceState::Validated,
                InstanceState::Done,
            ]
        );
        assert_eq!(world.cloud.max_detached(world.group_id("nodes")).await, 1);
        let now: Vec<String> = world
            .cloud
            .instances(world.group_id("nodes"))
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(now.len(), 2);
        assert!(now.iter().all(|id| !old.contains(id)));

        let after = world.groups(Some(kube.as_ref())).await;
        assert!(!RollingUpdateCluster::needs_update(&after, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_plane_replaced_one_at_a_time() {
        let world = seeded(3, 1).await;
        world
            .cloud
            .bump_revision(world.group_id("master-us-test-1a"))
            .await
            .unwrap();
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;

        let report = updater(&world, &kube, fast()).run(&groups).await.unwrap();
        assert_eq!(report.instances.len(), 3);

        // no detach: the group has no headroom
        assert_eq!(world.cloud.max_detached(world.group_id("master-us-test-1a")).await, 0);
        let calls = kube.calls();
        let lifecycle: Vec<&str> = calls
            .iter()
            .filter_map(|c| c.split_whitespace().next())
            .filter(|verb| *verb == "Cordon" || *verb == "DeleteNode")
            .collect();
        assert_eq!(
            lifecycle,
            vec!["Cordon", "DeleteNode", "Cordon", "DeleteNode", "Cordon", "DeleteNode"]
        );
        let deregistered = world
            .cloud
            .calls()
            .await
            .iter()
            .filter(|c| c.starts_with("DeregisterInstance"))
            .count();
        assert_eq!(deregistered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_control_plane_is_never_detached() {
        let world = world(vec![instance_group(
            "master-us-test-1a",
            InstanceGroupRole::ControlPlane,
            1,
            2,
        )])
        .await;
        world
            .cloud
            .bump_revision(world.group_id("master-us-test-1a"))
            .await
            .unwrap();
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;

        updater(&world, &kube, fast()).run(&groups).await.unwrap();
        let calls = world.cloud.calls().await;
        assert!(!calls.iter().any(|c| c.starts_with("DetachInstance")), "{calls:?}");
        assert!(calls.iter().any(|c| c.starts_with("DeleteInstance")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_order_and_filters() {
        let world = world(vec![
            instance_group("nodes", InstanceGroupRole::Node, 1, 1),
            instance_group("bastions", InstanceGroupRole::Bastion, 1, 1),
            instance_group("master-us-test-1a", InstanceGroupRole::ControlPlane, 1, 1),
        ])
        .await;
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;

        let options = RollingUpdateOptions {
            force: true,
            ..fast()
        };
        let report = updater(&world, &kube, options.clone()).run(&groups).await.unwrap();
        let order: Vec<&str> = report.instances.iter().map(|u| u.group.as_str()).collect();
        assert_eq!(order, vec!["bastions", "master-us-test-1a", "nodes"]);

        let groups = world.groups(Some(kube.as_ref())).await;
        let options = RollingUpdateOptions {
            roles: vec![InstanceGroupRole::Node],
            ..options
        };
        let report = updater(&world, &kube, options).run(&groups).await.unwrap();
        let order: Vec<&str> = report.instances.iter().map(|u| u.group.as_str()).collect();
        assert_eq!(order, vec!["nodes"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_failure_policy() {
        let world = seeded(1, 1).await;
        world.cloud.bump_revision(world.group_id("nodes")).await.unwrap();
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;
        let node = groups["nodes"].need_update[0].node.clone().unwrap().name;
        kube.add_pod(crate::fake::running_pod("default", "db-0", Some(&node), "app", "db"));
        kube.refuse_evictions("default", "db-0", u32::MAX);

        let options = RollingUpdateOptions {
            drain_timeout: Duration::from_secs(60),
            ..fast()
        };
        let err = updater(&world, &kube, options.clone()).run(&groups).await.unwrap_err();
        assert!(matches!(err, RolloutError::GroupFailed { .. }), "{err}");
        assert!(!world.cloud.calls().await.iter().any(|c| c.starts_with("DeleteInstance")));

        let options = RollingUpdateOptions {
            fail_on_drain_error: false,
            ..options
        };
        let report = updater(&world, &kube, options).run(&groups).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.instances[0].states.contains(&InstanceState::DrainFailed));
        assert!(report.instances[0].states.contains(&InstanceState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_policy() {
        let world = seeded(1, 1).await;
        world.cloud.bump_revision(world.group_id("nodes")).await.unwrap();
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;
        let options = RollingUpdateOptions {
            validation_timeout: Duration::from_secs(60),
            fail_on_validate_error: false,
            ..fast()
        };

        let report = RollingUpdateCluster::new(world.cluster.clone(), world.cloud.clone(), options.clone())
            .with_kube(kube.clone())
            .with_validator(Arc::new(Failing))
            .run(&groups)
            .await
            .unwrap();
        assert!(report.instances[0].states.contains(&InstanceState::ValidationTimedOut));
        assert_eq!(report.warnings.len(), 1);

        world.cloud.bump_revision(world.group_id("nodes")).await.unwrap();
        let groups = world.groups(Some(kube.as_ref())).await;
        let err = RollingUpdateCluster::new(
            world.cluster.clone(),
            world.cloud.clone(),
            RollingUpdateOptions {
                fail_on_validate_error: true,
                ..options
            },
        )
        .with_kube(kube.clone())
        .with_validator(Arc::new(Failing))
        .run(&groups)
        .await
        .unwrap_err();
        assert!(matches!(err, RolloutError::ValidationTimeout { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_only_skips_kubernetes() {
        let world = seeded(1, 2).await;
        world.cloud.bump_revision(world.group_id("nodes")).await.unwrap();
        let kube = Arc::new(world.kube());
        let groups = world.groups(None).await;
        let options = RollingUpdateOptions {
            cloud_only: true,
            ..fast()
        };

        let report = updater(&world, &kube, options).run(&groups).await.unwrap();
        assert_eq!(report.instances.len(), 2);
        assert!(kube.calls().is_empty());
        assert_eq!(
            report.instances[0].states,
            vec![InstanceState::Pending, InstanceState::Replacing, InstanceState::Done]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_instance_is_uncordoned() {
        let world = seeded(1, 1).await;
        world.cloud.bump_revision(world.group_id("nodes")).await.unwrap();
        let kube = Arc::new(world.kube());
        let groups = world.groups(Some(kube.as_ref())).await;
        let answer = Arc::new(Answer(false, Mutex::new(Vec::new())));
        let options = RollingUpdateOptions {
            interactive: true,
            ..fast()
        };

        let err = updater(&world, &kube, options)
            .with_confirm(answer.clone())
            .run(&groups)
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::Declined(_)));
        assert_eq!(answer.1.lock().unwrap().len(), 1);
        let node = groups["nodes"].need_update[0].node.clone().unwrap().name;
        assert!(!kube.node(&node).unwrap().unschedulable);
        assert!(!world.cloud.calls().await.iter().any(|c| c.starts_with("DeleteInstance")));
    }
}
