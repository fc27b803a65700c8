//! Simulator cloud
//!
//! `MockCloud` keeps resources, autoscaling groups and their instances in
//! memory (optionally mirrored to a JSON file), records every mutating call
//! and lets tests seed state and inject failures. It models one provider at a
//! time, using that provider's group tagging.

use crate::error::{CloudError, Result};
use crate::groups::{
    CloudInstance, CloudInstanceGroup, GroupTagging, NodeInfo, RawCloudGroup, RawInstance,
    TAG_CLUSTER, TAG_CLUSTER_OWNERSHIP_PREFIX, match_cloud_groups,
};
use crate::provider::{ApiIngressStatus, Cloud, ResourceApi, SubnetInfo, VpcInfo};
use crate::resources::{CloudResource, ResourceSpec, ResourceTracker, kinds};
use crate::state::{MockState, StateFile};
use async_trait::async_trait;
use chrono::Utc;
use kopsflow_core::{Cluster, InstanceGroup, ProviderId};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: String,
    transient: bool,
    remaining: u32,
}

pub struct MockCloud {
    provider: ProviderId,
    region: String,
    state: Mutex<MockState>,
    store: Option<StateFile>,
    failures: std::sync::Mutex<Vec<InjectedFailure>>,
    auto_replace: bool,
}

impl MockCloud {
    /// In-memory simulator
    pub fn new(provider: ProviderId, region: impl Into<String>) -> Self {
        Self {
            provider,
            region: region.into(),
            state: Mutex::new(MockState::new()),
            store: None,
            failures: std::sync::Mutex::new(Vec::new()),
            auto_replace: true,
        }
    }

    /// Simulator backed by a state file, created on first save
    pub async fn open(
        provider: ProviderId,
        region: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let store = StateFile::new(path);
        let state = store.load().await?;
        tracing::debug!("Using simulator cloud state at {}", store.path().display());
        Ok(Self {
            state: Mutex::new(state),
            store: Some(store),
            ..Self::new(provider, region)
        })
    }

    /// Whether groups launch replacements for removed instances
    pub fn with_auto_replace(mut self, auto_replace: bool) -> Self {
        self.auto_replace = auto_replace;
        self
    }

    /// Fail the next `times` calls of `op` (`CreateResource`,
    /// `CreateResource/vpc`, `DeleteInstance`, ...)
    pub fn fail_next(&self, op: &str, transient: bool, times: u32) {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        failures.push(InjectedFailure {
            op: op.to_string(),
            transient,
            remaining: times,
        });
    }

    fn check_failure(&self, op: &str, kind: Option<&str>) -> Result<()> {
        let qualified = kind.map(|k| format!("{op}/{k}"));
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let hit = failures.iter_mut().find(|f| {
            f.remaining > 0 && (f.op == op || qualified.as_deref() == Some(f.op.as_str()))
        });
        match hit {
            Some(failure) => {
                failure.remaining -= 1;
                let message = format!("injected failure for {op}");
                if failure.transient {
                    Err(CloudError::Transient(message))
                } else {
                    Err(CloudError::Api(message))
                }
            }
            None => Ok(()),
        }
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MockState) -> Result<T> + Send,
        T: Send,
    {
        let mut state = self.state.lock().await;
        let out = f(&mut state)?;
        state.updated_at = Utc::now();
        if let Some(store) = &self.store {
            store.save(&state).await?;
        }
        Ok(out)
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> MockState {
        self.state.lock().await.clone()
    }

    /// Mutating calls made so far
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn max_detached(&self, group_id: &str) -> usize {
        self.state
            .lock()
            .await
            .max_detached
            .get(group_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn instances(&self, group_id: &str) -> Vec<RawInstance> {
        self.state
            .lock()
            .await
            .instances
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn resource_named(&self, kind: &str, name: &str) -> Option<CloudResource> {
        let state = self.state.lock().await;
        state
            .resources
            .values()
            .find(|r| r.kind == kind && r.name == name)
            .cloned()
    }

    /// Seed a pre-existing VPC and its subnets
    pub async fn seed_vpc(&self, vpc_id: &str, cidr: &str, subnets: &[SubnetInfo]) -> Result<()> {
        let vpc_id = vpc_id.to_string();
        let cidr = cidr.to_string();
        let subnets = subnets.to_vec();
        self.mutate(move |state| {
            let mut vpc = bare_resource(kinds::VPC, &vpc_id);
            vpc.attributes.insert("cidr".into(), cidr.into());
            state.resources.insert(vpc_id.clone(), vpc);
            for subnet in subnets {
                let mut res = bare_resource(kinds::SUBNET, &subnet.id);
                res.attributes.insert("vpcId".into(), vpc_id.clone().into());
                res.attributes.insert("zone".into(), subnet.zone.into());
                res.attributes.insert("cidr".into(), subnet.cidr.into());
                res.depends_on.push(vpc_id.clone());
                state.resources.insert(subnet.id, res);
            }
            Ok(())
        })
        .await
    }

    /// Seed an autoscaling group with `size` running instances for `ig`.
    /// Returns the group id.
    pub async fn seed_group(&self, cluster_name: &str, ig: &InstanceGroup, size: usize) -> Result<String> {
        let tags = GroupTagging::for_provider(self.provider).group_tags(cluster_name, ig.name());
        let name = ig.cloud_name(cluster_name);
        let max = (ig.max_size() as usize).max(size);
        self.mutate(move |state| {
            let id = state.allocate_id("asg");
            let mut group = bare_resource(kinds::AUTOSCALING_GROUP, &id);
            group.name = name;
            group.tags = tags;
            group.attributes.insert("minSize".into(), (size as i64).into());
            group.attributes.insert("maxSize".into(), (max as i64).into());
            group.attributes.insert("revision".into(), "seed-1".into());
            state.resources.insert(id.clone(), group);
            fill_group(state, &id);
            Ok(id)
        })
        .await
    }

    /// Make every existing member of a group out of date
    pub async fn bump_revision(&self, group_id: &str) -> Result<()> {
        let group_id = group_id.to_string();
        self.mutate(move |state| {
            let group = state
                .resources
                .get_mut(&group_id)
                .ok_or_else(|| CloudError::not_found(kinds::AUTOSCALING_GROUP, group_id.clone()))?;
            group.version += 1;
            let revision = format!("seed-{}", group.version);
            group.attributes.insert("revision".into(), revision.into());
            Ok(())
        })
        .await
    }

    pub async fn set_api_ingress(&self, ingress: Vec<ApiIngressStatus>) -> Result<()> {
        self.mutate(move |state| {
            state.api_ingress = ingress;
            Ok(())
        })
        .await
    }

    async fn raw_groups(&self) -> Vec<RawCloudGroup> {
        let state = self.state.lock().await;
        state
            .resources
            .values()
            .filter(|r| r.kind == kinds::AUTOSCALING_GROUP)
            .map(|r| {
                let (min, max, desired) = group_sizes(r);
                RawCloudGroup {
                    id: r.id.clone(),
                    name: r.name.clone(),
                    tags: r.tags.clone(),
                    min_size: min,
                    max_size: max,
                    desired,
                    revision: group_revision(state.resources.get(launch_template_id(r)), r),
                    instances: state.instances.get(&r.id).cloned().unwrap_or_default(),
                }
            })
            .collect()
    }
}

fn bare_resource(kind: &str, id: &str) -> CloudResource {
    CloudResource {
        kind: kind.to_string(),
        id: id.to_string(),
        name: id.to_string(),
        tags: BTreeMap::new(),
        attributes: serde_json::Map::new(),
        depends_on: Vec::new(),
        version: 1,
    }
}

fn id_prefix(kind: &str) -> &'static str {
    match kind {
        kinds::VPC => "vpc",
        kinds::SUBNET => "subnet",
        kinds::INTERNET_GATEWAY => "igw",
        kinds::ROUTE_TABLE => "rtb",
        kinds::SECURITY_GROUP => "sg",
        kinds::SECURITY_GROUP_RULE => "sgr",
        kinds::SSH_KEY => "key",
        kinds::LAUNCH_TEMPLATE => "lt",
        kinds::AUTOSCALING_GROUP => "asg",
        kinds::LOAD_BALANCER => "lb",
        _ => "res",
    }
}

fn int_attribute(resource: &CloudResource, key: &str) -> Option<i32> {
    resource
        .attributes
        .get(key)
        .and_then(serde_json::Value::as_i64)
        .map(|v| v as i32)
}

fn group_sizes(group: &CloudResource) -> (i32, i32, i32) {
    let min = int_attribute(group, "minSize").unwrap_or(0);
    let max = int_attribute(group, "maxSize").unwrap_or(min);
    let desired = int_attribute(group, "desiredCapacity").unwrap_or(min);
    (min, max, desired)
}

fn launch_template_id(group: &CloudResource) -> &str {
    group
        .attributes
        .get("launchTemplate")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
}

/// Groups follow the latest version of their launch template
fn group_revision(template: Option<&CloudResource>, group: &CloudResource) -> String {
    match template {
        Some(lt) => format!("{}:{}", lt.id, lt.version),
        None => group
            .attributes
            .get("revision")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Launch instances until the group's live members reach its desired size,
/// or terminate the newest ones beyond it
fn fill_group(state: &mut MockState, group_id: &str) {
    let Some(group) = state.resources.get(group_id) else {
        return;
    };
    let (_, _, desired) = group_sizes(group);
    let template = state.resources.get(launch_template_id(group));
    let revision = group_revision(template, group);
    let machine_type = template
        .and_then(|lt| lt.attributes.get("machineType"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    let live = state
        .instances
        .get(group_id)
        .map(|members| members.iter().filter(|i| !i.detached).count())
        .unwrap_or(0) as i32;

    let mut launched = Vec::new();
    for _ in live..desired {
        launched.push(RawInstance {
            id: state.allocate_id("i"),
            revision: revision.clone(),
            detached: false,
            machine_type: machine_type.clone(),
        });
    }

    let members = state.instances.entry(group_id.to_string()).or_default();
    members.extend(launched);

    let mut excess = live - desired;
    while excess > 0 {
        match members.iter().rposition(|i| !i.detached) {
            Some(pos) => {
                members.remove(pos);
            }
            None => break,
        }
        excess -= 1;
    }
}

fn find_instance<'a>(state: &'a mut MockState, instance: &CloudInstance) -> Result<(&'a mut Vec<RawInstance>, usize)> {
    let members = state
        .instances
        .get_mut(&instance.group_id)
        .ok_or_else(|| CloudError::not_found("instance", instance.id.clone()))?;
    let pos = members
        .iter()
        .position(|i| i.id == instance.id)
        .ok_or_else(|| CloudError::not_found("instance", instance.id.clone()))?;
    Ok((members, pos))
}

#[async_trait]
impl Cloud for MockCloud {
    fn provider_id(&self) -> ProviderId {
        self.provider
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn find_vpc_info(&self, vpc_id: &str) -> Result<Option<VpcInfo>> {
        self.check_failure("FindVpcInfo", None)?;
        let state = self.state.lock().await;
        let Some(vpc) = state.resources.get(vpc_id).filter(|r| r.kind == kinds::VPC) else {
            return Ok(None);
        };
        let attr = |r: &CloudResource, key: &str| {
            r.attributes
                .get(key)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let subnets = state
            .resources
            .values()
            .filter(|r| r.kind == kinds::SUBNET && attr(r, "vpcId") == vpc_id)
            .map(|r| SubnetInfo {
                id: r.id.clone(),
                zone: attr(r, "zone"),
                cidr: attr(r, "cidr"),
            })
            .collect();
        Ok(Some(VpcInfo {
            id: vpc.id.clone(),
            cidr: attr(vpc, "cidr"),
            subnets,
        }))
    }

    async fn get_api_ingress_status(&self, _cluster: &Cluster) -> Result<Vec<ApiIngressStatus>> {
        Ok(self.state.lock().await.api_ingress.clone())
    }

    async fn get_cloud_groups(
        &self,
        cluster: &Cluster,
        instance_groups: &[InstanceGroup],
        warn_unmatched: bool,
        nodes: Option<&[NodeInfo]>,
    ) -> Result<BTreeMap<String, CloudInstanceGroup>> {
        self.check_failure("GetCloudGroups", None)?;
        let raw = self.raw_groups().await;
        Ok(match_cloud_groups(
            self.provider,
            cluster,
            instance_groups,
            &raw,
            warn_unmatched,
            nodes,
        ))
    }

    async fn delete_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.check_failure("DeleteInstance", None)?;
        let auto_replace = self.auto_replace;
        let instance = instance.clone();
        self.mutate(move |state| {
            let (members, pos) = find_instance(state, &instance)?;
            let removed = members.remove(pos);
            state.calls.push(format!("DeleteInstance {}", instance.id));
            if auto_replace && !removed.detached {
                fill_group(state, &instance.group_id);
            }
            Ok(())
        })
        .await
    }

    async fn detach_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.check_failure("DetachInstance", None)?;
        let auto_replace = self.auto_replace;
        let instance = instance.clone();
        self.mutate(move |state| {
            let (members, pos) = find_instance(state, &instance)?;
            members[pos].detached = true;
            let detached = members.iter().filter(|i| i.detached).count();
            let peak = state.max_detached.entry(instance.group_id.clone()).or_default();
            *peak = (*peak).max(detached);
            state.calls.push(format!("DetachInstance {}", instance.id));
            if auto_replace {
                fill_group(state, &instance.group_id);
            }
            Ok(())
        })
        .await
    }

    async fn deregister_instance(&self, instance: &CloudInstance) -> Result<()> {
        self.check_failure("DeregisterInstance", None)?;
        let instance = instance.clone();
        self.mutate(move |state| {
            find_instance(state, &instance)?;
            state.calls.push(format!("DeregisterInstance {}", instance.id));
            Ok(())
        })
        .await
    }

    async fn delete_group(&self, group: &CloudInstanceGroup) -> Result<()> {
        self.check_failure("DeleteGroup", None)?;
        let group_id = group.id.clone();
        self.mutate(move |state| {
            state
                .resources
                .remove(&group_id)
                .ok_or_else(|| CloudError::not_found(kinds::AUTOSCALING_GROUP, group_id.clone()))?;
            state.instances.remove(&group_id);
            state.calls.push(format!("DeleteGroup {group_id}"));
            Ok(())
        })
        .await
    }

    async fn list_resources(&self, cluster_name: &str) -> Result<Vec<ResourceTracker>> {
        self.check_failure("ListResources", None)?;
        let state = self.state.lock().await;
        let ownership_key = format!("{TAG_CLUSTER_OWNERSHIP_PREFIX}{cluster_name}");
        let tagging = GroupTagging::for_provider(self.provider);

        let listed: Vec<&CloudResource> = state
            .resources
            .values()
            .filter(|r| {
                r.tags.contains_key(&ownership_key)
                    || r.tags.get(TAG_CLUSTER).map(String::as_str) == Some(cluster_name)
                    || r.tags.get(tagging.cluster_key) == Some(&tagging.encode(cluster_name))
            })
            .collect();

        let trackers = listed
            .iter()
            .map(|r| ResourceTracker {
                kind: r.kind.clone(),
                id: r.id.clone(),
                name: r.name.clone(),
                shared: r.tags.get(&ownership_key).map(String::as_str) == Some("shared"),
                blocked_by: listed
                    .iter()
                    .filter(|other| other.depends_on.contains(&r.id))
                    .map(|other| other.id.clone())
                    .collect(),
            })
            .collect();
        Ok(trackers)
    }

    async fn delete_resource(&self, tracker: &ResourceTracker) -> Result<()> {
        self.check_failure("DeleteResource", Some(&tracker.kind))?;
        if tracker.shared {
            return Err(CloudError::SharedResource(tracker.to_string()));
        }
        let tracker = tracker.clone();
        self.mutate(move |state| {
            if !state.resources.contains_key(&tracker.id) {
                return Err(CloudError::not_found(tracker.kind.clone(), tracker.id.clone()));
            }
            let dependents: Vec<&str> = state
                .resources
                .values()
                .filter(|r| r.depends_on.contains(&tracker.id))
                .map(|r| r.id.as_str())
                .collect();
            if !dependents.is_empty() {
                return Err(CloudError::DeletionBlocked(format!(
                    "{} is still used by {}",
                    tracker,
                    dependents.join(", ")
                )));
            }
            state.resources.remove(&tracker.id);
            state.instances.remove(&tracker.id);
            state.calls.push(format!("DeleteResource {}/{}", tracker.kind, tracker.id));
            Ok(())
        })
        .await
    }

    fn resources(&self) -> &dyn ResourceApi {
        self
    }
}

#[async_trait]
impl ResourceApi for MockCloud {
    async fn find_resource(
        &self,
        kind: &str,
        name: &str,
        id: Option<&str>,
    ) -> Result<Option<CloudResource>> {
        self.check_failure("FindResource", Some(kind))?;
        let state = self.state.lock().await;
        let found = match id {
            Some(id) => state.resources.get(id).filter(|r| r.kind == kind),
            None => state.resources.values().find(|r| r.kind == kind && r.name == name),
        };
        Ok(found.cloned())
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<CloudResource> {
        self.check_failure("CreateResource", Some(&spec.kind))?;
        let spec = spec.clone();
        self.mutate(move |state| {
            if state
                .resources
                .values()
                .any(|r| r.kind == spec.kind && r.name == spec.name)
            {
                return Err(CloudError::AlreadyExists {
                    kind: spec.kind,
                    name: spec.name,
                });
            }
            let id = state.allocate_id(id_prefix(&spec.kind));
            let resource = CloudResource {
                kind: spec.kind.clone(),
                id: id.clone(),
                name: spec.name.clone(),
                tags: spec.tags,
                attributes: spec.attributes,
                depends_on: spec.depends_on,
                version: 1,
            };
            state.resources.insert(id.clone(), resource.clone());
            state.calls.push(format!("CreateResource {}/{}", spec.kind, spec.name));
            if resource.kind == kinds::AUTOSCALING_GROUP {
                fill_group(state, &id);
            }
            Ok(resource)
        })
        .await
    }

    async fn update_resource(&self, id: &str, spec: &ResourceSpec) -> Result<CloudResource> {
        self.check_failure("UpdateResource", Some(&spec.kind))?;
        let id = id.to_string();
        let spec = spec.clone();
        self.mutate(move |state| {
            let resource = state
                .resources
                .get_mut(&id)
                .ok_or_else(|| CloudError::not_found(spec.kind.clone(), id.clone()))?;
            resource.tags = spec.tags;
            resource.attributes = spec.attributes;
            resource.depends_on = spec.depends_on;
            resource.version += 1;
            let updated = resource.clone();
            state.calls.push(format!("UpdateResource {}/{}", spec.kind, spec.name));
            if updated.kind == kinds::AUTOSCALING_GROUP {
                fill_group(state, &id);
            }
            Ok(updated)
        })
        .await
    }

    async fn tag_resource(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.check_failure("TagResource", None)?;
        let id = id.to_string();
        let tags = tags.clone();
        self.mutate(move |state| {
            let resource = state
                .resources
                .get_mut(&id)
                .ok_or_else(|| CloudError::not_found("resource", id.clone()))?;
            resource.tags.extend(tags);
            state.calls.push(format!("TagResource {id}"));
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::delete_resources;
    use kopsflow_core::InstanceGroupRole;
    use tokio_util::sync::CancellationToken;

    const CLUSTER: &str = "minimal.example.com";

    fn nodes_ig(min: i32, max: i32) -> InstanceGroup {
        let mut ig = InstanceGroup::new("nodes", InstanceGroupRole::Node);
        ig.spec.min_size = Some(min);
        ig.spec.max_size = Some(max);
        ig
    }

    fn owned(kind: &str, name: &str) -> ResourceSpec {
        let mut spec = ResourceSpec::new(kind, name);
        spec.tags.insert(TAG_CLUSTER.into(), CLUSTER.into());
        spec.tags
            .insert(format!("{TAG_CLUSTER_OWNERSHIP_PREFIX}{CLUSTER}"), "owned".into());
        spec
    }

    #[tokio::test]
    async fn test_seeded_group_is_matched() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        let ig = nodes_ig(2, 2);
        cloud.seed_group(CLUSTER, &ig, 2).await.unwrap();

        let groups = cloud
            .get_cloud_groups(&Cluster::new(CLUSTER), &[ig], true, None)
            .await
            .unwrap();
        assert_eq!(groups["nodes"].ready.len(), 2);
        assert!(groups["nodes"].need_update.is_empty());
    }

    #[tokio::test]
    async fn test_bump_revision_marks_members_stale() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        let ig = nodes_ig(2, 2);
        let id = cloud.seed_group(CLUSTER, &ig, 2).await.unwrap();
        cloud.bump_revision(&id).await.unwrap();

        let groups = cloud
            .get_cloud_groups(&Cluster::new(CLUSTER), &[ig], true, None)
            .await
            .unwrap();
        assert_eq!(groups["nodes"].need_update.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_instance_launches_replacement() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        let ig = nodes_ig(1, 1);
        let id = cloud.seed_group(CLUSTER, &ig, 1).await.unwrap();
        cloud.bump_revision(&id).await.unwrap();
        let cluster = Cluster::new(CLUSTER);

        let groups = cloud.get_cloud_groups(&cluster, &[ig.clone()], false, None).await.unwrap();
        let old = groups["nodes"].need_update[0].clone();
        cloud.delete_instance(&old).await.unwrap();

        let groups = cloud.get_cloud_groups(&cluster, &[ig], false, None).await.unwrap();
        assert_eq!(groups["nodes"].ready.len(), 1);
        assert_ne!(groups["nodes"].ready[0].id, old.id);
        assert_eq!(cloud.calls().await, vec![format!("DeleteInstance {}", old.id)]);
    }

    #[tokio::test]
    async fn test_detach_tracks_peak() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        let ig = nodes_ig(2, 3);
        let id = cloud.seed_group(CLUSTER, &ig, 2).await.unwrap();
        let groups = cloud
            .get_cloud_groups(&Cluster::new(CLUSTER), &[ig], false, None)
            .await
            .unwrap();
        let first = groups["nodes"].ready[0].clone();

        cloud.detach_instance(&first).await.unwrap();
        assert_eq!(cloud.max_detached(&id).await, 1);
        // replacement launched, detached member kept
        assert_eq!(cloud.instances(&id).await.len(), 3);

        cloud.delete_instance(&first).await.unwrap();
        assert_eq!(cloud.instances(&id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_create_duplicate_name_fails() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        cloud.create_resource(&owned(kinds::VPC, CLUSTER)).await.unwrap();
        let err = cloud.create_resource(&owned(kinds::VPC, CLUSTER)).await.unwrap_err();
        assert!(matches!(err, CloudError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_launch_template_update_bumps_group_revision() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        let lt = cloud
            .create_resource(&owned(kinds::LAUNCH_TEMPLATE, "nodes.minimal.example.com").attribute("machineType", "t3.medium"))
            .await
            .unwrap();
        let ig = nodes_ig(2, 2);
        let mut asg = owned(kinds::AUTOSCALING_GROUP, "nodes.minimal.example.com")
            .attribute("minSize", 2)
            .attribute("maxSize", 2)
            .attribute("launchTemplate", lt.id.clone());
        asg.tags.insert("kops.k8s.io/instancegroup".into(), "nodes".into());
        asg.depends_on.push(lt.id.clone());
        cloud.create_resource(&asg).await.unwrap();

        let cluster = Cluster::new(CLUSTER);
        let groups = cloud.get_cloud_groups(&cluster, &[ig.clone()], false, None).await.unwrap();
        assert_eq!(groups["nodes"].ready.len(), 2);
        assert_eq!(groups["nodes"].ready[0].machine_type.as_deref(), Some("t3.medium"));

        let changed = owned(kinds::LAUNCH_TEMPLATE, "nodes.minimal.example.com")
            .attribute("machineType", "t3.large");
        cloud.update_resource(&lt.id, &changed).await.unwrap();

        let groups = cloud.get_cloud_groups(&cluster, &[ig], false, None).await.unwrap();
        assert_eq!(groups["nodes"].need_update.len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        cloud.fail_next("CreateResource/vpc", true, 1);

        let err = cloud.create_resource(&owned(kinds::VPC, CLUSTER)).await.unwrap_err();
        assert!(err.is_transient());
        cloud.create_resource(&owned(kinds::VPC, CLUSTER)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ordered_deletion_keeps_shared() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        cloud
            .seed_vpc(
                "vpc-12345678",
                "172.20.0.0/16",
                &[SubnetInfo {
                    id: "subnet-12345678".into(),
                    zone: "us-test-1a".into(),
                    cidr: "172.20.32.0/19".into(),
                }],
            )
            .await
            .unwrap();
        let shared_tag =
            BTreeMap::from([(format!("{TAG_CLUSTER_OWNERSHIP_PREFIX}{CLUSTER}"), "shared".to_string())]);
        cloud.tag_resource("subnet-12345678", &shared_tag).await.unwrap();

        let mut sg = owned(kinds::SECURITY_GROUP, "nodes.minimal.example.com");
        sg.depends_on.push("vpc-12345678".into());
        let sg = cloud.create_resource(&sg).await.unwrap();
        let mut rule = owned(kinds::SECURITY_GROUP_RULE, "all-node-to-node");
        rule.depends_on.push(sg.id.clone());
        cloud.create_resource(&rule).await.unwrap();

        let trackers = cloud.list_resources(CLUSTER).await.unwrap();
        let subnet = trackers.iter().find(|t| t.id == "subnet-12345678").unwrap();
        assert!(subnet.shared);
        assert!(cloud.delete_resource(subnet).await.is_err());

        let report = delete_resources(&cloud, trackers, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.rounds.len(), 2);
        assert_eq!(report.rounds[0][0].kind, kinds::SECURITY_GROUP_RULE);
        assert_eq!(report.retained.len(), 1);
        assert!(cloud.find_vpc_info("vpc-12345678").await.unwrap().is_some());
        assert!(cloud.list_resources(CLUSTER).await.unwrap().iter().all(|t| t.shared));
    }

    #[tokio::test]
    async fn test_find_vpc_info() {
        let cloud = MockCloud::new(ProviderId::Aws, "us-test-1");
        cloud
            .seed_vpc(
                "vpc-1",
                "10.1.0.0/16",
                &[SubnetInfo {
                    id: "subnet-1".into(),
                    zone: "us-test-1a".into(),
                    cidr: "10.1.0.0/24".into(),
                }],
            )
            .await
            .unwrap();

        let info = cloud.find_vpc_info("vpc-1").await.unwrap().unwrap();
        assert_eq!(info.cidr, "10.1.0.0/16");
        assert_eq!(info.subnets.len(), 1);
        assert_eq!(info.subnets[0].zone, "us-test-1a");
        assert!(cloud.find_vpc_info("vpc-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persisted_state_is_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.json");

        let first = MockCloud::open(ProviderId::Aws, "us-test-1", &path).await.unwrap();
        first.create_resource(&owned(kinds::VPC, CLUSTER)).await.unwrap();

        let second = MockCloud::open(ProviderId::Aws, "us-test-1", &path).await.unwrap();
        let vpc = second.find_resource(kinds::VPC, CLUSTER, None).await.unwrap();
        assert!(vpc.is_some());
    }
}
