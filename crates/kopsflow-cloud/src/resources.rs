//! Cloud resources and ordered cluster deletion

use crate::error::{CloudError, Result};
use crate::provider::Cloud;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Resource kinds the cloud tasks manage
pub mod kinds {
    pub const VPC: &str = "vpc";
    pub const SUBNET: &str = "subnet";
    pub const INTERNET_GATEWAY: &str = "internet-gateway";
    pub const ROUTE_TABLE: &str = "route-table";
    pub const SECURITY_GROUP: &str = "security-group";
    pub const SECURITY_GROUP_RULE: &str = "security-group-rule";
    pub const SSH_KEY: &str = "ssh-key";
    pub const LAUNCH_TEMPLATE: &str = "launch-template";
    pub const AUTOSCALING_GROUP: &str = "autoscaling-group";
    pub const LOAD_BALANCER: &str = "load-balancer";
}

/// A resource as the cloud reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudResource {
    pub kind: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Ids of resources this one references
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Bumped on every update
    #[serde(default)]
    pub version: u64,
}

/// Desired shape of a resource, as sent to create or update calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// A resource found while listing a cluster, for deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTracker {
    pub kind: String,
    pub id: String,
    pub name: String,
    /// Pre-existing resource the cluster only uses
    pub shared: bool,
    /// Ids of resources that must be deleted before this one
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl fmt::Display for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)?;
        if self.name != self.id {
            write!(f, " ({})", self.name)?;
        }
        Ok(())
    }
}

/// Outcome of [`delete_resources`]
#[derive(Debug, Default)]
pub struct DeletionReport {
    /// Deleted resources, one entry per round
    pub rounds: Vec<Vec<ResourceTracker>>,
    /// Shared resources left in place
    pub retained: Vec<ResourceTracker>,
}

impl DeletionReport {
    pub fn deleted(&self) -> impl Iterator<Item = &ResourceTracker> {
        self.rounds.iter().flatten()
    }
}

/// Delete every owned tracker, in rounds.
///
/// A round deletes, concurrently, every tracker whose blockers are gone.
/// Shared trackers never get deleted and never block. A round that cannot
/// make progress fails with the remaining trackers listed.
pub async fn delete_resources(
    cloud: &dyn Cloud,
    trackers: Vec<ResourceTracker>,
    cancel: &CancellationToken,
) -> Result<DeletionReport> {
    let mut report = DeletionReport::default();
    let (shared, mut pending): (Vec<_>, Vec<_>) = trackers.into_iter().partition(|t| t.shared);
    for tracker in &shared {
        tracing::info!("Not deleting shared resource {}", tracker);
    }
    report.retained = shared;

    let mut remaining: BTreeSet<String> = pending.iter().map(|t| t.id.clone()).collect();

    while !pending.is_empty() {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }

        let (ready, blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|t| t.blocked_by.iter().all(|b| !remaining.contains(b)));

        if ready.is_empty() {
            let names: Vec<String> = blocked.iter().map(|t| t.to_string()).collect();
            return Err(CloudError::DeletionBlocked(format!(
                "no progress possible; remaining: {}",
                names.join(", ")
            )));
        }

        tracing::debug!("Deletion round {}: {} resources", report.rounds.len() + 1, ready.len());
        let results = join_all(ready.iter().map(|t| cloud.delete_resource(t))).await;

        let mut deleted = Vec::new();
        let mut retry = Vec::new();
        for (tracker, result) in ready.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    tracing::info!("Deleted {}", tracker);
                    remaining.remove(&tracker.id);
                    deleted.push(tracker);
                }
                Err(e) if e.is_not_found() => {
                    remaining.remove(&tracker.id);
                    deleted.push(tracker);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("Deleting {} failed, will retry: {}", tracker, e);
                    retry.push(tracker);
                }
                Err(e) => return Err(e),
            }
        }

        if deleted.is_empty() {
            return Err(CloudError::DeletionBlocked(format!(
                "no resource could be deleted this round; remaining: {}",
                retry.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
            )));
        }

        report.rounds.push(deleted);
        pending = blocked;
        pending.extend(retry);
    }

    Ok(report)
}
