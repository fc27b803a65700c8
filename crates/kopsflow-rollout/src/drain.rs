//! Cordon and drain a node through the eviction API

use crate::error::{Result, RolloutError};
use crate::k8s::{KubeClient, Pod};
use crate::wait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DrainOptions {
    /// Give up on the node after this long
    pub timeout: Duration,
    /// Overrides each pod's termination grace period when set
    pub grace_period: Option<Duration>,
    /// Pause between eviction attempts refused by a disruption budget
    pub retry_interval: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
            grace_period: None,
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub evicted: Vec<String>,
    /// DaemonSet, mirror and finished pods left in place
    pub skipped: Vec<String>,
}

pub struct Drainer<'a> {
    kube: &'a dyn KubeClient,
    options: DrainOptions,
}

impl<'a> Drainer<'a> {
    pub fn new(kube: &'a dyn KubeClient, options: DrainOptions) -> Self {
        Self { kube, options }
    }

    fn should_evict(pod: &Pod) -> bool {
        !(pod.is_daemonset() || pod.is_mirror() || pod.is_finished())
    }

    /// Cordon `node` and evict its pods.
    ///
    /// On cancellation the node is uncordoned again before returning, so it
    /// is left either drained or schedulable.
    pub async fn drain(&self, node: &str, cancel: &CancellationToken) -> Result<DrainReport> {
        tracing::info!(node, "Cordoning node");
        self.kube.set_unschedulable(node, true).await?;

        match self.evict_all(node, cancel).await {
            Err(RolloutError::Cancelled) => {
                tracing::warn!(node, "Drain cancelled; uncordoning node");
                self.kube.set_unschedulable(node, false).await?;
                Err(RolloutError::Cancelled)
            }
            other => other,
        }
    }

    async fn evict_all(&self, node: &str, cancel: &CancellationToken) -> Result<DrainReport> {
        let deadline = Instant::now() + self.options.timeout;
        let pods = self.kube.list_pods(None, Some(node)).await?;

        let mut report = DrainReport::default();
        for pod in &pods {
            if !Self::should_evict(pod) {
                tracing::debug!(pod = %pod.key(), "Skipping pod");
                report.skipped.push(pod.key());
                continue;
            }
            self.evict(node, pod, deadline, cancel).await?;
            report.evicted.push(pod.key());
        }

        self.wait_for_deletion(node, &report.evicted, deadline, cancel)
            .await?;
        tracing::info!(node, evicted = report.evicted.len(), "Drained node");
        Ok(report)
    }

    async fn evict(&self, node: &str, pod: &Pod, deadline: Instant, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self
                .kube
                .evict_pod(&pod.namespace, &pod.name, self.options.grace_period)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_too_many_requests() || e.is_transient() => {
                    if Instant::now() + self.options.retry_interval > deadline {
                        return Err(RolloutError::Drain {
                            node: node.to_string(),
                            message: format!("timed out evicting {}: {}", pod.key(), e),
                        });
                    }
                    tracing::debug!(pod = %pod.key(), "Eviction refused, retrying: {}", e);
                    wait::sleep(self.options.retry_interval, cancel).await?;
                }
                Err(e) => {
                    return Err(RolloutError::Drain {
                        node: node.to_string(),
                        message: format!("evicting {}: {}", pod.key(), e),
                    });
                }
            }
        }
    }

    async fn wait_for_deletion(
        &self,
        node: &str,
        evicted: &[String],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if evicted.is_empty() {
            return Ok(());
        }
        loop {
            let remaining: Vec<String> = self
                .kube
                .list_pods(None, Some(node))
                .await?
                .iter()
                .map(Pod::key)
                .filter(|key| evicted.contains(key))
                .collect();
            if remaining.is_empty() {
                return Ok(());
            }
            if Instant::now() + self.options.retry_interval > deadline {
                return Err(RolloutError::Drain {
                    node: node.to_string(),
                    message: format!("pods still terminating: {}", remaining.join(", ")),
                });
            }
            wait::sleep(self.options.retry_interval, cancel).await?;
        }
    }
}
