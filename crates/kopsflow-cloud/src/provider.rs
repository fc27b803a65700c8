//! Cloud trait definition

use crate::error::{CloudError, Result};
use crate::groups::{CloudInstance, CloudInstanceGroup, NodeInfo};
use crate::resources::{CloudResource, ResourceSpec, ResourceTracker};
use async_trait::async_trait;
use kopsflow_core::{Cluster, InstanceGroup, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cloud abstraction
///
/// Every provider (AWS, GCE, Azure, ...) implements this trait. The task
/// executor, the rolling updater and `delete cluster` program against it
/// only.
#[async_trait]
pub trait Cloud: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    fn region(&self) -> &str;

    /// Describe an existing network, for shared-VPC clusters
    async fn find_vpc_info(&self, vpc_id: &str) -> Result<Option<VpcInfo>>;

    /// Addresses the API load balancer (or DNS) answers on
    async fn get_api_ingress_status(&self, cluster: &Cluster) -> Result<Vec<ApiIngressStatus>>;

    /// Map the cloud's groups onto `instance_groups`, keyed by instance group
    /// name
    async fn get_cloud_groups(
        &self,
        cluster: &Cluster,
        instance_groups: &[InstanceGroup],
        warn_unmatched: bool,
        nodes: Option<&[NodeInfo]>,
    ) -> Result<BTreeMap<String, CloudInstanceGroup>>;

    /// Terminate an instance; its group launches a replacement
    async fn delete_instance(&self, instance: &CloudInstance) -> Result<()>;

    /// Detach an instance from its group without terminating it, so the
    /// group launches a replacement first
    async fn detach_instance(&self, instance: &CloudInstance) -> Result<()>;

    /// Remove an instance from the load balancers in front of it
    async fn deregister_instance(&self, instance: &CloudInstance) -> Result<()>;

    async fn delete_group(&self, group: &CloudInstanceGroup) -> Result<()>;

    /// Every resource tagged for the cluster, owned or shared
    async fn list_resources(&self, cluster_name: &str) -> Result<Vec<ResourceTracker>>;

    async fn delete_resource(&self, tracker: &ResourceTracker) -> Result<()>;

    /// Generic resource calls used by the direct task target
    fn resources(&self) -> &dyn ResourceApi;
}

/// Resource-level calls the direct target issues
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Look a resource up by id when given, by kind and name otherwise
    async fn find_resource(
        &self,
        kind: &str,
        name: &str,
        id: Option<&str>,
    ) -> Result<Option<CloudResource>>;

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<CloudResource>;

    async fn update_resource(&self, id: &str, spec: &ResourceSpec) -> Result<CloudResource>;

    /// Merge `tags` into an existing resource's tags
    async fn tag_resource(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcInfo {
    pub id: String,
    pub cidr: String,
    pub subnets: Vec<SubnetInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub id: String,
    pub zone: String,
    pub cidr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiIngressStatus {
    pub hostname: Option<String>,
    pub ip: Option<String>,
}

/// Retry configuration for cloud API calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Give up once this much time has passed, whatever the attempt count
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Retry until `max_elapsed`, regardless of attempts
    pub fn for_duration(max_elapsed: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            max_elapsed: Some(max_elapsed),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op`, retrying transient failures with capped exponential backoff
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let started = tokio::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CloudError::Cancelled);
            }
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.may_retry(attempt, started.elapsed()) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!("{} failed (attempt {}): {}; retrying in {:?}", what, attempt, e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn may_retry(&self, attempt: u32, elapsed: Duration) -> bool {
        attempt < self.max_attempts && self.max_elapsed.is_none_or(|max| elapsed < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result = RetryConfig::default()
            .run(&cancel, "describe", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CloudError::Transient("throttled".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let cancel = CancellationToken::new();
        let result: Result<()> = RetryConfig::default()
            .run(&cancel, "describe", || async {
                Err(CloudError::Transient("throttled".into()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<()> = RetryConfig::default()
            .run(&cancel, "create", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CloudError::Api("invalid parameter".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = RetryConfig::default()
            .run(&cancel, "create", || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(CloudError::Cancelled)));
    }
}
