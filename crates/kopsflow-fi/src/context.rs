//! Execution context shared by every task of one run

use crate::error::{FiError, Result};
use crate::target::Target;
use crate::task::{TaskKey, TaskRef, replace_refs};
use kopsflow_cloud::Cloud;
use kopsflow_pki::{Keystore, SecretStore};
use kopsflow_vfs::VfsPath;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

pub struct Context {
    pub cluster_name: String,
    pub target: Target,
    pub cloud: Option<Arc<dyn Cloud>>,
    pub keystore: Arc<dyn Keystore>,
    pub secret_store: Option<Arc<dyn SecretStore>>,
    /// Cluster root in the registry, where managed files live
    pub config_base: Option<VfsPath>,
    pub cancel: CancellationToken,
    outputs: RwLock<HashMap<TaskKey, Value>>,
}

impl Context {
    pub fn new(cluster_name: impl Into<String>, target: Target, keystore: Arc<dyn Keystore>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            target,
            cloud: None,
            keystore,
            secret_store: None,
            config_base: None,
            cancel: CancellationToken::new(),
            outputs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn Cloud>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    pub fn with_config_base(mut self, base: VfsPath) -> Self {
        self.config_base = Some(base);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cloud(&self) -> Result<&Arc<dyn Cloud>> {
        self.cloud.as_ref().ok_or_else(|| {
            FiError::Cloud(kopsflow_cloud::CloudError::InvalidConfig(
                "no cloud configured for this run".into(),
            ))
        })
    }

    /// Whether `find` should query the cloud
    pub fn reads_cloud(&self) -> bool {
        self.cloud.is_some() && self.target.reads_cloud()
    }

    pub fn set_output(&self, key: TaskKey, outputs: Value) {
        let mut map = self
            .outputs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(key, outputs);
    }

    pub fn output(&self, key: &TaskKey) -> Option<Value> {
        let map = self
            .outputs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.get(key).cloned()
    }

    /// Id a reference resolved to
    pub fn resolve_id(&self, r: &TaskRef) -> Result<String> {
        self.output(r.key())
            .and_then(|o| o.get("id").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| FiError::UnresolvedOutput(r.key().clone()))
    }

    /// `inputs` with every reference replaced by its resolved id; references
    /// not resolved yet (dry-run) keep their `Type/name` text
    pub fn resolve_refs(&self, inputs: &Value) -> Value {
        replace_refs(inputs, &|r| match self.resolve_id(r) {
            Ok(id) => Value::String(id),
            Err(_) => Value::String(r.key().to_string()),
        })
    }
}
