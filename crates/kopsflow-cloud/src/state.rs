//! Simulator state persistence
//!
//! The simulator cloud can keep its state in a JSON file so that separate
//! `kops` invocations observe one consistent fake cloud.

use crate::error::{CloudError, Result};
use crate::groups::RawInstance;
use crate::provider::ApiIngressStatus;
use crate::resources::CloudResource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Current state file version
pub const STATE_VERSION: u32 = 1;

/// Everything the simulator knows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockState {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    /// Counter behind generated ids
    pub next_id: u64,
    /// Resources by id
    #[serde(default)]
    pub resources: BTreeMap<String, CloudResource>,
    /// Members of each autoscaling group, by group id
    #[serde(default)]
    pub instances: BTreeMap<String, Vec<RawInstance>>,
    #[serde(default)]
    pub api_ingress: Vec<ApiIngressStatus>,
    /// Mutating calls, in order
    #[serde(default)]
    pub calls: Vec<String>,
    /// Highest number of simultaneously detached instances, by group id
    #[serde(default)]
    pub max_detached: BTreeMap<String, usize>,
}

impl Default for MockState {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            next_id: 1,
            resources: BTreeMap::new(),
            instances: BTreeMap::new(),
            api_ingress: Vec::new(),
            calls: Vec::new(),
            max_detached: BTreeMap::new(),
        }
    }

    /// Next id with the given prefix, e.g. `vpc-0000000000000001`
    pub fn allocate_id(&mut self, prefix: &str) -> String {
        let id = format!("{}-{:016x}", prefix, self.next_id);
        self.next_id += 1;
        id
    }
}

/// JSON state file with a single backup generation
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut backup = self.path.clone().into_os_string();
        backup.push(".bak");
        PathBuf::from(backup)
    }

    /// Load the state, or an empty one when the file does not exist yet
    pub async fn load(&self) -> Result<MockState> {
        if !fs::try_exists(&self.path).await? {
            tracing::debug!("State file {} not found, starting empty", self.path.display());
            return Ok(MockState::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let state: MockState = serde_json::from_str(&content)?;

        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded simulator state with {} resources", state.resources.len());
        Ok(state)
    }

    pub async fn save(&self, state: &MockState) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).await?;
        }

        if fs::try_exists(&self.path).await? {
            fs::copy(&self.path, self.backup_path()).await?;
        }

        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;

        tracing::debug!("Saved simulator state with {} resources", state.resources.len());
        Ok(())
    }
}
