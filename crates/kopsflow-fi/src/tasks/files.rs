//! Files published to the cluster's registry path

use super::types;
use crate::changes::Changes;
use crate::context::Context;
use crate::error::{FiError, Result};
use crate::task::{FieldPolicy, Task};
use async_trait::async_trait;
use kopsflow_vfs::{Acl, VfsPath};
use serde::Serialize;
use serde_json::{Value, json};

/// A file under the cluster root, e.g. the bootstrap configuration nodes
/// fetch at boot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedFile {
    pub name: String,
    /// Path relative to the cluster root
    pub location: String,
    pub contents: String,
    pub public: bool,
}

impl ManagedFile {
    fn path(&self, ctx: &Context) -> Result<VfsPath> {
        ctx.config_base
            .as_ref()
            .map(|base| base.join(&self.location))
            .ok_or(FiError::NotConfigured("cluster registry path"))
    }
}

#[async_trait]
impl Task for ManagedFile {
    crate::task_identity!(types::MANAGED_FILE);

    fn is_cloud_task(&self) -> bool {
        false
    }

    fn field_policy(&self, field: &str) -> FieldPolicy {
        match field {
            "public" => FieldPolicy::NotManaged,
            _ => FieldPolicy::Reconcile,
        }
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>> {
        let Some(data) = self.path(ctx)?.read_optional().await? else {
            return Ok(None);
        };
        Ok(Some(json!({
            "id": self.location,
            "name": self.name,
            "location": self.location,
            "contents": String::from_utf8_lossy(&data),
        })))
    }

    async fn render_direct(
        &self,
        ctx: &Context,
        _expected: &Value,
        _actual: Option<&Value>,
        _changes: &Changes,
    ) -> Result<Value> {
        let acl = if self.public { Acl::PublicRead } else { Acl::Private };
        self.path(ctx)?.write(self.contents.as_bytes(), acl).await?;
        tracing::debug!("Wrote {}", self.location);
        Ok(json!({ "id": self.location }))
    }
}
