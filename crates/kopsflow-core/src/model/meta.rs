use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version written by this build
pub const API_VERSION: &str = "kops.k8s.io/v1alpha2";
/// Older version still accepted on read
pub const LEGACY_API_VERSION: &str = "kops.k8s.io/v1alpha1";

/// Annotation that forces a node to be replaced by the next rolling update
pub const ANNOTATION_NEEDS_UPDATE: &str = "kops.k8s.io/needs-update";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Fields this build does not model, kept for read-modify-write
pub type UnknownFields = BTreeMap<String, serde_json::Value>;
