//! Task identity, references and the `Task` trait

use crate::changes::Changes;
use crate::context::Context;
use crate::error::{FiError, Result};
use crate::target::{cloudformation::CloudFormationTarget, terraform::TerraformTarget};
use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// JSON key marking a reference inside a task's inputs
pub const REF_KEY: &str = "$ref";

/// Identity of a task: `(type, name)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub type_name: String,
    pub name: String,
}

impl TaskKey {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.name)
    }
}

impl FromStr for TaskKey {
    type Err = FiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((type_name, name)) if !type_name.is_empty() && !name.is_empty() => {
                Ok(TaskKey::new(type_name, name))
            }
            _ => Err(FiError::InvalidReference(s.to_string())),
        }
    }
}

/// Reference from one task's inputs to another task.
///
/// Serialized as `{"$ref": "Type/name"}`; the executor discovers
/// dependencies by finding these objects in a task's serialized inputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskRef(pub TaskKey);

impl TaskRef {
    pub fn new(type_name: &str, name: impl Into<String>) -> Self {
        TaskRef(TaskKey::new(type_name, name))
    }

    pub fn key(&self) -> &TaskKey {
        &self.0
    }

    /// Reference found at this JSON node, if it is one
    pub fn from_value(value: &Value) -> Option<TaskRef> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        obj.get(REF_KEY)?.as_str()?.parse().ok().map(TaskRef)
    }
}

impl Serialize for TaskRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(REF_KEY, &self.0.to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for TaskRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(rename = "$ref")]
            target: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        wire.target.parse().map(TaskRef).map_err(de::Error::custom)
    }
}

/// How the executor treats a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Converge the cloud to the task
    #[default]
    Sync,
    /// Skip the task entirely
    Ignore,
    /// The resource must exist and match
    ExistsAndValidates,
    /// The resource must exist; differences are only logged
    ExistsAndWarnIfChanges,
}

impl FromStr for Lifecycle {
    type Err = FiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Sync" => Ok(Lifecycle::Sync),
            "Ignore" => Ok(Lifecycle::Ignore),
            "ExistsAndValidates" => Ok(Lifecycle::ExistsAndValidates),
            "ExistsAndWarnIfChanges" => Ok(Lifecycle::ExistsAndWarnIfChanges),
            other => Err(FiError::UnknownLifecycle(other.to_string())),
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Sync => "Sync",
            Lifecycle::Ignore => "Ignore",
            Lifecycle::ExistsAndValidates => "ExistsAndValidates",
            Lifecycle::ExistsAndWarnIfChanges => "ExistsAndWarnIfChanges",
        };
        write!(f, "{s}")
    }
}

/// How a differing field is reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Updated in place
    #[default]
    Reconcile,
    /// A difference forces the resource to be recreated
    Immutable,
    /// Never compared
    NotManaged,
}

/// An idempotent unit of work.
///
/// The task value itself is the desired state. `find` reports the observed
/// state in the same JSON shape as `inputs`, with references replaced by the
/// ids they resolve to.
#[async_trait]
pub trait Task: fmt::Debug + Send + Sync {
    fn key(&self) -> TaskKey;

    /// Declared inputs; every `TaskRef` inside becomes a dependency
    fn inputs(&self) -> Result<Value>;

    /// Lookup of a pre-existing resource the cluster does not own
    fn is_shared(&self) -> bool {
        false
    }

    /// Whether the task acts on the cloud. Tasks that act on the registry
    /// run for every target except dry-run.
    fn is_cloud_task(&self) -> bool {
        true
    }

    fn field_policy(&self, _field: &str) -> FieldPolicy {
        FieldPolicy::Reconcile
    }

    /// Upper bound for retrying transient failures on the direct target
    fn max_duration(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }

    async fn find(&self, ctx: &Context) -> Result<Option<Value>>;

    /// Reject changes the resource cannot accept
    fn check_changes(&self, _actual: Option<&Value>, _changes: &Changes) -> Result<()> {
        Ok(())
    }

    /// Converge the resource; returns the task's outputs (at least `id`)
    async fn render_direct(
        &self,
        ctx: &Context,
        expected: &Value,
        actual: Option<&Value>,
        changes: &Changes,
    ) -> Result<Value>;

    fn render_terraform(&self, _ctx: &Context, _tf: &TerraformTarget) -> Result<Value> {
        Err(FiError::UnsupportedTarget {
            key: self.key(),
            target: "terraform".into(),
        })
    }

    fn render_cloudformation(&self, _ctx: &Context, _cf: &CloudFormationTarget) -> Result<Value> {
        Err(FiError::UnsupportedTarget {
            key: self.key(),
            target: "cloudformation".into(),
        })
    }
}

/// Implements `key` and `inputs` for a serializable task with a `name` field
#[macro_export]
macro_rules! task_identity {
    ($type_name:expr) => {
        fn key(&self) -> $crate::task::TaskKey {
            $crate::task::TaskKey::new($type_name, self.name.clone())
        }

        fn inputs(&self) -> $crate::error::Result<$crate::Value> {
            $crate::task::to_inputs(self)
        }
    };
}

/// Serialized inputs of a task
pub fn to_inputs<T: Serialize + ?Sized>(task: &T) -> Result<Value> {
    Ok(serde_json::to_value(task)?)
}

/// Every reference found in `value`, in document order
pub fn collect_refs(value: &Value) -> Vec<TaskRef> {
    let mut refs = Vec::new();
    walk_refs(value, &mut refs);
    refs
}

fn walk_refs(value: &Value, refs: &mut Vec<TaskRef>) {
    if let Some(r) = TaskRef::from_value(value) {
        refs.push(r);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| walk_refs(v, refs)),
        Value::Object(map) => map.values().for_each(|v| walk_refs(v, refs)),
        _ => {}
    }
}

/// Replace every reference in `value` using `resolve`
pub fn replace_refs(value: &Value, resolve: &dyn Fn(&TaskRef) -> Value) -> Value {
    if let Some(r) = TaskRef::from_value(value) {
        return resolve(&r);
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| replace_refs(v, resolve)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), replace_refs(v, resolve)))
                .collect(),
        ),
        other => other.clone(),
    }
}
