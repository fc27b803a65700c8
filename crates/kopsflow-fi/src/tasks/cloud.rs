//! Shared plumbing for tasks backed by a [`CloudResource`]

use crate::changes::Changes;
use crate::context::Context;
use crate::error::Result;
use crate::task::{Task, collect_refs};
use kopsflow_cloud::{CloudResource, ResourceSpec, ResourceTracker};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Fields carried outside a resource's attributes
const RESERVED: [&str; 4] = ["name", "id", "shared", "tags"];

/// Observed state of `resource` in the shape of the task's inputs
pub fn observed(resource: &CloudResource) -> Value {
    let mut object = resource.attributes.clone();
    object.insert("id".into(), Value::String(resource.id.clone()));
    object.insert("name".into(), Value::String(resource.name.clone()));
    object.insert(
        "tags".into(),
        Value::Object(
            resource
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
    );
    Value::Object(object)
}

/// Look a resource up by id when known, by name otherwise
pub async fn find(ctx: &Context, kind: &str, name: &str, id: Option<&str>) -> Result<Option<Value>> {
    let found = ctx.cloud()?.resources().find_resource(kind, name, id).await?;
    Ok(found.as_ref().map(observed))
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Create, update or recreate the resource so it matches `expected`.
///
/// A shared resource is never modified beyond its tags.
pub async fn apply(
    ctx: &Context,
    kind: &str,
    task: &dyn Task,
    expected: &Value,
    actual: Option<&Value>,
    changes: &Changes,
) -> Result<Value> {
    let resources = ctx.cloud()?.resources();
    let tags = string_map(expected.get("tags"));

    if task.is_shared() {
        let Some(actual) = actual else {
            return Err(crate::error::FiError::SharedNotFound(task.key()));
        };
        let id = actual.get("id").and_then(Value::as_str).unwrap_or_default();
        if changes.contains("tags") {
            resources.tag_resource(id, &tags).await?;
        }
        let mut updated = actual.clone();
        if let Some(have) = updated.get_mut("tags").and_then(Value::as_object_mut) {
            for (k, v) in &tags {
                have.insert(k.clone(), Value::String(v.clone()));
            }
        }
        return Ok(updated);
    }

    let mut attributes = Map::new();
    if let Some(fields) = expected.as_object() {
        for (field, value) in fields {
            if !value.is_null() && !RESERVED.contains(&field.as_str()) {
                attributes.insert(field.clone(), value.clone());
            }
        }
    }

    let mut depends_on = Vec::new();
    for r in collect_refs(&task.inputs()?) {
        depends_on.push(ctx.resolve_id(&r)?);
    }
    depends_on.sort();
    depends_on.dedup();

    let spec = ResourceSpec {
        kind: kind.to_string(),
        name: task.key().name,
        tags,
        attributes,
        depends_on,
    };

    let existing_id = actual
        .and_then(|a| a.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let resource = match existing_id {
        None => resources.create_resource(&spec).await?,
        Some(id) if changes.recreate => {
            tracing::info!("Recreating {} {} ({}): {}", kind, spec.name, id, changes.field_names().join(", "));
            ctx.cloud()?
                .delete_resource(&ResourceTracker {
                    kind: kind.to_string(),
                    id,
                    name: spec.name.clone(),
                    shared: false,
                    blocked_by: Vec::new(),
                })
                .await?;
            resources.create_resource(&spec).await?
        }
        Some(id) => resources.update_resource(&id, &spec).await?,
    };

    Ok(observed(&resource))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_shape() {
        let resource = CloudResource {
            kind: "vpc".into(),
            id: "vpc-1".into(),
            name: "a.example.com".into(),
            tags: BTreeMap::from([("Name".to_string(), "a.example.com".to_string())]),
            attributes: serde_json::json!({"cidr": "10.0.0.0/16"})
                .as_object()
                .cloned()
                .unwrap(),
            depends_on: vec![],
            version: 1,
        };
        assert_eq!(
            observed(&resource),
            serde_json::json!({
                "id": "vpc-1",
                "name": "a.example.com",
                "cidr": "10.0.0.0/16",
                "tags": {"Name": "a.example.com"}
            })
        );
    }
}
