//! Field-by-field diff of observed against desired state

use crate::task::{FieldPolicy, Task};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Fields that identify a resource rather than describe it
const IDENTITY_FIELDS: [&str; 3] = ["name", "id", "shared"];

/// Tag maps are compared as subsets: tags added out-of-band are left alone
const TAGS_FIELD: &str = "tags";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub actual: Option<Value>,
    pub expected: Value,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.actual {
            Some(actual) => write!(f, "{}: {} -> {}", self.field, actual, self.expected),
            None => write!(f, "{}: {}", self.field, self.expected),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Changes {
    pub fields: Vec<FieldChange>,
    /// An immutable field differs on an existing resource
    pub recreate: bool,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.fields.iter().find(|c| c.field == field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|c| c.field.as_str()).collect()
    }
}

/// Compute the changes needed to turn `actual` into `expected`.
///
/// Unset (`null`) expected fields are not managed. Shared tasks only
/// reconcile their tags.
pub fn diff(task: &dyn Task, expected: &Value, actual: Option<&Value>) -> Changes {
    let mut changes = Changes::default();
    let Some(expected) = expected.as_object() else {
        return changes;
    };

    for (field, want) in expected {
        if want.is_null() || IDENTITY_FIELDS.contains(&field.as_str()) {
            continue;
        }
        if task.is_shared() && field != TAGS_FIELD {
            continue;
        }
        let policy = task.field_policy(field);
        if policy == FieldPolicy::NotManaged {
            continue;
        }

        let have = actual.and_then(|a| a.get(field));
        let same = match have {
            Some(have) if field == TAGS_FIELD => is_subset(want, have),
            Some(have) => have == want || (is_empty(want) && have.is_null()),
            None => is_empty(want),
        };
        if same {
            continue;
        }

        if actual.is_some() && policy == FieldPolicy::Immutable {
            changes.recreate = true;
        }
        changes.fields.push(FieldChange {
            field: field.clone(),
            actual: have.cloned(),
            expected: want.clone(),
        });
    }

    changes
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_subset(want: &Value, have: &Value) -> bool {
    match (want.as_object(), have.as_object()) {
        (Some(want), Some(have)) => want.iter().all(|(k, v)| have.get(k) == Some(v)),
        _ => want == have,
    }
}
