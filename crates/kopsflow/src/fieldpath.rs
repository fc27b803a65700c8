//! Dotted field paths for `set` and `unset`
//!
//! Paths use the serialized (camelCase) field names, e.g.
//! `spec.kubernetesVersion` or `spec.subnets[0].cidr`.

use anyhow::{anyhow, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> anyhow::Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if key.is_empty() {
            bail!("invalid field path {path:?}");
        }
        segments.push(Segment::Key(key.to_string()));
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| anyhow!("unclosed index in field path {path:?}"))?;
            let index = stripped[..end]
                .parse()
                .map_err(|_| anyhow!("invalid index in field path {path:?}"))?;
            segments.push(Segment::Index(index));
            rest = &stripped[end + 1..];
        }
        if !rest.is_empty() {
            bail!("invalid field path {path:?}");
        }
    }
    match segments.first() {
        Some(Segment::Key(k)) if k == "spec" || k == "metadata" => {}
        _ => bail!("field path {path:?} must start with spec or metadata"),
    }
    if segments.get(1) == Some(&Segment::Key("name".into())) {
        bail!("metadata.name cannot be changed");
    }
    Ok(segments)
}

/// Split `path=value`
pub fn parse_assignment(assignment: &str) -> anyhow::Result<(&str, &str)> {
    assignment
        .split_once('=')
        .filter(|(path, _)| !path.is_empty())
        .ok_or_else(|| anyhow!("expected path=value, got {assignment:?}"))
}

/// Values to try for `raw`: its YAML reading first, then the literal string
fn candidates(raw: &str) -> Vec<Value> {
    let literal = Value::String(raw.to_string());
    match serde_yaml::from_str::<Value>(raw) {
        Ok(parsed) if parsed != literal && !parsed.is_null() => vec![parsed, literal],
        _ => vec![literal],
    }
}

fn set_value(root: &mut Value, segments: &[Segment], value: Value) -> anyhow::Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        bail!("empty field path");
    };
    let mut current = root;
    for (i, segment) in parents.iter().enumerate() {
        let next_is_index = matches!(segments[i + 1], Segment::Index(_));
        current = match segment {
            Segment::Key(key) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let object = current
                    .as_object_mut()
                    .ok_or_else(|| anyhow!("{key} is not inside an object"))?;
                object.entry(key.clone()).or_insert_with(|| {
                    if next_is_index {
                        Value::Array(Vec::new())
                    } else {
                        Value::Object(Map::new())
                    }
                })
            }
            Segment::Index(index) => current
                .as_array_mut()
                .and_then(|a| a.get_mut(*index))
                .ok_or_else(|| anyhow!("index {index} is out of range"))?,
        };
    }
    match last {
        Segment::Key(key) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            current
                .as_object_mut()
                .ok_or_else(|| anyhow!("{key} is not inside an object"))?
                .insert(key.clone(), value);
        }
        Segment::Index(index) => {
            let array = current
                .as_array_mut()
                .ok_or_else(|| anyhow!("index {index} applied to a non-list"))?;
            if *index < array.len() {
                array[*index] = value;
            } else if *index == array.len() {
                array.push(value);
            } else {
                bail!("index {index} is out of range");
            }
        }
    }
    Ok(())
}

fn remove_value(root: &mut Value, segments: &[Segment]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        let next = match segment {
            Segment::Key(key) => current.get_mut(key.as_str()),
            Segment::Index(index) => current.get_mut(*index),
        };
        match next {
            Some(next) => current = next,
            None => return,
        }
    }
    match last {
        Segment::Key(key) => {
            if let Some(object) = current.as_object_mut() {
                object.remove(key);
            }
        }
        Segment::Index(index) => {
            if let Some(array) = current.as_array_mut() {
                if *index < array.len() {
                    array.remove(*index);
                }
            }
        }
    }
}

/// Apply `path=value` assignments, or remove `path`s when `unset`, and read
/// the result back into `T`
pub fn apply<T: Serialize + DeserializeOwned>(
    object: &T,
    fields: &[String],
    unset: bool,
) -> anyhow::Result<T> {
    let mut root = serde_json::to_value(object)?;
    for field in fields {
        if unset {
            remove_value(&mut root, &parse_path(field)?);
            continue;
        }
        let (path, raw) = parse_assignment(field)?;
        let segments = parse_path(path)?;
        let mut last_error = None;
        let mut applied = false;
        for candidate in candidates(raw) {
            let mut trial = root.clone();
            set_value(&mut trial, &segments, candidate)?;
            match serde_json::from_value::<T>(trial.clone()) {
                Ok(_) => {
                    root = trial;
                    applied = true;
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        if !applied {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            bail!("cannot set {path}={raw}: {reason}");
        }
    }
    Ok(serde_json::from_value(root)?)
}
