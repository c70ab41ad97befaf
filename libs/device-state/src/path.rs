//! Dot-separated key paths over JSON documents.
//!
//! `""` addresses the document root. Every other path is a sequence of
//! non-empty object keys joined by `.`.

use serde_json::{Map, Value};

use crate::error::StateError;

/// Split a path into its segments.
pub fn segments(path: &str) -> Result<Vec<&str>, StateError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StateError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Join a parent path and a key.
pub fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Whether `path` is `prefix` or lies beneath it (segment-wise).
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || path == prefix {
        return true;
    }
    path.strip_prefix(prefix)
        .map(|rest| rest.starts_with('.'))
        .unwrap_or(false)
}

/// Look up the value at `path`.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for key in segments(path).ok()? {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Set `value` at `path`, creating (or replacing non-object) intermediates.
pub fn assign(doc: &mut Value, path: &str, value: Value) -> Result<(), StateError> {
    let keys = segments(path)?;
    let Some((last, parents)) = keys.split_last() else {
        *doc = value;
        return Ok(());
    };

    let mut current = doc;
    for key in parents {
        current = ensure_object(current)
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert((*last).to_string(), value);
    Ok(())
}

/// Remove the value at `path`, returning it if it existed.
///
/// Removing the root resets the document to an empty object.
pub fn take(doc: &mut Value, path: &str) -> Result<Option<Value>, StateError> {
    let keys = segments(path)?;
    let Some((last, parents)) = keys.split_last() else {
        let old = std::mem::replace(doc, Value::Object(Map::new()));
        return Ok(Some(old));
    };

    let mut current = doc;
    for key in parents {
        match current.as_object_mut().and_then(|m| m.get_mut(*key)) {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(current.as_object_mut().and_then(|m| m.remove(*last)))
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
