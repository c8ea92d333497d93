//! JSON payload helpers shared by the trigger builder and the engines.

use serde_json::{Map, Value};

/// Top-level shape of every payload and kwargs container.
pub type JsonMap = Map<String, Value>;

/// Recursively merge `updates` over `base`.
///
/// Right-biased on leaves, recursive on maps. Lists are replaced, never
/// concatenated — callbacks depend on this to overlay upstream results atop
/// persisted kwargs.
pub fn deep_merge(base: Value, updates: Value) -> Value {
    match (base, updates) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            let mut merged = base_map;
            for (key, value) in update_map {
                let slot = merged.remove(&key);
                let merged_value = match slot {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, merged_value);
            }
            Value::Object(merged)
        }
        (_, updates) => updates,
    }
}

/// Map-level convenience over [`deep_merge`].
pub fn merge_maps(base: JsonMap, updates: JsonMap) -> JsonMap {
    match deep_merge(Value::Object(base), Value::Object(updates)) {
        Value::Object(map) => map,
        _ => unreachable!("merging two objects yields an object"),
    }
}

/// Coerce an arbitrary payload into a map, wrapping scalars under `results`
/// so they survive a merge with kwargs.
pub fn as_map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        Value::Null => JsonMap::new(),
        other => {
            let mut map = JsonMap::new();
            map.insert("results".to_string(), other);
            map
        }
    }
}

/// An empty object payload, the default trigger message.
pub fn empty() -> Value {
    Value::Object(JsonMap::new())
}
