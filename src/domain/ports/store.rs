//! Key-value store port.
//!
//! Mageflow keeps every durable record in an external store reached through
//! this trait: atomic load/save by key, compare-and-set on a per-key version,
//! atomic sub-field mutation pipelines, and advisory lease locks. Signature
//! records carry a sliding TTL refreshed on every mutation; registry records
//! are persistent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Number, Value};
use thiserror::Error;

/// Store error taxonomy. `NotFound` is distinguished from transient faults so
/// callers can treat absence as a signal (one-shot callbacks).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    /// Lost update or contended lock; retriable.
    #[error("conflict on key: {0}")]
    Conflict(String),

    #[error("transient store failure: {0}")]
    Transient(String),

    /// Malformed sub-field operation (wrong container type, bad path).
    #[error("invalid store operation: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A loaded record with its optimistic-locking version.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
}

/// Opaque fencing token for an advisory lease lock.
pub type LockToken = String;

/// One atomic mutation of a sub-field, addressed by a dotted path.
///
/// These are the typed-container mutators of the store contract: callers
/// never read-modify-write whole payloads outside a pipeline or a lock.
#[derive(Debug, Clone)]
pub enum FieldOp {
    /// Replace the value at `path`.
    Set { path: String, value: Value },
    /// Append to the list at `path`, creating it if absent.
    ListAppend { path: String, value: Value },
    /// Extend the list at `path`.
    ListExtend { path: String, values: Vec<Value> },
    /// Pop the first element; yields the popped value or `Null`.
    ListPopFront { path: String },
    /// Empty the list at `path`.
    ListClear { path: String },
    /// Add `delta` to the integer at `path`; yields the new value.
    CounterAdd { path: String, delta: i64 },
    /// Shallow-merge entries into the map at `path`.
    MapMerge { path: String, entries: serde_json::Map<String, Value> },
}

/// Apply a pipeline of [`FieldOp`]s to a JSON document in place, returning
/// one result per op. Shared by store adapters so path semantics never drift.
pub fn apply_field_ops(doc: &mut Value, ops: &[FieldOp]) -> StoreResult<Vec<Value>> {
    ops.iter().map(|op| apply_one(doc, op)).collect()
}

fn apply_one(doc: &mut Value, op: &FieldOp) -> StoreResult<Value> {
    match op {
        FieldOp::Set { path, value } => {
            *slot_at(doc, path)? = value.clone();
            Ok(Value::Null)
        }
        FieldOp::ListAppend { path, value } => {
            list_at(doc, path)?.push(value.clone());
            Ok(Value::Null)
        }
        FieldOp::ListExtend { path, values } => {
            list_at(doc, path)?.extend(values.iter().cloned());
            Ok(Value::Null)
        }
        FieldOp::ListPopFront { path } => {
            let list = list_at(doc, path)?;
            if list.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(list.remove(0))
            }
        }
        FieldOp::ListClear { path } => {
            list_at(doc, path)?.clear();
            Ok(Value::Null)
        }
        FieldOp::CounterAdd { path, delta } => {
            let slot = slot_at(doc, path)?;
            let current = match slot {
                Value::Null => 0,
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| StoreError::Invalid(format!("{path} is not an integer")))?,
                other => {
                    return Err(StoreError::Invalid(format!(
                        "{path} holds {other}, expected integer"
                    )))
                }
            };
            let updated = current + delta;
            *slot = Value::Number(Number::from(updated));
            Ok(Value::Number(Number::from(updated)))
        }
        FieldOp::MapMerge { path, entries } => {
            let slot = slot_at(doc, path)?;
            if slot.is_null() {
                *slot = Value::Object(serde_json::Map::new());
            }
            let map = slot
                .as_object_mut()
                .ok_or_else(|| StoreError::Invalid(format!("{path} is not a map")))?;
            for (key, value) in entries {
                map.insert(key.clone(), value.clone());
            }
            Ok(Value::Null)
        }
    }
}

fn list_at<'doc>(doc: &'doc mut Value, path: &str) -> StoreResult<&'doc mut Vec<Value>> {
    let slot = slot_at(doc, path)?;
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| StoreError::Invalid(format!("{path} is not a list")))
}

/// Navigate to the slot a dotted path addresses, creating intermediate maps.
fn slot_at<'doc>(doc: &'doc mut Value, path: &str) -> StoreResult<&'doc mut Value> {
    let mut current = doc;
    for segment in path.split('.') {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current
            .as_object_mut()
            .ok_or_else(|| StoreError::Invalid(format!("{path}: not a map at {segment}")))?;
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(current)
}

/// Key-value store with optimistic locking and advisory lease locks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a record. Fails with `NotFound` for absent or expired keys.
    async fn load(&self, key: &str) -> StoreResult<Versioned>;

    /// Unconditional save. A `ttl` of `None` makes the record persistent;
    /// `Some` starts a sliding TTL refreshed on every later mutation.
    /// Returns the new version.
    async fn save(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<u64>;

    /// Save iff the record's version still equals `expected_version`.
    /// Fails with `Conflict` on a lost update.
    async fn compare_and_save(
        &self,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> StoreResult<u64>;

    /// Atomically apply a pipeline of sub-field mutations, refreshing the
    /// record's sliding TTL. Returns one result per op.
    async fn apply(&self, key: &str, ops: Vec<FieldOp>) -> StoreResult<Vec<Value>>;

    /// Delete a record; returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Try to acquire the advisory lock for `key`. Returns `None` when the
    /// lock is held elsewhere. The lease expires on its own so crashed
    /// holders cannot wedge a key forever.
    async fn try_lock(&self, key: &str, lease: Duration) -> StoreResult<Option<LockToken>>;

    /// Release a held lock. A stale token is ignored.
    async fn unlock(&self, key: &str, token: &LockToken) -> StoreResult<()>;

    /// All unexpired record keys. Diagnostics and cleanup verification only.
    async fn live_keys(&self) -> StoreResult<Vec<String>>;

    /// Load with `NotFound` flattened to `None`.
    async fn try_load(&self, key: &str) -> StoreResult<Option<Versioned>> {
        match self.load(key).await {
            Ok(found) => Ok(Some(found)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// RAII advisory lock lease.
///
/// Explicit [`release`](Self::release) is preferred; dropping an unreleased
/// lease spawns a best-effort unlock, and the lease TTL bounds the damage if
/// that never lands.
pub struct LockLease {
    store: Arc<dyn Store>,
    key: String,
    token: Option<LockToken>,
}

impl LockLease {
    pub fn new(store: Arc<dyn Store>, key: String, token: LockToken) -> Self {
        Self {
            store,
            key,
            token: Some(token),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> StoreResult<()> {
        if let Some(token) = self.token.take() {
            self.store.unlock(&self.key, &token).await?;
        }
        Ok(())
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        // Outside a runtime the lease simply expires.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        handle.spawn(async move {
            if let Err(e) = store.unlock(&key, &token).await {
                tracing::warn!(key = %key, error = %e, "failed to release dropped lock lease");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pipeline_ops_apply_in_order() {
        let mut doc = json!({"tasks": [], "count": 0});
        let results = apply_field_ops(
            &mut doc,
            &[
                FieldOp::ListAppend { path: "tasks".into(), value: json!("a") },
                FieldOp::ListExtend { path: "tasks".into(), values: vec![json!("b"), json!("c")] },
                FieldOp::CounterAdd { path: "count".into(), delta: 2 },
                FieldOp::ListPopFront { path: "tasks".into() },
            ],
        )
        .unwrap();
        assert_eq!(results[2], json!(2));
        assert_eq!(results[3], json!("a"));
        assert_eq!(doc, json!({"tasks": ["b", "c"], "count": 2}));
    }

    #[test]
    fn pop_on_empty_list_yields_null() {
        let mut doc = json!({"tasks": []});
        let results =
            apply_field_ops(&mut doc, &[FieldOp::ListPopFront { path: "tasks".into() }]).unwrap();
        assert_eq!(results[0], Value::Null);
    }

    #[test]
    fn dotted_paths_reach_nested_fields() {
        let mut doc = json!({"task_status": {"status": "pending"}});
        apply_field_ops(
            &mut doc,
            &[FieldOp::MapMerge {
                path: "task_status".into(),
                entries: json!({"status": "active", "last_status": "pending"})
                    .as_object()
                    .unwrap()
                    .clone(),
            }],
        )
        .unwrap();
        assert_eq!(doc["task_status"]["status"], "active");
        assert_eq!(doc["task_status"]["last_status"], "pending");
    }

    #[test]
    fn type_mismatch_is_an_invalid_op() {
        let mut doc = json!({"count": "not-a-number"});
        let err = apply_field_ops(
            &mut doc,
            &[FieldOp::CounterAdd { path: "count".into(), delta: 1 }],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }
}
