//! In-memory store adapter.
//!
//! Reference implementation of the store contract: versioned JSON slots with
//! a sliding TTL and lease-based advisory locks. Used by the test suites and
//! for single-process deployments where durability is not needed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::ports::store::{
    apply_field_ops, FieldOp, LockToken, Store, StoreError, StoreResult, Versioned,
};

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    version: u64,
    ttl: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    fn touch(&mut self) {
        if let Some(ttl) = self.ttl {
            self.expires_at = Utc::now().checked_add_signed(
                chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            );
        }
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: LockToken,
    expires_at: DateTime<Utc>,
}

/// In-memory [`Store`] with full contract semantics.
#[derive(Default)]
pub struct InMemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load(&self, key: &str) -> StoreResult<Versioned> {
        let mut slots = self.slots.lock().await;
        match slots.get(key) {
            Some(slot) if !slot.expired() => Ok(Versioned {
                value: slot.value.clone(),
                version: slot.version,
            }),
            Some(_) => {
                slots.remove(key);
                Err(StoreError::NotFound(key.to_string()))
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn save(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<u64> {
        let mut slots = self.slots.lock().await;
        let version = match slots.get(key) {
            Some(slot) if !slot.expired() => slot.version + 1,
            _ => 1,
        };
        let mut slot = Slot {
            value,
            version,
            ttl,
            expires_at: None,
        };
        slot.touch();
        slots.insert(key.to_string(), slot);
        Ok(version)
    }

    async fn compare_and_save(
        &self,
        key: &str,
        expected_version: u64,
        value: Value,
    ) -> StoreResult<u64> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(key)
            .filter(|slot| !slot.expired())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if slot.version != expected_version {
            return Err(StoreError::Conflict(key.to_string()));
        }
        slot.value = value;
        slot.version += 1;
        slot.touch();
        Ok(slot.version)
    }

    async fn apply(&self, key: &str, ops: Vec<FieldOp>) -> StoreResult<Vec<Value>> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(key)
            .filter(|slot| !slot.expired())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let results = apply_field_ops(&mut slot.value, &ops)?;
        slot.version += 1;
        slot.touch();
        Ok(results)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut slots = self.slots.lock().await;
        Ok(slots.remove(key).is_some_and(|slot| !slot.expired()))
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> StoreResult<Option<LockToken>> {
        let mut locks = self.locks.lock().await;
        let now = Utc::now();
        if let Some(entry) = locks.get(key) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        let expires_at = now
            + chrono::Duration::from_std(lease).map_err(|e| StoreError::Invalid(e.to_string()))?;
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(Some(token))
    }

    async fn unlock(&self, key: &str, token: &LockToken) -> StoreResult<()> {
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|entry| &entry.token == token) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn live_keys(&self) -> StoreResult<Vec<String>> {
        let slots = self.slots.lock().await;
        Ok(slots
            .iter()
            .filter(|(_, slot)| !slot.expired())
            .map(|(key, _)| key.clone())
            .collect())
    }
}
