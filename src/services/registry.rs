//! Task registry service.
//!
//! Maps logical task names to executor task definitions plus the retry
//! policy and input schema the invoker consults. Registrations are written
//! once at startup and are persistent (no TTL).

use std::sync::Arc;

use tracing::debug;

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::registration::TaskRegistration;
use crate::domain::ports::store::Store;

const REGISTRATION_KEY_PREFIX: &str = "task-def:";

#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<dyn Store>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(logical_name: &str) -> String {
        format!("{REGISTRATION_KEY_PREFIX}{logical_name}")
    }

    /// Insert (or replace) a registration. Persistent.
    pub async fn register(&self, registration: TaskRegistration) -> FlowResult<()> {
        debug!(task = %registration.logical_name, retries = ?registration.retries, "registering task");
        let key = Self::key(&registration.logical_name);
        let value = serde_json::to_value(&registration)?;
        self.store.save(&key, value, None).await?;
        Ok(())
    }

    /// Read-through lookup with NotFound flattened to `None`.
    pub async fn safe_get(&self, logical_name: &str) -> FlowResult<Option<TaskRegistration>> {
        let key = Self::key(logical_name);
        match self.store.try_load(&key).await? {
            Some(found) => Ok(Some(serde_json::from_value(found.value)?)),
            None => Ok(None),
        }
    }

    /// Lookup that fails with [`FlowError::UnknownTask`] on absence.
    pub async fn get(&self, logical_name: &str) -> FlowResult<TaskRegistration> {
        self.safe_get(logical_name)
            .await?
            .ok_or_else(|| FlowError::UnknownTask(logical_name.to_string()))
    }
}
