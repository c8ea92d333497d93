//! Task registry records.
//!
//! A [`TaskRegistration`] maps a logical task name to the executor-side task
//! definition plus the retry policy and input schema the invoker consults.
//! Registrations are persistent (no TTL) and written once at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::swarm::SwarmConfig;
use crate::domain::ports::executor::TaskError;

/// Schema annotation for a task's input payload.
///
/// The only property the core cares about is which field carries the upstream
/// return value: when a signature with a schema is triggered as a success
/// callback, the incoming message is nested under that field before the
/// signature's own kwargs are merged on top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    /// Schema name, for diagnostics only.
    #[serde(default)]
    pub name: String,
    /// Field designated to receive the upstream result. `None` falls back to
    /// `results`.
    #[serde(default)]
    pub return_value_field: Option<String>,
}

impl InputSchema {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            return_value_field: None,
        }
    }

    pub fn with_return_field(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            return_value_field: Some(field.into()),
        }
    }

    /// The effective return-value field name.
    pub fn return_field(&self) -> &str {
        self.return_value_field.as_deref().unwrap_or("results")
    }
}

/// Persistent mapping of a logical task name to its executor task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRegistration {
    /// Logical name user code refers to (registry key).
    pub logical_name: String,
    /// Name the executor knows the task by.
    pub executor_task_name: String,
    /// Input schema, if the task declares one.
    #[serde(default)]
    pub input_schema: Option<InputSchema>,
    /// Maximum attempts the executor should make. `None` disables retrying.
    #[serde(default)]
    pub retries: Option<u32>,
    /// Root tasks wrap their children in an implicit swarm.
    #[serde(default)]
    pub is_root: bool,
    /// Swarm configuration for the implicit root swarm.
    #[serde(default)]
    pub root_config: Option<SwarmConfig>,
    pub created_at: DateTime<Utc>,
}

impl TaskRegistration {
    pub fn new(logical_name: impl Into<String>) -> Self {
        let logical_name = logical_name.into();
        Self {
            executor_task_name: logical_name.clone(),
            logical_name,
            input_schema: None,
            retries: None,
            is_root: false,
            root_config: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the executor should be allowed another attempt.
    ///
    /// True iff retries are configured, the 1-based `attempt` has not reached
    /// them, and the error is not tagged non-retriable.
    pub fn should_retry(&self, attempt: u32, error: &TaskError) -> bool {
        let Some(retries) = self.retries else {
            return false;
        };
        attempt < retries && !error.is_non_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retries_configured_means_no_retry() {
        let reg = TaskRegistration::new("t");
        assert!(!reg.should_retry(1, &TaskError::failed("boom")));
    }

    #[test]
    fn retries_stop_at_the_configured_attempt() {
        let mut reg = TaskRegistration::new("t");
        reg.retries = Some(3);
        assert!(reg.should_retry(1, &TaskError::failed("boom")));
        assert!(reg.should_retry(2, &TaskError::failed("boom")));
        assert!(!reg.should_retry(3, &TaskError::failed("boom")));
    }

    #[test]
    fn non_retriable_errors_never_retry() {
        let mut reg = TaskRegistration::new("t");
        reg.retries = Some(3);
        assert!(!reg.should_retry(1, &TaskError::non_retriable("fatal")));
    }

    #[test]
    fn return_field_defaults_to_results() {
        assert_eq!(InputSchema::named("m").return_field(), "results");
        assert_eq!(
            InputSchema::with_return_field("m", "chain_results").return_field(),
            "chain_results"
        );
    }
}
