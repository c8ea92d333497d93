//! Trigger construction — the workflow adapter.
//!
//! Serializes a signature into an executor trigger: the effective payload is
//! the signature's kwargs deep-merged over the incoming message (optionally
//! nested under the schema's return-value field first), and the signature's
//! identifiers ride along as out-of-band metadata under `task_data`.

use serde_json::Value;

use crate::domain::models::payload::{deep_merge, JsonMap};
use crate::domain::ports::executor::{Trigger, TASK_DATA_KEY};

#[derive(Debug, Clone)]
pub struct TriggerBuilder {
    task_name: String,
    kwargs: JsonMap,
    return_value_field: Option<String>,
    task_ctx: JsonMap,
}

impl TriggerBuilder {
    pub fn new(executor_task_name: impl Into<String>) -> Self {
        Self {
            task_name: executor_task_name.into(),
            kwargs: JsonMap::new(),
            return_value_field: None,
            task_ctx: JsonMap::new(),
        }
    }

    /// Kwargs merged over the message; later calls deep-merge over earlier.
    pub fn kwargs(mut self, kwargs: JsonMap) -> Self {
        self.kwargs = crate::domain::models::payload::merge_maps(self.kwargs, kwargs);
        self
    }

    /// Nest the incoming message under this field before merging kwargs.
    /// `None` merges the message at the top level.
    pub fn return_value_field(mut self, field: Option<String>) -> Self {
        self.return_value_field = field;
        self
    }

    /// Contextual identifiers piggybacked as `task_data` metadata.
    pub fn task_ctx(mut self, ctx: JsonMap) -> Self {
        self.task_ctx = ctx;
        self
    }

    pub fn build(self, msg: Value) -> Trigger {
        let carried = match &self.return_value_field {
            Some(field) => {
                let mut nested = JsonMap::new();
                nested.insert(field.clone(), msg);
                Value::Object(nested)
            }
            None => msg,
        };
        let payload = deep_merge(carried, Value::Object(self.kwargs));

        let mut additional_metadata = JsonMap::new();
        if !self.task_ctx.is_empty() {
            additional_metadata.insert(TASK_DATA_KEY.to_string(), Value::Object(self.task_ctx));
        }

        Trigger {
            task_name: self.task_name,
            payload,
            additional_metadata,
        }
    }
}
