//! Durable executor port.
//!
//! The executor is an external work-queue/runner guaranteeing at-least-once
//! delivery: tasks are registered once at startup, triggered without waiting,
//! and retried on failure per the registered retry budget. Mageflow only
//! consumes this contract; the invoker lifecycle runs inside the registered
//! handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::domain::models::payload::JsonMap;
use crate::domain::models::signature::SignatureId;

/// Metadata key mageflow piggybacks signature identifiers under.
/// Downstream metadata copies must strip this key before forwarding.
pub const TASK_DATA_KEY: &str = "task_data";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no task registered under name: {0}")]
    UnknownTask(String),

    #[error("executor failure: {0}")]
    Internal(String),
}

/// Error returned by a task body.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Ordinary failure; subject to the executor's retry policy.
    #[error("task failed: {0}")]
    Failed(String),

    /// Marker instructing the executor to never retry this attempt.
    #[error("task failed (non-retriable): {0}")]
    NonRetriable(String),

    /// The attempt requested its own cancellation; terminal and quiet.
    #[error("task canceled")]
    Canceled,
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn non_retriable(msg: impl Into<String>) -> Self {
        Self::NonRetriable(msg.into())
    }

    pub fn is_non_retriable(&self) -> bool {
        matches!(self, Self::NonRetriable(_) | Self::Canceled)
    }
}

impl From<crate::domain::errors::FlowError> for TaskError {
    fn from(err: crate::domain::errors::FlowError) -> Self {
        Self::Failed(err.to_string())
    }
}

pub type TaskResult = Result<Value, TaskError>;

/// A registered task body: `(payload, context) -> result`.
pub type TaskHandler =
    Arc<dyn Fn(Value, TaskContext) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Executor-side task registration.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    /// Maximum attempts; `0` and `1` both mean a single attempt.
    pub retries: u32,
    pub execution_timeout: Option<Duration>,
    pub handler: TaskHandler,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("retries", &self.retries)
            .field("execution_timeout", &self.execution_timeout)
            .finish_non_exhaustive()
    }
}

/// A non-blocking submission to the executor.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub task_name: String,
    pub payload: Value,
    /// Out-of-band metadata delivered to the invocation context verbatim.
    pub additional_metadata: JsonMap,
}

/// Handle returned by a trigger; no completion wait is offered.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    pub execution_id: String,
}

/// The submission sink a root task installs for the duration of its body:
/// triggers performed under a scope with a root swarm are funneled into that
/// swarm instead of going straight to the executor.
#[derive(Debug, Clone, Default)]
pub struct TriggerScope {
    pub root_swarm: Option<SignatureId>,
}

impl TriggerScope {
    pub fn for_root_swarm(swarm_id: SignatureId) -> Self {
        Self {
            root_swarm: Some(swarm_id),
        }
    }
}

/// Per-invocation context handed to task bodies.
#[derive(Clone)]
pub struct TaskContext {
    pub execution_id: String,
    /// 1-based attempt counter.
    pub attempt_number: u32,
    pub additional_metadata: JsonMap,
    pub scope: TriggerScope,
    cancel_flag: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(execution_id: String, attempt_number: u32, additional_metadata: JsonMap) -> Self {
        Self {
            execution_id,
            attempt_number,
            additional_metadata,
            scope: TriggerScope::default(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the executor to abandon this attempt without counting it failed.
    pub fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    pub fn with_scope(mut self, scope: TriggerScope) -> Self {
        self.scope = scope;
        self
    }

    /// Share a cancel flag owned by the executor, so `cancel(execution_id)`
    /// reaches contexts already handed out.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Metadata copy with the mageflow bookkeeping key stripped, safe to
    /// forward to downstream invocations.
    pub fn forwardable_metadata(&self) -> JsonMap {
        let mut metadata = self.additional_metadata.clone();
        metadata.remove(TASK_DATA_KEY);
        metadata
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("execution_id", &self.execution_id)
            .field("attempt_number", &self.attempt_number)
            .finish_non_exhaustive()
    }
}

/// The durable executor contract mageflow consumes.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Register (or replace) a task definition.
    async fn register(&self, definition: TaskDefinition) -> Result<(), ExecutorError>;

    /// Submit a task for execution without waiting for completion.
    async fn trigger(&self, trigger: Trigger) -> Result<TriggerHandle, ExecutorError>;

    /// Request cancellation of a running attempt. Best effort.
    async fn cancel(&self, execution_id: &str) -> Result<(), ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forwardable_metadata_strips_the_bookkeeping_key() {
        let mut metadata = JsonMap::new();
        metadata.insert(TASK_DATA_KEY.to_string(), json!({"task_id": "task:x"}));
        metadata.insert("trace".to_string(), json!("keep-me"));

        let ctx = TaskContext::new("exec-1".to_string(), 1, metadata);
        let forwarded = ctx.forwardable_metadata();
        assert!(forwarded.get(TASK_DATA_KEY).is_none());
        assert_eq!(forwarded.get("trace"), Some(&json!("keep-me")));
        // The original context keeps its identifiers.
        assert!(ctx.additional_metadata.contains_key(TASK_DATA_KEY));
    }

    #[test]
    fn shared_cancel_flags_propagate() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new("exec-1".to_string(), 1, JsonMap::new())
            .with_cancel_flag(Arc::clone(&flag));
        assert!(!ctx.cancel_requested());
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.cancel_requested());

        let clone = ctx.clone();
        assert!(clone.cancel_requested());
    }

    #[test]
    fn canceled_errors_are_non_retriable() {
        assert!(TaskError::Canceled.is_non_retriable());
        assert!(TaskError::non_retriable("x").is_non_retriable());
        assert!(!TaskError::failed("x").is_non_retriable());
    }
}
