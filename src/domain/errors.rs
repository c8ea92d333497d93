//! Domain errors for the mageflow orchestration core.

use thiserror::Error;

use crate::domain::ports::executor::ExecutorError;
use crate::domain::ports::store::StoreError;

/// Domain-level errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A referenced signature ID does not exist. For one-shot callbacks this
    /// usually means the callback was already consumed.
    #[error("signature not found: {0}")]
    MissingSignature(String),

    /// A swarm batch item or its original signature vanished mid-lifecycle.
    #[error("swarm item missing: {0}")]
    MissingSwarmItem(String),

    /// `add_task` on a swarm whose `max_tasks_allowed` cap is reached.
    #[error("swarm has reached its task limit: {0}")]
    TooManyTasks(String),

    /// `add_task` on a canceled swarm.
    #[error("swarm is canceled: {0}")]
    SwarmCanceled(String),

    /// A chain needs at least two steps.
    #[error("chain requires at least two tasks, got {0}")]
    ChainTooShort(usize),

    /// A logical task name with no registration.
    #[error("task not registered: {0}")]
    UnknownTask(String),

    /// Reserved operations (`interrupt`, hard pause) refuse loudly instead of
    /// silently degrading to soft semantics.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// A signature key that does not parse as `<kind>:<uid>`.
    #[error("invalid signature id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type FlowResult<T> = Result<T, FlowError>;
