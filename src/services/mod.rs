//! Services: the flow engine, the invoker, the task registry and the
//! trigger builder.

pub mod engine;
pub mod invoker;
pub mod registry;
pub mod triggers;

pub use engine::{
    CallbackOptions, ChainOptions, FlowEngine, SignOptions, SwarmOptions, TaskSpec,
    MAGEFLOW_TASK_PREFIX, ON_CHAIN_END, ON_CHAIN_ERROR, ON_SWARM_DONE, ON_SWARM_ERROR,
    ON_SWARM_START,
};
pub use invoker::wrap_task;
pub use registry::TaskRegistry;
pub use triggers::TriggerBuilder;
