//! Ports (interfaces) to the external collaborators: the key-value store and
//! the durable executor.

pub mod executor;
pub mod store;

pub use executor::{
    Executor, ExecutorError, TaskContext, TaskDefinition, TaskError, TaskHandler, TaskResult,
    Trigger, TriggerHandle, TriggerScope, TASK_DATA_KEY,
};
pub use store::{
    apply_field_ops, FieldOp, LockLease, LockToken, Store, StoreError, StoreResult, Versioned,
};
