//! Mageflow - durable task orchestration over an external executor and a
//! key-value store.
//!
//! Application code composes durable task invocations ("signatures") into
//! higher-order control flow:
//! - chains: sequential pipelines with per-step success/error fan-out
//! - swarms: bounded-concurrency parallel work with failure thresholds and
//!   dynamic membership
//! - roots: wrapping tasks whose children form an implicit swarm
//!
//! The executor (work queue, retries, lifecycle hooks) and the store (atomic
//! key-value records with advisory locks) are external collaborators reached
//! through ports; in-memory and sqlite adapters ship with the crate.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{FlowError, FlowResult};
pub use domain::models::{
    BatchItemSignature, ChainSignature, InputSchema, PauseKind, RootSignature, Signature,
    SignatureId, SignatureKind, SignatureRef, SignatureStatus, SwarmConfig, SwarmSignature,
    TaskRegistration, TaskSignature,
};
pub use domain::ports::{
    Executor, ExecutorError, Store, StoreError, TaskContext, TaskDefinition, TaskError,
    TaskHandler, TaskResult, Trigger, TriggerHandle, TriggerScope,
};
pub use infrastructure::config::FlowConfig;
pub use services::{ChainOptions, FlowEngine, SignOptions, SwarmOptions, TaskSpec};
