//! The flow engine — the central coordinator of the orchestration core.
//!
//! The engine is a thin coordinator over well-defined subsystems, each in its
//! own file as an impl block on [`FlowEngine`]:
//!
//! - **signature_ops**: polymorphic load/save/remove, trigger dispatch
//! - **callbacks**: success/error callback resolution and fan-out
//! - **control**: suspend/resume/pause/change-status propagation
//! - **chain_ops**: linear composition and its end/error task bodies
//! - **swarm_ops**: bounded-concurrency fan-out and its task bodies
//! - **root_ops**: the implicit root swarm hooks

mod callbacks;
mod chain_ops;
mod control;
mod root_ops;
mod signature_ops;
mod swarm_ops;

pub use callbacks::CallbackOptions;
pub use chain_ops::ChainOptions;
pub use swarm_ops::SwarmOptions;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::payload::JsonMap;
use crate::domain::models::registration::{InputSchema, TaskRegistration};
use crate::domain::models::root::RootSignature;
use crate::domain::models::signature::{Signature, SignatureId, SignatureRef, TaskSignature};
use crate::domain::models::swarm::SwarmConfig;
use crate::domain::ports::executor::{
    Executor, TaskContext, TaskDefinition, TaskHandler, TASK_DATA_KEY,
};
use crate::domain::ports::store::{LockLease, Store, StoreError};
use crate::infrastructure::config::FlowConfig;
use crate::services::invoker::wrap_task;
use crate::services::registry::TaskRegistry;

/// Reserved prefix of the synthetic task names the engines install.
pub const MAGEFLOW_TASK_PREFIX: &str = "mageflow_";

pub const ON_CHAIN_END: &str = "mageflow_on_chain_end";
pub const ON_CHAIN_ERROR: &str = "mageflow_on_chain_error";
pub const ON_SWARM_START: &str = "mageflow_on_swarm_start";
pub const ON_SWARM_DONE: &str = "mageflow_on_swarm_done";
pub const ON_SWARM_ERROR: &str = "mageflow_on_swarm_error";

/// Identifier keys carried through executor metadata.
pub const TASK_ID_PARAM: &str = "task_id";
pub const CHAIN_TASK_ID_PARAM: &str = "chain_task_id";
pub const SWARM_TASK_ID_PARAM: &str = "swarm_task_id";
pub const SWARM_ITEM_ID_PARAM: &str = "swarm_item_id";

/// Retry budget and timeout of the synthetic tasks.
const INTERNAL_TASK_RETRIES: u32 = 3;
const INTERNAL_TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Options for creating a signature.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    pub kwargs: JsonMap,
    pub success_callbacks: Vec<SignatureId>,
    pub error_callbacks: Vec<SignatureId>,
    pub task_identifiers: JsonMap,
    /// Overrides the schema the registry would resolve.
    pub input_schema: Option<InputSchema>,
}

/// Registration-time description of a user task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub retries: Option<u32>,
    pub execution_timeout: Option<Duration>,
    pub input_schema: Option<InputSchema>,
    pub is_root: bool,
    pub root_config: Option<SwarmConfig>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retries: None,
            execution_timeout: None,
            input_schema: None,
            is_root: false,
            root_config: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn as_root(mut self, config: Option<SwarmConfig>) -> Self {
        self.is_root = true;
        self.root_config = config;
        self
    }
}

/// The orchestration engine. Cheap to clone through [`Arc`]; task handlers
/// registered through [`FlowEngine::register_task`] capture it.
pub struct FlowEngine {
    pub(super) store: Arc<dyn Store>,
    pub(super) executor: Arc<dyn Executor>,
    pub(super) registry: TaskRegistry,
    pub(super) config: FlowConfig,
}

impl FlowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn Executor>,
        config: FlowConfig,
    ) -> Arc<Self> {
        let registry = TaskRegistry::new(Arc::clone(&store));
        Arc::new(Self {
            store,
            executor,
            registry,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Acquire the advisory lock for a key, retrying contention with bounded
    /// exponential backoff. Surfaces a conflict once the budget is exhausted.
    pub(crate) async fn lock_key(&self, key: &str) -> FlowResult<LockLease> {
        let settings = &self.config.lock;
        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(settings.retry_initial_ms))
            .with_max_interval(Duration::from_millis(settings.retry_max_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(settings.retry_max_elapsed_ms)))
            .build();
        let lease = settings.lease();

        let token = backoff::future::retry(policy, || async {
            match self.store.try_lock(key, lease).await {
                Ok(Some(token)) => Ok(token),
                Ok(None) => Err(backoff::Error::transient(StoreError::Conflict(
                    key.to_string(),
                ))),
                Err(e @ StoreError::Transient(_)) => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await?;

        Ok(LockLease::new(
            Arc::clone(&self.store),
            key.to_string(),
            token,
        ))
    }

    /// Construct and persist a new signature for a logical task.
    ///
    /// Resolves the input schema from the registry when the options carry
    /// none; tasks registered as root produce a [`RootSignature`] wired with
    /// the registered root swarm config.
    pub async fn sign(&self, task_name: &str, options: SignOptions) -> FlowResult<Signature> {
        let registration = self.registry.safe_get(task_name).await?;
        let input_schema = options
            .input_schema
            .or_else(|| registration.as_ref().and_then(|r| r.input_schema.clone()));

        let mut signature = match registration.as_ref() {
            Some(reg) if reg.is_root => {
                let config = reg.root_config.clone().unwrap_or_default();
                Signature::Root(RootSignature::new(task_name, config))
            }
            _ => Signature::Task(TaskSignature::new(task_name)),
        };

        let core = signature.core_mut();
        core.kwargs = options.kwargs;
        core.success_callbacks = options.success_callbacks;
        core.error_callbacks = options.error_callbacks;
        core.task_identifiers = options.task_identifiers;
        core.input_schema = input_schema;

        self.save_signature(&signature).await?;
        debug!(signature = %signature.id(), task = task_name, "signed task");
        Ok(signature)
    }

    /// Resolve a reference to a saved signature: existing IDs are loaded,
    /// task names get a fresh signature.
    pub async fn resolve(&self, reference: SignatureRef) -> FlowResult<Signature> {
        match reference {
            SignatureRef::Id(id) => self.load_signature(&id).await,
            SignatureRef::Task(name) => self.sign(&name, SignOptions::default()).await,
        }
    }

    /// Persist a copy of a signature under a fresh ID.
    pub async fn duplicate(&self, signature: &Signature) -> FlowResult<Signature> {
        let copy = signature.duplicated();
        self.save_signature(&copy).await?;
        Ok(copy)
    }

    pub async fn duplicate_many(
        &self,
        signature: &Signature,
        count: usize,
    ) -> FlowResult<Vec<Signature>> {
        let mut copies = Vec::with_capacity(count);
        for _ in 0..count {
            copies.push(self.duplicate(signature).await?);
        }
        Ok(copies)
    }

    /// Register a user task: records it in the registry and hands the
    /// invoker-wrapped handler to the executor.
    pub async fn register_task(
        self: &Arc<Self>,
        spec: TaskSpec,
        handler: TaskHandler,
    ) -> FlowResult<()> {
        let mut registration = TaskRegistration::new(spec.name.clone());
        registration.input_schema = spec.input_schema.clone();
        registration.retries = spec.retries;
        registration.is_root = spec.is_root;
        registration.root_config = spec.root_config.clone();
        self.registry.register(registration).await?;

        let wrapped = wrap_task(Arc::clone(self), spec.name.clone(), handler);
        self.executor
            .register(TaskDefinition {
                name: spec.name,
                retries: spec.retries.unwrap_or(1),
                execution_timeout: spec.execution_timeout,
                handler: wrapped,
            })
            .await?;
        Ok(())
    }

    /// Install the synthetic chain/swarm coordination tasks. Must run once at
    /// worker startup, before any chain or swarm is created.
    pub async fn install_internal_tasks(self: &Arc<Self>) -> FlowResult<()> {
        self.install_internal(
            ON_CHAIN_END,
            Some(InputSchema::with_return_field("ChainResults", "chain_results")),
            |engine, payload, ctx| Box::pin(async move { engine.on_chain_end(payload, ctx).await }),
        )
        .await?;
        self.install_internal(ON_CHAIN_ERROR, None, |engine, payload, ctx| {
            Box::pin(async move { engine.on_chain_error(payload, ctx).await })
        })
        .await?;
        self.install_internal(ON_SWARM_START, None, |engine, payload, ctx| {
            Box::pin(async move { engine.on_swarm_start(payload, ctx).await })
        })
        .await?;
        self.install_internal(
            ON_SWARM_DONE,
            Some(InputSchema::with_return_field("SwarmResults", "results")),
            |engine, payload, ctx| {
                Box::pin(async move { engine.on_swarm_item_done(payload, ctx).await })
            },
        )
        .await?;
        self.install_internal(ON_SWARM_ERROR, None, |engine, payload, ctx| {
            Box::pin(async move { engine.on_swarm_item_failed(payload, ctx).await })
        })
        .await?;
        Ok(())
    }

    async fn install_internal(
        self: &Arc<Self>,
        name: &str,
        input_schema: Option<InputSchema>,
        body: fn(
            Arc<FlowEngine>,
            Value,
            TaskContext,
        ) -> futures::future::BoxFuture<'static, crate::domain::ports::executor::TaskResult>,
    ) -> FlowResult<()> {
        let mut registration = TaskRegistration::new(name);
        registration.input_schema = input_schema;
        registration.retries = Some(INTERNAL_TASK_RETRIES);
        self.registry.register(registration).await?;

        let engine = Arc::clone(self);
        let handler: TaskHandler =
            Arc::new(move |payload, ctx| body(Arc::clone(&engine), payload, ctx));
        self.executor
            .register(TaskDefinition {
                name: name.to_string(),
                retries: INTERNAL_TASK_RETRIES,
                execution_timeout: Some(INTERNAL_TASK_TIMEOUT),
                handler,
            })
            .await?;
        Ok(())
    }
}

/// Pull the mageflow identifier map out of an invocation context.
pub(crate) fn task_data(ctx: &TaskContext) -> JsonMap {
    ctx.additional_metadata
        .get(TASK_DATA_KEY)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// A required identifier from the `task_data` map.
pub(crate) fn required_id(data: &JsonMap, key: &str) -> FlowResult<SignatureId> {
    data.get(key)
        .and_then(Value::as_str)
        .map(SignatureId::from)
        .ok_or_else(|| FlowError::MissingSignature(format!("{key} missing from task metadata")))
}
