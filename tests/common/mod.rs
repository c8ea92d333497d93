//! Shared test harness: an engine over the in-memory adapters plus probe
//! tasks that record their invocations.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use mageflow::adapters::memory::{InMemoryExecutor, InMemoryStore};
use mageflow::domain::ports::executor::{Executor, TaskError, TaskHandler};
use mageflow::domain::ports::store::Store;
use mageflow::infrastructure::config::LockSettings;
use mageflow::{FlowConfig, FlowEngine, TaskSpec};

const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// One recorded probe invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task: String,
    pub payload: Value,
}

#[derive(Default)]
pub struct Probes {
    invocations: Mutex<Vec<Invocation>>,
}

impl Probes {
    pub async fn record(&self, task: &str, payload: &Value) {
        self.invocations.lock().await.push(Invocation {
            task: task.to_string(),
            payload: payload.clone(),
        });
    }

    pub async fn runs_of(&self, task: &str) -> Vec<Invocation> {
        self.invocations
            .lock()
            .await
            .iter()
            .filter(|inv| inv.task == task)
            .cloned()
            .collect()
    }

    pub async fn count(&self, task: &str) -> usize {
        self.runs_of(task).await.len()
    }

    /// Zero-based position of a task's first invocation in the global order.
    pub async fn first_position(&self, task: &str) -> Option<usize> {
        self.invocations
            .lock()
            .await
            .iter()
            .position(|inv| inv.task == task)
    }
}

pub struct Harness {
    pub engine: Arc<FlowEngine>,
    pub executor: Arc<InMemoryExecutor>,
    pub store: Arc<InMemoryStore>,
    pub probes: Arc<Probes>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let executor = Arc::new(InMemoryExecutor::new());
        let config = FlowConfig {
            cancel_grace_ms: 10,
            lock: LockSettings {
                retry_initial_ms: 1,
                retry_max_ms: 20,
                retry_max_elapsed_ms: 5_000,
                ..LockSettings::default()
            },
            ..FlowConfig::default()
        };

        let engine = FlowEngine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&executor) as Arc<dyn Executor>,
            config,
        );
        engine
            .install_internal_tasks()
            .await
            .expect("internal tasks install");

        Self {
            engine,
            executor,
            store,
            probes: Arc::new(Probes::default()),
        }
    }

    /// Register a probe task that records its payload and returns `result`.
    pub async fn register_ok(&self, name: &str, result: Value) {
        let handler = self.recording_handler(name, move |_payload| Ok(result.clone()));
        self.engine
            .register_task(TaskSpec::new(name), handler)
            .await
            .expect("register task");
    }

    /// Register a probe task computing its result from the payload.
    pub async fn register_fn<F>(&self, spec: TaskSpec, body: F)
    where
        F: Fn(Value) -> Result<Value, TaskError> + Send + Sync + Clone + 'static,
    {
        let name = spec.name.clone();
        let handler = self.recording_handler(&name, body);
        self.engine
            .register_task(spec, handler)
            .await
            .expect("register task");
    }

    /// Register a probe task that always fails.
    pub async fn register_fail(&self, name: &str, non_retriable: bool) {
        let message = format!("{name} exploded");
        self.register_fn(TaskSpec::new(name), move |_payload| {
            if non_retriable {
                Err(TaskError::non_retriable(message.clone()))
            } else {
                Err(TaskError::failed(message.clone()))
            }
        })
        .await;
    }

    /// Register a probe task that signals `started` and then waits for
    /// `release` before returning its payload.
    pub async fn register_gated(&self, name: &str, started: Arc<Notify>, release: Arc<Notify>) {
        let probes = Arc::clone(&self.probes);
        let task = name.to_string();
        let handler: TaskHandler = Arc::new(move |payload, _ctx| {
            let probes = Arc::clone(&probes);
            let task = task.clone();
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            Box::pin(async move {
                probes.record(&task, &payload).await;
                started.notify_one();
                release.notified().await;
                Ok(payload)
            })
        });
        self.engine
            .register_task(TaskSpec::new(name), handler)
            .await
            .expect("register task");
    }

    /// Register a probe task that tracks a shared concurrency gauge.
    pub async fn register_gauged(&self, name: &str, gauge: Arc<ConcurrencyGauge>) {
        let probes = Arc::clone(&self.probes);
        let task = name.to_string();
        let handler: TaskHandler = Arc::new(move |payload, _ctx| {
            let probes = Arc::clone(&probes);
            let task = task.clone();
            let gauge = Arc::clone(&gauge);
            Box::pin(async move {
                probes.record(&task, &payload).await;
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(25)).await;
                gauge.exit();
                Ok(payload)
            })
        });
        self.engine
            .register_task(TaskSpec::new(name), handler)
            .await
            .expect("register task");
    }

    fn recording_handler<F>(&self, name: &str, body: F) -> TaskHandler
    where
        F: Fn(Value) -> Result<Value, TaskError> + Send + Sync + Clone + 'static,
    {
        let probes = Arc::clone(&self.probes);
        let task = name.to_string();
        Arc::new(move |payload, _ctx| {
            let probes = Arc::clone(&probes);
            let task = task.clone();
            let body = body.clone();
            Box::pin(async move {
                probes.record(&task, &payload).await;
                body(payload)
            })
        })
    }

    /// Join executor quiescence.
    pub async fn settle(&self) {
        assert!(
            self.executor.wait_idle(IDLE_TIMEOUT).await,
            "executor did not go idle within {IDLE_TIMEOUT:?}"
        );
    }

    /// Live signature keys (registry records filtered out).
    pub async fn live_signature_keys(&self) -> Vec<String> {
        self.store
            .live_keys()
            .await
            .expect("live_keys")
            .into_iter()
            .filter(|key| !key.starts_with("task-def:"))
            .collect()
    }

    /// Assert the store holds no signature records any more.
    pub async fn assert_store_clean(&self) {
        let keys = self.live_signature_keys().await;
        assert!(keys.is_empty(), "leftover signature records: {keys:?}");
    }
}

/// Shared gauge asserting a concurrency ceiling.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicI64,
    peak: AtomicI64,
}

impl ConcurrencyGauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::SeqCst)
    }
}
