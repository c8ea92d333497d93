//! In-memory executor adapter.
//!
//! Runs registered task bodies on spawned tokio tasks — fast, but not durable
//! across process restarts. Retry semantics follow the executor contract:
//! an attempt chain retries while `attempt < retries`, unless the error is
//! non-retriable or the attempt requested its own cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ports::executor::{
    Executor, ExecutorError, TaskContext, TaskDefinition, TaskError, Trigger, TriggerHandle,
};

/// In-memory [`Executor`] using spawned tokio tasks.
#[derive(Default)]
pub struct InMemoryExecutor {
    tasks: RwLock<HashMap<String, TaskDefinition>>,
    /// Cancel flags of running attempt chains (execution_id -> flag).
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    inflight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempt chains currently in flight.
    pub fn active_count(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Wait until every triggered execution (including those they trigger in
    /// turn) has finished. Returns false on timeout. Test helper — new work
    /// is always counted before its parent finishes, so zero means quiescent.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inflight.load(Ordering::SeqCst) > 0 {
            let notified = self.idle.notified();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inflight.load(Ordering::SeqCst) == 0;
            }
        }
        true
    }

    async fn run_attempts(
        definition: TaskDefinition,
        trigger: Trigger,
        execution_id: String,
        cancel_flag: Arc<AtomicBool>,
    ) {
        let mut attempt: u32 = 1;
        loop {
            let ctx = TaskContext::new(
                execution_id.clone(),
                attempt,
                trigger.additional_metadata.clone(),
            )
            .with_cancel_flag(Arc::clone(&cancel_flag));

            let body = (definition.handler)(trigger.payload.clone(), ctx);
            let result = match definition.execution_timeout {
                Some(limit) => match tokio::time::timeout(limit, body).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::failed(format!(
                        "execution timed out after {limit:?}"
                    ))),
                },
                None => body.await,
            };

            match result {
                Ok(_) => {
                    debug!(task = %trigger.task_name, execution_id = %execution_id, attempt, "task attempt succeeded");
                    return;
                }
                Err(TaskError::Canceled) => {
                    debug!(task = %trigger.task_name, execution_id = %execution_id, "task attempt canceled");
                    return;
                }
                Err(e) => {
                    if cancel_flag.load(Ordering::SeqCst) {
                        debug!(task = %trigger.task_name, execution_id = %execution_id, "cancel requested, dropping attempt chain");
                        return;
                    }
                    let retriable = !e.is_non_retriable() && attempt < definition.retries;
                    if retriable {
                        debug!(task = %trigger.task_name, execution_id = %execution_id, attempt, error = %e, "retrying task attempt");
                        attempt += 1;
                        continue;
                    }
                    warn!(task = %trigger.task_name, execution_id = %execution_id, attempt, error = %e, "task failed, no more attempts");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Executor for InMemoryExecutor {
    async fn register(&self, definition: TaskDefinition) -> Result<(), ExecutorError> {
        debug!(task = %definition.name, retries = definition.retries, "registering task");
        self.tasks
            .write()
            .await
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    async fn trigger(&self, trigger: Trigger) -> Result<TriggerHandle, ExecutorError> {
        let definition = self
            .tasks
            .read()
            .await
            .get(&trigger.task_name)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownTask(trigger.task_name.clone()))?;

        let execution_id = Uuid::new_v4().to_string();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .await
            .insert(execution_id.clone(), Arc::clone(&cancel_flag));

        // Count before spawning so wait_idle never observes a false zero.
        self.inflight.fetch_add(1, Ordering::SeqCst);

        let cancel_flags = Arc::clone(&self.cancel_flags);
        let inflight = Arc::clone(&self.inflight);
        let idle = Arc::clone(&self.idle);
        let id = execution_id.clone();
        tokio::spawn(async move {
            Self::run_attempts(definition, trigger, id.clone(), cancel_flag).await;
            cancel_flags.lock().await.remove(&id);
            inflight.fetch_sub(1, Ordering::SeqCst);
            idle.notify_waiters();
        });

        Ok(TriggerHandle { execution_id })
    }

    async fn cancel(&self, execution_id: &str) -> Result<(), ExecutorError> {
        if let Some(flag) = self.cancel_flags.lock().await.get(execution_id) {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}
