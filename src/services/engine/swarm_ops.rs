//! Swarm engine: bounded-concurrency fan-out with failure threshold and
//! dynamic membership.
//!
//! Lock discipline: batch-item lock before swarm lock, and no lock is ever
//! held across an executor trigger. Everything that mutates swarm bookkeeping
//! (admission, completion, refill, close) runs under the swarm's advisory
//! lock; triggers and callback fan-out happen after release.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::payload::{self, as_map, merge_maps, JsonMap};
use crate::domain::models::signature::{Signature, SignatureId, SignatureRef};
use crate::domain::models::status::SignatureStatus;
use crate::domain::models::swarm::{
    BatchItemSignature, SwarmConfig, SwarmSignature, BATCH_TASK_NAME_PREFIX,
};
use crate::domain::ports::executor::{TaskContext, TaskResult};
use crate::domain::ports::store::FieldOp;

use super::{
    required_id, task_data, CallbackOptions, FlowEngine, SignOptions, ON_SWARM_DONE,
    ON_SWARM_ERROR, SWARM_ITEM_ID_PARAM, SWARM_TASK_ID_PARAM, TASK_ID_PARAM,
};

/// Options for building a swarm.
#[derive(Debug, Clone, Default)]
pub struct SwarmOptions {
    pub name: Option<String>,
    pub config: SwarmConfig,
    pub kwargs: JsonMap,
    pub success_callbacks: Vec<SignatureId>,
    pub error_callbacks: Vec<SignatureId>,
}

impl FlowEngine {
    /// Create a swarm and add the initial members.
    pub async fn swarm(
        &self,
        tasks: Vec<SignatureRef>,
        options: SwarmOptions,
    ) -> FlowResult<Signature> {
        let name = options
            .name
            .unwrap_or_else(|| format!("swarm-task-{}", Uuid::new_v4()));
        let mut swarm = SwarmSignature::new(name, options.config);
        swarm.core.kwargs = options.kwargs;
        swarm.core.success_callbacks = options.success_callbacks;
        swarm.core.error_callbacks = options.error_callbacks;

        let signature = Signature::Swarm(swarm);
        self.save_signature(&signature).await?;

        for task in tasks {
            self.add_task_inner(signature.id(), task, true, false).await?;
        }
        self.load_signature(signature.id()).await
    }

    /// Add a member to a swarm.
    ///
    /// When the swarm is already running, the new batch item kicks itself
    /// off: the admission protocol either grants it a slot or parks it on the
    /// backlog, under the swarm lock.
    pub async fn add_task_to_swarm(
        &self,
        swarm_id: &SignatureId,
        task: SignatureRef,
        close_on_max: bool,
    ) -> FlowResult<BatchItemSignature> {
        self.add_task_inner(swarm_id, task, close_on_max, true).await
    }

    pub(crate) async fn add_task_inner(
        &self,
        swarm_id: &SignatureId,
        task: SignatureRef,
        close_on_max: bool,
        kickoff: bool,
    ) -> FlowResult<BatchItemSignature> {
        let lock = self.lock_key(swarm_id.as_str()).await?;
        let outcome = self.add_task_locked(swarm_id, task, close_on_max).await;
        lock.release().await?;
        let (batch, should_close, started) = outcome?;

        if should_close {
            self.close_swarm(swarm_id).await?;
        }
        if kickoff && started {
            self.trigger_batch_item(&batch, payload::empty()).await?;
        }
        Ok(batch)
    }

    async fn add_task_locked(
        &self,
        swarm_id: &SignatureId,
        task: SignatureRef,
        close_on_max: bool,
    ) -> FlowResult<(BatchItemSignature, bool, bool)> {
        let swarm = self.load_swarm(swarm_id).await?;
        if !swarm.can_add_task() {
            return Err(FlowError::TooManyTasks(swarm.core.task_name.clone()));
        }
        if swarm.core.task_status.is_canceled() {
            return Err(FlowError::SwarmCanceled(swarm.core.task_name.clone()));
        }

        let original = self.resolve(task).await?;
        let mut batch = BatchItemSignature::new(
            format!("{BATCH_TASK_NAME_PREFIX}{}", original.task_name()),
            swarm_id.clone(),
            original.id().clone(),
        );
        batch.core.kwargs = original.core().kwargs.clone();
        batch.core.task_identifiers = original.core().task_identifiers.clone();

        let mut identifiers = JsonMap::new();
        identifiers.insert(
            SWARM_TASK_ID_PARAM.to_string(),
            Value::String(swarm_id.as_str().to_string()),
        );
        identifiers.insert(
            SWARM_ITEM_ID_PARAM.to_string(),
            Value::String(batch.core.id.as_str().to_string()),
        );

        // The wrapper's completion callbacks bridge back to swarm bookkeeping.
        let on_done = self
            .sign(
                ON_SWARM_DONE,
                SignOptions {
                    task_identifiers: identifiers.clone(),
                    ..SignOptions::default()
                },
            )
            .await?;
        let on_error = self
            .sign(
                ON_SWARM_ERROR,
                SignOptions {
                    task_identifiers: identifiers,
                    ..SignOptions::default()
                },
            )
            .await?;
        self.add_callbacks(
            original.id(),
            vec![on_done.id().clone()],
            vec![on_error.id().clone()],
        )
        .await?;

        self.save_signature(&Signature::SwarmItem(batch.clone()))
            .await?;
        self.store
            .apply(
                swarm_id.as_str(),
                vec![FieldOp::ListAppend {
                    path: "tasks".to_string(),
                    value: Value::String(batch.core.id.as_str().to_string()),
                }],
            )
            .await?;

        let reloaded = self.load_swarm(swarm_id).await?;
        let should_close = close_on_max && !reloaded.can_add_task();
        let started = reloaded.is_swarm_started || reloaded.has_started();
        debug!(swarm = %swarm_id, batch_item = %batch.core.id, started, "added swarm task");
        Ok((batch, should_close, started))
    }

    /// Run a batch item: admit it under the concurrency cap (or park it on
    /// the backlog), compose the effective kwargs, and trigger the original.
    pub(crate) async fn trigger_batch_item(
        &self,
        item: &BatchItemSignature,
        msg: Value,
    ) -> FlowResult<()> {
        let lock = self.lock_key(item.core.id.as_str()).await?;
        let outcome = self.admit_batch_item(item, &msg).await;
        lock.release().await?;

        let (can_run, original_id) = outcome?;
        if can_run {
            let original = self.load_signature(&original_id).await?;
            self.trigger_signature(&original, msg, false, JsonMap::new())
                .await?;
        }
        Ok(())
    }

    async fn admit_batch_item(
        &self,
        item: &BatchItemSignature,
        msg: &Value,
    ) -> FlowResult<(bool, SignatureId)> {
        let swarm = match self.try_load_signature(&item.swarm_id).await? {
            Some(Signature::Swarm(swarm)) => swarm,
            Some(_) => return Err(FlowError::InvalidId(item.swarm_id.to_string())),
            None => {
                return Err(FlowError::MissingSignature(format!(
                    "swarm {} was deleted before finish",
                    item.swarm_id
                )))
            }
        };
        let original = self
            .try_load_signature(&item.original_task_id)
            .await?
            .ok_or_else(|| {
                FlowError::MissingSwarmItem(format!(
                    "task {} was deleted before it ran in the swarm",
                    item.original_task_id
                ))
            })?;

        let can_run = self.add_to_running(&item.swarm_id, &item.core.id).await?;

        let mut kwargs = merge_maps(item.core.kwargs.clone(), original.core().kwargs.clone());
        kwargs = merge_maps(kwargs, swarm.core.kwargs.clone());
        if !can_run {
            // The next runner must see the latest data.
            kwargs = merge_maps(kwargs, as_map(msg.clone()));
        }
        self.update_kwargs(&original, kwargs).await?;
        Ok((can_run, original.id().clone()))
    }

    /// Admission under the swarm lock: take a slot or join the backlog.
    async fn add_to_running(
        &self,
        swarm_id: &SignatureId,
        item_id: &SignatureId,
    ) -> FlowResult<bool> {
        let lock = self.lock_key(swarm_id.as_str()).await?;
        let outcome: FlowResult<bool> = async {
            let swarm = self.load_swarm(swarm_id).await?;
            if swarm.free_slots() > 0 {
                self.store
                    .apply(
                        swarm_id.as_str(),
                        vec![FieldOp::CounterAdd {
                            path: "current_running_tasks".to_string(),
                            delta: 1,
                        }],
                    )
                    .await?;
                Ok(true)
            } else {
                self.store
                    .apply(
                        swarm_id.as_str(),
                        vec![FieldOp::ListAppend {
                            path: "tasks_left_to_run".to_string(),
                            value: Value::String(item_id.as_str().to_string()),
                        }],
                    )
                    .await?;
                Ok(false)
            }
        }
        .await;
        lock.release().await?;
        outcome
    }

    /// Body of `mageflow_on_swarm_start`: partition members into a first
    /// batch and a backlog, then trigger the first batch. Idempotent.
    pub(crate) async fn on_swarm_start(&self, payload: Value, ctx: TaskContext) -> TaskResult {
        let data = task_data(&ctx);
        let swarm_id = required_id(&data, SWARM_TASK_ID_PARAM)?;

        let lock = self.lock_key(swarm_id.as_str()).await?;
        let outcome: FlowResult<Vec<SignatureId>> = async {
            let swarm = self.load_swarm_or_gone(&swarm_id).await?;
            if swarm.has_started() || swarm.is_swarm_started {
                debug!(swarm = %swarm_id, "swarm already started");
                return Ok(Vec::new());
            }

            let first: Vec<SignatureId> = swarm
                .tasks
                .iter()
                .take(swarm.config.max_concurrency)
                .cloned()
                .collect();
            let rest: Vec<Value> = swarm
                .tasks
                .iter()
                .skip(swarm.config.max_concurrency)
                .map(|id| Value::String(id.as_str().to_string()))
                .collect();
            debug!(
                swarm = %swarm_id,
                running_now = first.len(),
                queued = rest.len(),
                "starting swarm"
            );

            self.store
                .apply(
                    swarm_id.as_str(),
                    vec![
                        FieldOp::Set {
                            path: "tasks_left_to_run".to_string(),
                            value: Value::Array(rest),
                        },
                        FieldOp::Set {
                            path: "is_swarm_started".to_string(),
                            value: Value::Bool(true),
                        },
                    ],
                )
                .await?;
            Ok(first)
        }
        .await;
        lock.release().await.map_err(FlowError::from)?;

        for item_id in outcome? {
            match self.try_load_signature(&item_id).await? {
                Some(Signature::SwarmItem(item)) => {
                    self.trigger_batch_item(&item, payload.clone()).await?;
                }
                _ => warn!(swarm = %swarm_id, batch_item = %item_id, "initial swarm task not found, skipping"),
            }
        }
        Ok(Value::Null)
    }

    /// Body of `mageflow_on_swarm_done`: record a member's success and keep
    /// the swarm saturated. The wrapper task consumes itself regardless.
    pub(crate) async fn on_swarm_item_done(&self, payload: Value, ctx: TaskContext) -> TaskResult {
        let data = task_data(&ctx);
        let own_id = required_id(&data, TASK_ID_PARAM)?;
        let result = self.swarm_item_done_inner(&data, &payload).await;
        self.try_remove(&own_id).await;
        result?;
        Ok(Value::Null)
    }

    async fn swarm_item_done_inner(&self, data: &JsonMap, payload: &Value) -> FlowResult<()> {
        let swarm_id = required_id(data, SWARM_TASK_ID_PARAM)?;
        let item_id = required_id(data, SWARM_ITEM_ID_PARAM)?;
        debug!(swarm = %swarm_id, batch_item = %item_id, "swarm item done");

        let result_value = payload
            .get("results")
            .cloned()
            .unwrap_or_else(|| payload.clone());

        let lock = self.lock_key(swarm_id.as_str()).await?;
        let outcome: FlowResult<FinishOutcome> = async {
            self.load_swarm_or_gone(&swarm_id).await?;
            self.store
                .apply(
                    swarm_id.as_str(),
                    vec![
                        FieldOp::ListAppend {
                            path: "finished_tasks".to_string(),
                            value: Value::String(item_id.as_str().to_string()),
                        },
                        FieldOp::ListAppend {
                            path: "tasks_results".to_string(),
                            value: result_value,
                        },
                    ],
                )
                .await?;
            self.handle_finish_locked(&swarm_id).await
        }
        .await;
        lock.release().await?;

        self.post_finish(outcome?).await
    }

    /// Body of `mageflow_on_swarm_error`: record a member's failure, enforce
    /// the failure threshold, and keep the swarm saturated.
    pub(crate) async fn on_swarm_item_failed(
        &self,
        payload: Value,
        ctx: TaskContext,
    ) -> TaskResult {
        let _ = payload;
        let data = task_data(&ctx);
        let own_id = required_id(&data, TASK_ID_PARAM)?;
        let result = self.swarm_item_failed_inner(&data).await;
        self.try_remove(&own_id).await;
        result?;
        Ok(Value::Null)
    }

    async fn swarm_item_failed_inner(&self, data: &JsonMap) -> FlowResult<()> {
        let swarm_id = required_id(data, SWARM_TASK_ID_PARAM)?;
        let item_id = required_id(data, SWARM_ITEM_ID_PARAM)?;
        debug!(swarm = %swarm_id, batch_item = %item_id, "swarm item failed");

        let lock = self.lock_key(swarm_id.as_str()).await?;
        let outcome: FlowResult<FailureOutcome> = async {
            self.load_swarm_or_gone(&swarm_id).await?;
            self.store
                .apply(
                    swarm_id.as_str(),
                    vec![FieldOp::ListAppend {
                        path: "failed_tasks".to_string(),
                        value: Value::String(item_id.as_str().to_string()),
                    }],
                )
                .await?;

            let swarm = self.load_swarm(&swarm_id).await?;
            let threshold_crossed = swarm
                .config
                .effective_failure_threshold()
                .is_some_and(|threshold| swarm.failed_tasks.len() >= threshold);
            if threshold_crossed && !swarm.completion_claimed {
                // Claim under the lock so only one failure cancels the swarm.
                self.store
                    .apply(
                        swarm_id.as_str(),
                        vec![FieldOp::Set {
                            path: "completion_claimed".to_string(),
                            value: Value::Bool(true),
                        }],
                    )
                    .await?;
                return Ok(FailureOutcome::Cancel(Box::new(swarm)));
            }
            Ok(FailureOutcome::Continue(
                self.handle_finish_locked(&swarm_id).await?,
            ))
        }
        .await;
        lock.release().await?;

        match outcome? {
            FailureOutcome::Cancel(swarm) => {
                warn!(
                    swarm = %swarm_id,
                    failed = swarm.failed_tasks.len(),
                    "failure threshold crossed, canceling swarm"
                );
                let signature = Signature::Swarm(*swarm.clone());
                self.change_status(&signature, SignatureStatus::Canceled)
                    .await?;
                self.activate_swarm_error(&swarm).await?;
                Ok(())
            }
            FailureOutcome::Continue(finish) => self.post_finish(finish).await,
        }
    }

    /// Common completion step, swarm lock held: release the slot, refill
    /// from the backlog, and claim the done transition when it arrives.
    async fn handle_finish_locked(&self, swarm_id: &SignatureId) -> FlowResult<FinishOutcome> {
        self.store
            .apply(
                swarm_id.as_str(),
                vec![FieldOp::CounterAdd {
                    path: "current_running_tasks".to_string(),
                    delta: -1,
                }],
            )
            .await?;

        let to_start = self.fill_running_locked(swarm_id).await?;

        let swarm = self.load_swarm(swarm_id).await?;
        let mut claimed = false;
        if swarm.is_done() && !swarm.completion_claimed {
            self.store
                .apply(
                    swarm_id.as_str(),
                    vec![FieldOp::Set {
                        path: "completion_claimed".to_string(),
                        value: Value::Bool(true),
                    }],
                )
                .await?;
            claimed = true;
        }
        debug!(
            swarm = %swarm_id,
            running = swarm.current_running_tasks,
            finished = swarm.finished_tasks.len(),
            failed = swarm.failed_tasks.len(),
            queued = swarm.tasks_left_to_run.len(),
            total = swarm.tasks.len(),
            closed = swarm.is_swarm_closed,
            done_claimed = claimed,
            "swarm bookkeeping updated"
        );
        Ok(FinishOutcome {
            to_start,
            completed: claimed.then(|| Box::new(swarm)),
        })
    }

    /// Pop backlog entries up to the free capacity. Swarm lock held.
    async fn fill_running_locked(&self, swarm_id: &SignatureId) -> FlowResult<Vec<SignatureId>> {
        let swarm = self.load_swarm(swarm_id).await?;
        let take = swarm.free_slots().min(swarm.tasks_left_to_run.len());
        if take == 0 {
            return Ok(Vec::new());
        }
        let pops = vec![
            FieldOp::ListPopFront {
                path: "tasks_left_to_run".to_string(),
            };
            take
        ];
        let popped = self.store.apply(swarm_id.as_str(), pops).await?;
        Ok(popped
            .iter()
            .filter_map(Value::as_str)
            .map(SignatureId::from)
            .collect())
    }

    /// After the swarm lock is released: trigger refills and fire the
    /// one-shot completion if this invocation claimed it.
    async fn post_finish(&self, outcome: FinishOutcome) -> FlowResult<()> {
        for item_id in &outcome.to_start {
            match self.try_load_signature(item_id).await? {
                Some(Signature::SwarmItem(item)) => {
                    self.trigger_batch_item(&item, payload::empty()).await?;
                }
                _ => warn!(batch_item = %item_id, "queued swarm task not found, skipping"),
            }
        }
        if let Some(swarm) = outcome.completed {
            self.activate_swarm_success(&swarm).await?;
        }
        Ok(())
    }

    /// Freeze membership; fire completion immediately if everything already
    /// settled. Idempotent, also after the swarm is gone.
    pub async fn close_swarm(&self, swarm_id: &SignatureId) -> FlowResult<()> {
        let lock = self.lock_key(swarm_id.as_str()).await?;
        let outcome: FlowResult<Option<SwarmSignature>> = async {
            let Some(signature) = self.try_load_signature(swarm_id).await? else {
                return Ok(None);
            };
            let Signature::Swarm(_) = &signature else {
                return Err(FlowError::InvalidId(swarm_id.to_string()));
            };
            self.store
                .apply(
                    swarm_id.as_str(),
                    vec![FieldOp::Set {
                        path: "is_swarm_closed".to_string(),
                        value: Value::Bool(true),
                    }],
                )
                .await?;
            let swarm = self.load_swarm(swarm_id).await?;
            if swarm.is_done() && !swarm.completion_claimed {
                self.store
                    .apply(
                        swarm_id.as_str(),
                        vec![FieldOp::Set {
                            path: "completion_claimed".to_string(),
                            value: Value::Bool(true),
                        }],
                    )
                    .await?;
                return Ok(Some(swarm));
            }
            Ok(None)
        }
        .await;
        lock.release().await?;

        if let Some(swarm) = outcome? {
            self.activate_swarm_success(&swarm).await?;
        }
        Ok(())
    }

    /// Fire the swarm's success callbacks with the collected results and
    /// remove the swarm tree.
    async fn activate_swarm_success(&self, swarm: &SwarmSignature) -> FlowResult<()> {
        debug!(swarm = %swarm.core.id, results = swarm.tasks_results.len(), "swarm completed");
        let signature = Signature::Swarm(swarm.clone());
        self.activate_callbacks(
            &signature,
            Value::Array(swarm.tasks_results.clone()),
            CallbackOptions::success().with_extra_kwargs(swarm.core.kwargs.clone()),
        )
        .await?;
        self.remove_signature(&signature, false, true).await
    }

    /// Fire the swarm's error callbacks and remove the swarm tree.
    async fn activate_swarm_error(&self, swarm: &SwarmSignature) -> FlowResult<()> {
        let signature = Signature::Swarm(swarm.clone());
        self.activate_callbacks(
            &signature,
            payload::empty(),
            CallbackOptions::error().with_extra_kwargs(swarm.core.kwargs.clone()),
        )
        .await?;
        self.remove_signature(&signature, true, false).await
    }

    async fn load_swarm(&self, swarm_id: &SignatureId) -> FlowResult<SwarmSignature> {
        match self.load_signature(swarm_id).await? {
            Signature::Swarm(swarm) => Ok(swarm),
            _ => Err(FlowError::InvalidId(swarm_id.to_string())),
        }
    }

    /// Swarm lookup in the completion handlers: absence means the completion
    /// is lost, which is a [`FlowError::MissingSwarmItem`] by contract.
    async fn load_swarm_or_gone(&self, swarm_id: &SignatureId) -> FlowResult<SwarmSignature> {
        match self.try_load_signature(swarm_id).await? {
            Some(Signature::Swarm(swarm)) => Ok(swarm),
            Some(_) => Err(FlowError::InvalidId(swarm_id.to_string())),
            None => Err(FlowError::MissingSwarmItem(format!(
                "swarm {swarm_id} not found"
            ))),
        }
    }
}

struct FinishOutcome {
    to_start: Vec<SignatureId>,
    completed: Option<Box<SwarmSignature>>,
}

enum FailureOutcome {
    Cancel(Box<SwarmSignature>),
    Continue(FinishOutcome),
}
