//! Signature persistence and trigger dispatch.

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::payload::{as_map, merge_maps, JsonMap};
use crate::domain::models::signature::{Signature, SignatureId};
use crate::domain::models::status::SignatureStatus;
use crate::domain::ports::executor::TriggerScope;
use crate::domain::ports::store::FieldOp;
use crate::services::triggers::TriggerBuilder;

use super::{FlowEngine, ON_SWARM_START, SWARM_TASK_ID_PARAM, TASK_ID_PARAM};

impl FlowEngine {
    /// Polymorphic load: the subtype tag embedded in the ID routes
    /// deserialization to the concrete record. Absence is `MissingSignature`.
    pub async fn load_signature(&self, id: &SignatureId) -> FlowResult<Signature> {
        self.try_load_signature(id)
            .await?
            .ok_or_else(|| FlowError::MissingSignature(id.to_string()))
    }

    /// Load with absence flattened to `None`.
    pub async fn try_load_signature(&self, id: &SignatureId) -> FlowResult<Option<Signature>> {
        id.kind()?;
        match self.store.try_load(id.as_str()).await? {
            Some(found) => Ok(Some(serde_json::from_value(found.value)?)),
            None => Ok(None),
        }
    }

    pub async fn save_signature(&self, signature: &Signature) -> FlowResult<()> {
        let value = serde_json::to_value(signature)?;
        self.store
            .save(
                signature.id().as_str(),
                value,
                Some(self.config.signature_ttl()),
            )
            .await?;
        Ok(())
    }

    /// Atomically append callbacks to both lists.
    pub async fn add_callbacks(
        &self,
        id: &SignatureId,
        success: Vec<SignatureId>,
        error: Vec<SignatureId>,
    ) -> FlowResult<()> {
        let mut ops = Vec::new();
        if !success.is_empty() {
            ops.push(FieldOp::ListExtend {
                path: "success_callbacks".to_string(),
                values: success
                    .iter()
                    .map(|id| Value::String(id.as_str().to_string()))
                    .collect(),
            });
        }
        if !error.is_empty() {
            ops.push(FieldOp::ListExtend {
                path: "error_callbacks".to_string(),
                values: error
                    .iter()
                    .map(|id| Value::String(id.as_str().to_string()))
                    .collect(),
            });
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.store.apply(id.as_str(), ops).await?;
        Ok(())
    }

    /// Merge kwargs into the signature that actually runs: chains forward to
    /// their first step.
    pub async fn update_kwargs(&self, signature: &Signature, updates: JsonMap) -> FlowResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.update_kwargs_boxed(signature.clone(), updates).await
    }

    fn update_kwargs_boxed(
        &self,
        signature: Signature,
        updates: JsonMap,
    ) -> BoxFuture<'_, FlowResult<()>> {
        Box::pin(async move {
            match &signature {
                Signature::Chain(chain) => {
                    let first = chain.first_task().ok_or_else(|| {
                        FlowError::MissingSignature(format!("chain {} has no steps", chain.core.id))
                    })?;
                    let step = self.load_signature(first).await?;
                    self.update_kwargs_boxed(step, updates).await
                }
                _ => {
                    self.store
                        .apply(
                            signature.id().as_str(),
                            vec![FieldOp::MapMerge {
                                path: "kwargs".to_string(),
                                entries: updates,
                            }],
                        )
                        .await?;
                    Ok(())
                }
            }
        })
    }

    /// Submit a signature to the executor without waiting.
    ///
    /// Under a root scope the trigger is redirected: the signature joins the
    /// root swarm and its batch item runs instead.
    pub async fn run_no_wait(
        &self,
        signature: &Signature,
        msg: Value,
        scope: &TriggerScope,
    ) -> FlowResult<()> {
        if let Some(swarm_id) = &scope.root_swarm {
            if !matches!(signature, Signature::SwarmItem(_)) {
                // Kickoff stays with us: the batch item runs with this
                // message, not an empty one.
                let batch = self
                    .add_task_inner(swarm_id, signature.into(), true, false)
                    .await?;
                return self.trigger_batch_item(&batch, msg).await;
            }
        }
        self.trigger_signature(signature, msg, false, JsonMap::new())
            .await
    }

    /// Kind-dispatched trigger: chains run their first step, swarms run the
    /// synthetic start task, batch items run the swarm admission protocol.
    pub(crate) async fn trigger_signature(
        &self,
        signature: &Signature,
        msg: Value,
        use_return_field: bool,
        extra_kwargs: JsonMap,
    ) -> FlowResult<()> {
        self.trigger_boxed(signature.clone(), msg, use_return_field, extra_kwargs)
            .await
    }

    fn trigger_boxed(
        &self,
        signature: Signature,
        msg: Value,
        use_return_field: bool,
        extra_kwargs: JsonMap,
    ) -> BoxFuture<'_, FlowResult<()>> {
        Box::pin(async move {
            match &signature {
                Signature::Chain(chain) => {
                    let first = chain.first_task().ok_or_else(|| {
                        FlowError::MissingSignature(format!("chain {} has no steps", chain.core.id))
                    })?;
                    let step = self.load_signature(first).await?;
                    self.trigger_boxed(step, msg, use_return_field, extra_kwargs)
                        .await
                }
                Signature::SwarmItem(item) => self.trigger_batch_item(item, msg).await,
                Signature::Swarm(_) => {
                    // Persist the message so a queued or resumed start sees
                    // the latest arguments.
                    self.store
                        .apply(
                            signature.id().as_str(),
                            vec![FieldOp::MapMerge {
                                path: "kwargs".to_string(),
                                entries: as_map(msg.clone()),
                            }],
                        )
                        .await?;
                    let builder = self
                        .trigger_builder(&signature, use_return_field, extra_kwargs)
                        .await?;
                    self.executor.trigger(builder.build(msg)).await?;
                    Ok(())
                }
                _ => {
                    let builder = self
                        .trigger_builder(&signature, use_return_field, extra_kwargs)
                        .await?;
                    self.executor.trigger(builder.build(msg)).await?;
                    Ok(())
                }
            }
        })
    }

    /// Build the executor trigger for a signature (the workflow adapter).
    pub(crate) async fn trigger_builder(
        &self,
        signature: &Signature,
        use_return_field: bool,
        extra_kwargs: JsonMap,
    ) -> FlowResult<TriggerBuilder> {
        let core = signature.core();
        let registration = self.registry.safe_get(&core.task_name).await?;
        let executor_name = match signature {
            Signature::Swarm(_) => ON_SWARM_START.to_string(),
            _ => registration
                .as_ref()
                .map_or_else(|| core.task_name.clone(), |r| r.executor_task_name.clone()),
        };

        let mut task_ctx = core.task_identifiers.clone();
        task_ctx.insert(
            TASK_ID_PARAM.to_string(),
            Value::String(core.id.as_str().to_string()),
        );
        if matches!(signature, Signature::Swarm(_)) {
            task_ctx.insert(
                SWARM_TASK_ID_PARAM.to_string(),
                Value::String(core.id.as_str().to_string()),
            );
        }

        let return_field = use_return_field.then(|| core.return_value_field());

        Ok(TriggerBuilder::new(executor_name)
            .kwargs(merge_maps(core.kwargs.clone(), extra_kwargs))
            .return_value_field(return_field)
            .task_ctx(task_ctx))
    }

    /// Remove a signature and, per the flags, its direct callbacks. Owned
    /// children (chain steps, swarm items, batch originals) always go with
    /// their owner.
    pub async fn remove_signature(
        &self,
        signature: &Signature,
        with_success: bool,
        with_error: bool,
    ) -> FlowResult<()> {
        self.remove_boxed(signature.clone(), with_success, with_error)
            .await
    }

    fn remove_boxed(
        &self,
        signature: Signature,
        with_success: bool,
        with_error: bool,
    ) -> BoxFuture<'_, FlowResult<()>> {
        Box::pin(async move {
            let core = signature.core();
            let mut callback_targets: Vec<SignatureId> = Vec::new();
            if with_error {
                callback_targets.extend(core.error_callbacks.iter().cloned());
            }
            if with_success {
                callback_targets.extend(core.success_callbacks.iter().cloned());
            }

            self.store.delete(core.id.as_str()).await?;
            debug!(signature = %core.id, "removed signature");

            for target in callback_targets {
                self.try_remove(&target).await;
            }

            match &signature {
                Signature::Chain(chain) => {
                    for step in &chain.tasks {
                        self.try_remove(step).await;
                    }
                }
                Signature::Swarm(swarm) => {
                    for item in &swarm.tasks {
                        self.try_remove(item).await;
                    }
                }
                Signature::SwarmItem(item) => {
                    self.try_remove(&item.original_task_id).await;
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Best-effort full removal; absence and failures are swallowed.
    pub async fn try_remove(&self, id: &SignatureId) {
        match self.try_load_signature(id).await {
            Ok(Some(signature)) => {
                if let Err(e) = self.remove_boxed(signature, true, true).await {
                    warn!(signature = %id, error = %e, "best-effort removal failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(signature = %id, error = %e, "best-effort removal failed to load"),
        }
    }

    /// React to a trigger landing on an inactive signature: suspended
    /// signatures absorb the payload into their kwargs so a resumed run sees
    /// the latest arguments; canceled signatures are removed.
    pub(crate) async fn handle_inactive(
        &self,
        signature: &Signature,
        msg: &Value,
    ) -> FlowResult<()> {
        match signature.core().task_status.status {
            SignatureStatus::Suspended => {
                self.update_kwargs(signature, as_map(msg.clone())).await
            }
            SignatureStatus::Canceled => self.remove_signature(signature, true, true).await,
            _ => Ok(()),
        }
    }

    /// Record that the signature had been picked up, so a later `resume`
    /// re-triggers it.
    pub(crate) async fn mark_last_status_active(&self, id: &SignatureId) -> FlowResult<()> {
        let mut entries = JsonMap::new();
        entries.insert(
            "last_status".to_string(),
            serde_json::to_value(SignatureStatus::Active)?,
        );
        self.store
            .apply(
                id.as_str(),
                vec![FieldOp::MapMerge {
                    path: "task_status".to_string(),
                    entries,
                }],
            )
            .await?;
        Ok(())
    }

    /// Subtype start hook. Roots create their implicit swarm and return its
    /// ID for the body's trigger scope.
    pub(crate) async fn start_task_hook(
        &self,
        signature: &Signature,
    ) -> FlowResult<Option<SignatureId>> {
        match signature {
            Signature::Root(root) => Ok(Some(self.root_start(root).await?)),
            _ => Ok(None),
        }
    }

    /// Subtype end hook.
    pub(crate) async fn end_task_hook(
        &self,
        signature: &Signature,
        success: bool,
    ) -> FlowResult<()> {
        match signature {
            Signature::Root(root) => self.root_end(root, success).await,
            _ => Ok(()),
        }
    }
}
