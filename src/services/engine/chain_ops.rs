//! Chain engine: linear composition with per-step success/error fan-out.

use serde_json::Value;
use tracing::{debug, error};

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::chain::ChainSignature;
use crate::domain::models::signature::{Signature, SignatureRef};
use crate::domain::ports::executor::{TaskContext, TaskError, TaskResult};

use super::{
    required_id, task_data, FlowEngine, SignOptions, CHAIN_TASK_ID_PARAM, ON_CHAIN_END,
    ON_CHAIN_ERROR, TASK_ID_PARAM,
};

/// Options for building a chain.
#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    pub name: Option<String>,
    /// Chain-level success callback, fired with the last step's result.
    pub success: Option<crate::domain::models::signature::SignatureId>,
    /// Chain-level error callback, fired when any step fails.
    pub error: Option<crate::domain::models::signature::SignatureId>,
}

impl FlowEngine {
    /// Compose signatures into a sequential pipeline.
    ///
    /// Each step's success callback points at the next step (the last one at
    /// the synthetic chain-end task); each step gets its own copy of the
    /// chain-error signature so a failure anywhere reports the chain exactly
    /// once.
    pub async fn chain(
        &self,
        tasks: Vec<SignatureRef>,
        options: ChainOptions,
    ) -> FlowResult<Signature> {
        if tasks.len() < 2 {
            return Err(FlowError::ChainTooShort(tasks.len()));
        }

        let mut steps = Vec::with_capacity(tasks.len());
        for task in tasks {
            steps.push(self.resolve(task).await?);
        }

        let chain_name = options
            .name
            .unwrap_or_else(|| steps[0].task_name().to_string());
        let mut chain = ChainSignature::new(
            format!("chain-task:{chain_name}"),
            steps.iter().map(|s| s.id().clone()).collect(),
        );
        if let Some(success) = options.success {
            chain.core.success_callbacks.push(success);
        }
        if let Some(error) = options.error {
            chain.core.error_callbacks.push(error);
        }
        let chain = Signature::Chain(chain);
        self.save_signature(&chain).await?;

        let mut identifiers = serde_json::Map::new();
        identifiers.insert(
            CHAIN_TASK_ID_PARAM.to_string(),
            Value::String(chain.id().as_str().to_string()),
        );

        let end_signature = self
            .sign(
                ON_CHAIN_END,
                SignOptions {
                    task_identifiers: identifiers.clone(),
                    ..SignOptions::default()
                },
            )
            .await?;
        let error_template = self
            .sign(
                ON_CHAIN_ERROR,
                SignOptions {
                    task_identifiers: identifiers,
                    ..SignOptions::default()
                },
            )
            .await?;
        // One error signature per step; the template serves the first.
        let mut error_signatures = vec![error_template.id().clone()];
        for copy in self.duplicate_many(&error_template, steps.len() - 1).await? {
            error_signatures.push(copy.id().clone());
        }

        for (i, step) in steps.iter().enumerate() {
            let next = steps
                .get(i + 1)
                .map_or_else(|| end_signature.id().clone(), |s| s.id().clone());
            self.add_callbacks(step.id(), vec![next], vec![error_signatures[i].clone()])
                .await?;
        }

        debug!(chain = %chain.id(), steps = steps.len(), "chain created");
        Ok(chain)
    }

    /// Body of `mageflow_on_chain_end`: fires the chain's own success
    /// callbacks with the last step's result, then tears the chain down.
    pub(crate) async fn on_chain_end(&self, payload: Value, ctx: TaskContext) -> TaskResult {
        let data = task_data(&ctx);
        let chain_id = required_id(&data, CHAIN_TASK_ID_PARAM)?;
        let own_id = required_id(&data, TASK_ID_PARAM)?;

        let chain = self.load_signature(&chain_id).await?;
        debug!(chain = %chain_id, "chain completed");

        let results = payload
            .get("chain_results")
            .cloned()
            .unwrap_or(payload.clone());
        // Callbacks fire before deletion so a cleanup error cannot eat them.
        self.activate_success(&chain, results).await?;

        self.remove_signature(&chain, false, true).await?;
        self.try_remove(&own_id).await;
        Ok(Value::Null)
    }

    /// Body of `mageflow_on_chain_error`: fires the chain's error callbacks
    /// and deletes the chain with every still-present step.
    pub(crate) async fn on_chain_error(&self, payload: Value, ctx: TaskContext) -> TaskResult {
        let data = task_data(&ctx);
        let chain_id = required_id(&data, CHAIN_TASK_ID_PARAM)?;
        let own_id = required_id(&data, TASK_ID_PARAM)?;

        let chain = match self.try_load_signature(&chain_id).await? {
            Some(chain) => chain,
            None => {
                error!(chain = %chain_id, "chain vanished before its error task ran");
                self.try_remove(&own_id).await;
                return Err(TaskError::from(FlowError::MissingSignature(
                    chain_id.to_string(),
                )));
            }
        };
        debug!(chain = %chain_id, "chain failed");

        self.activate_error(&chain, payload).await?;

        self.remove_signature(&chain, true, false).await?;
        self.try_remove(&own_id).await;
        Ok(Value::Null)
    }
}
