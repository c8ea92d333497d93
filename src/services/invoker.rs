//! The invoker: per-execution lifecycle wrapper around every user task body.
//!
//! Order of operations, per attempt:
//! 1. gate — refuse signatures that must not run (and ask the executor to
//!    cancel the attempt),
//! 2. start — transition to ACTIVE under the signature lock, record the
//!    execution ID, run the subtype start hook,
//! 3. body,
//! 4. success — end hook, success callbacks, cleanup keeping them alive,
//! 5. error — rethrow while the executor still owes retries; otherwise end
//!    hook, error callbacks, cleanup, rethrow.
//!
//! No lock is held around the body, and callback dispatch never waits on
//! callback completion.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::domain::errors::FlowResult;
use crate::domain::models::signature::{Signature, SignatureId};
use crate::domain::models::status::SignatureStatus;
use crate::domain::ports::executor::{TaskContext, TaskError, TaskHandler, TaskResult, TriggerScope};
use crate::services::engine::{task_data, FlowEngine, TASK_ID_PARAM};

/// Wrap a task body with the signature lifecycle.
pub fn wrap_task(engine: Arc<FlowEngine>, logical_name: String, inner: TaskHandler) -> TaskHandler {
    Arc::new(move |payload, ctx| {
        let engine = Arc::clone(&engine);
        let name = logical_name.clone();
        let inner = Arc::clone(&inner);
        Box::pin(async move { invoke(&engine, &name, &inner, payload, ctx).await })
    })
}

#[instrument(skip_all, fields(task = %logical_name, execution = %ctx.execution_id))]
async fn invoke(
    engine: &Arc<FlowEngine>,
    logical_name: &str,
    inner: &TaskHandler,
    payload: Value,
    ctx: TaskContext,
) -> TaskResult {
    let data = task_data(&ctx);
    let Some(task_id) = data
        .get(TASK_ID_PARAM)
        .and_then(Value::as_str)
        .map(SignatureId::from)
    else {
        // Not signature-tracked: run the body plain.
        return inner(payload, ctx).await;
    };

    match engine.try_load_signature(&task_id).await? {
        None => {
            warn!(signature = %task_id, "signature gone, refusing attempt");
            return refuse(engine, &ctx).await;
        }
        Some(signature) if !signature.should_run() => {
            debug!(signature = %task_id, status = ?signature.core().task_status.status, "signature inactive, refusing attempt");
            engine.mark_last_status_active(&task_id).await?;
            engine.handle_inactive(&signature, &payload).await?;
            return refuse(engine, &ctx).await;
        }
        Some(_) => {}
    }

    let signature = start_task(engine, &task_id, &ctx).await?;

    let scope = match &signature {
        Signature::Root(root) => root
            .swarm_id
            .clone()
            .map_or_else(TriggerScope::default, TriggerScope::for_root_swarm),
        _ => TriggerScope::default(),
    };
    let mut body_ctx = ctx.clone();
    body_ctx.additional_metadata = ctx.forwardable_metadata();
    body_ctx.scope = scope;

    let result = inner(payload.clone(), body_ctx).await;

    match result {
        Ok(value) => {
            engine.end_task_hook(&signature, true).await?;
            // Reload: the end hook may have rewired callbacks.
            let current = engine.load_signature(&task_id).await?;
            engine.activate_success(&current, value.clone()).await?;
            engine.remove_signature(&current, false, true).await?;
            Ok(value)
        }
        Err(error) => {
            let registration = engine.registry().safe_get(logical_name).await?;
            let retry = registration
                .as_ref()
                .is_some_and(|r| r.should_retry(ctx.attempt_number, &error));
            if retry {
                debug!(signature = %task_id, attempt = ctx.attempt_number, "failing attempt, executor will retry");
                return Err(error);
            }
            warn!(signature = %task_id, error = %error, "task failed, firing error callbacks");
            engine.end_task_hook(&signature, false).await?;
            let current = engine.load_signature(&task_id).await?;
            engine.activate_error(&current, payload).await?;
            engine.remove_signature(&current, true, false).await?;
            Err(error)
        }
    }
}

/// Locked start transition: ACTIVE, execution ID, subtype hook.
async fn start_task(
    engine: &Arc<FlowEngine>,
    task_id: &SignatureId,
    ctx: &TaskContext,
) -> FlowResult<Signature> {
    let lock = engine.lock_key(task_id.as_str()).await?;
    let outcome: FlowResult<Signature> = async {
        let mut signature = engine.load_signature(task_id).await?;
        signature
            .core_mut()
            .task_status
            .transition(SignatureStatus::Active);
        signature.core_mut().task_status.worker_execution_id = ctx.execution_id.clone();
        engine.save_signature(&signature).await?;

        if engine.start_task_hook(&signature).await?.is_some() {
            // The hook rewrote fields on the stored record.
            signature = engine.load_signature(task_id).await?;
        }
        Ok(signature)
    }
    .await;
    lock.release().await?;
    outcome
}

/// Ask the executor to drop the attempt, then give it time to act before the
/// wrapper returns.
async fn refuse(engine: &Arc<FlowEngine>, ctx: &TaskContext) -> TaskResult {
    engine
        .executor()
        .cancel(&ctx.execution_id)
        .await
        .map_err(crate::domain::errors::FlowError::from)?;
    ctx.request_cancel();
    tokio::time::sleep(engine.config().cancel_grace()).await;
    Err(TaskError::Canceled)
}
