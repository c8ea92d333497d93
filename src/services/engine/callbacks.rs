//! Callback dispatcher.
//!
//! Resolves a signature's success/error callback IDs and fires them through
//! the executor in parallel, without waiting for completion. Callbacks are
//! one-shot: a missing ID means it was already consumed, which is an error on
//! the caller (double fire), not a condition to paper over.

use futures::future::join_all;
use serde_json::Value;
use tracing::debug;

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::payload::JsonMap;
use crate::domain::models::signature::{Signature, SignatureId};

use super::FlowEngine;

/// Which callback lists to fire and how to shape the payload.
#[derive(Debug, Clone)]
pub struct CallbackOptions {
    pub with_success: bool,
    pub with_error: bool,
    /// Nest the message under each callback's return-value field. Always
    /// disabled on the error path: error payloads do not flow as results.
    pub use_return_field: bool,
    /// Extra kwargs overlaid on every callback trigger.
    pub extra_kwargs: JsonMap,
}

impl CallbackOptions {
    pub fn success() -> Self {
        Self {
            with_success: true,
            with_error: false,
            use_return_field: true,
            extra_kwargs: JsonMap::new(),
        }
    }

    pub fn error() -> Self {
        Self {
            with_success: false,
            with_error: true,
            use_return_field: false,
            extra_kwargs: JsonMap::new(),
        }
    }

    pub fn with_extra_kwargs(mut self, extra: JsonMap) -> Self {
        self.extra_kwargs = extra;
        self
    }
}

impl FlowEngine {
    /// Fire the selected callbacks of `signature` with `msg`, in parallel,
    /// fire-and-forget. Fails with [`FlowError::MissingSignature`] if any
    /// callback ID no longer resolves.
    pub async fn activate_callbacks(
        &self,
        signature: &Signature,
        msg: Value,
        options: CallbackOptions,
    ) -> FlowResult<()> {
        let core = signature.core();
        let mut callback_ids: Vec<SignatureId> = Vec::new();
        if options.with_success {
            callback_ids.extend(core.success_callbacks.iter().cloned());
        }
        if options.with_error {
            callback_ids.extend(core.error_callbacks.iter().cloned());
        }
        if callback_ids.is_empty() {
            return Ok(());
        }

        let loaded = join_all(callback_ids.iter().map(|id| self.try_load_signature(id))).await;
        let mut callbacks = Vec::with_capacity(loaded.len());
        for (id, result) in callback_ids.iter().zip(loaded) {
            match result? {
                Some(callback) => callbacks.push(callback),
                None => {
                    return Err(FlowError::MissingSignature(format!(
                        "callback {id} not found; callbacks fire only once"
                    )))
                }
            }
        }

        debug!(signature = %core.id, count = callbacks.len(), "activating callbacks");
        let triggers = callbacks.iter().map(|callback| {
            self.trigger_signature(
                callback,
                msg.clone(),
                options.use_return_field,
                options.extra_kwargs.clone(),
            )
        });
        for result in join_all(triggers).await {
            result?;
        }
        Ok(())
    }

    pub async fn activate_success(&self, signature: &Signature, msg: Value) -> FlowResult<()> {
        self.activate_callbacks(signature, msg, CallbackOptions::success())
            .await
    }

    pub async fn activate_error(&self, signature: &Signature, msg: Value) -> FlowResult<()> {
        self.activate_callbacks(signature, msg, CallbackOptions::error())
            .await
    }
}
