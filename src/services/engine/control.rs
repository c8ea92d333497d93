//! Control-plane operations: suspend, resume, pause and status broadcast.
//!
//! Broadcasts over composite children are best effort by contract: per-child
//! failures are logged and discarded. The by-ID helpers acquire the per-key
//! advisory lock around load-act-release.

use futures::future::{join_all, BoxFuture};
use tracing::warn;

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::payload;
use crate::domain::models::signature::{Signature, SignatureId};
use crate::domain::models::status::{PauseKind, SignatureStatus};
use crate::domain::ports::executor::TriggerScope;
use crate::domain::ports::store::FieldOp;

use super::FlowEngine;

impl FlowEngine {
    /// Persist a status transition, recording the previous status.
    async fn persist_transition(
        &self,
        id: &SignatureId,
        current: SignatureStatus,
        status: SignatureStatus,
    ) -> FlowResult<()> {
        let mut entries = serde_json::Map::new();
        entries.insert("last_status".to_string(), serde_json::to_value(current)?);
        entries.insert("status".to_string(), serde_json::to_value(status)?);
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

    /// Change a signature's status. Composites broadcast to their children;
    /// batch items forward to their original.
    pub async fn change_status(
        &self,
        signature: &Signature,
        status: SignatureStatus,
    ) -> FlowResult<()> {
        let current = signature.core().task_status.status;
        match signature {
            Signature::Chain(chain) => {
                self.broadcast_status(&chain.tasks, status).await;
                self.persist_transition(signature.id(), current, status).await
            }
            Signature::Swarm(swarm) => {
                self.broadcast_status(&swarm.tasks, status).await;
                self.persist_transition(signature.id(), current, status).await
            }
            Signature::SwarmItem(item) => {
                self.safe_change_status(&item.original_task_id, status).await;
                Ok(())
            }
            _ => self.persist_transition(signature.id(), current, status).await,
        }
    }

    /// Locked, best-effort status change by ID. Returns whether it landed.
    pub async fn safe_change_status(&self, id: &SignatureId, status: SignatureStatus) -> bool {
        let result: FlowResult<()> = async {
            let lock = self.lock_key(id.as_str()).await?;
            let signature = self.load_signature(id).await?;
            let outcome = self.change_status_boxed(signature, status).await;
            lock.release().await?;
            outcome
        }
        .await;
        if let Err(e) = result {
            warn!(signature = %id, error = %e, "status change skipped");
            return false;
        }
        true
    }

    fn change_status_boxed(
        &self,
        signature: Signature,
        status: SignatureStatus,
    ) -> BoxFuture<'_, FlowResult<()>> {
        Box::pin(async move { self.change_status(&signature, status).await })
    }

    async fn broadcast_status(&self, children: &[SignatureId], status: SignatureStatus) {
        join_all(
            children
                .iter()
                .map(|child| self.safe_change_status(child, status)),
        )
        .await;
    }

    /// Soft-pause: flip children (for composites) and then the signature
    /// itself to SUSPENDED. A suspended signature refuses its next start.
    pub async fn suspend(&self, signature: &Signature) -> FlowResult<()> {
        let current = signature.core().task_status.status;
        match signature {
            Signature::Chain(chain) => {
                self.broadcast_suspend(&chain.tasks).await;
                self.persist_transition(signature.id(), current, SignatureStatus::Suspended)
                    .await
            }
            Signature::Swarm(swarm) => {
                self.broadcast_suspend(&swarm.tasks).await;
                self.persist_transition(signature.id(), current, SignatureStatus::Suspended)
                    .await
            }
            Signature::SwarmItem(item) => {
                if let Err(e) = self.suspend_by_id(&item.original_task_id).await {
                    warn!(signature = %item.original_task_id, error = %e, "suspend of original skipped");
                }
                self.persist_transition(signature.id(), current, SignatureStatus::Suspended)
                    .await
            }
            _ => {
                self.persist_transition(signature.id(), current, SignatureStatus::Suspended)
                    .await
            }
        }
    }

    async fn broadcast_suspend(&self, children: &[SignatureId]) {
        let results = join_all(children.iter().map(|child| self.suspend_by_id(child))).await;
        for (child, result) in children.iter().zip(results) {
            if let Err(e) = result {
                warn!(signature = %child, error = %e, "suspend skipped");
            }
        }
    }

    /// Resume from a soft pause.
    ///
    /// Signatures that were ACTIVE when paused go back to PENDING and are
    /// re-triggered with an empty payload (the latest kwargs were merged onto
    /// the signature when the pause landed). Everything else has its previous
    /// status restored.
    pub async fn resume(&self, signature: &Signature) -> FlowResult<()> {
        let status = &signature.core().task_status;
        match signature {
            Signature::Chain(chain) => {
                self.broadcast_resume(&chain.tasks).await;
                self.persist_transition(signature.id(), status.status, status.last_status)
                    .await
            }
            Signature::Swarm(swarm) => {
                self.broadcast_resume(&swarm.tasks).await;
                self.persist_transition(signature.id(), status.status, status.last_status)
                    .await
            }
            Signature::SwarmItem(item) => {
                self.resume_by_id(&item.original_task_id).await?;
                let restored = match self.try_load_signature(&item.original_task_id).await? {
                    Some(original) => original.core().task_status.status,
                    None => status.last_status,
                };
                self.persist_transition(signature.id(), status.status, restored)
                    .await
            }
            _ => {
                if status.last_status == SignatureStatus::Active {
                    self.persist_transition(
                        signature.id(),
                        status.status,
                        SignatureStatus::Pending,
                    )
                    .await?;
                    self.run_no_wait(signature, payload::empty(), &TriggerScope::default())
                        .await
                } else {
                    self.persist_transition(signature.id(), status.status, status.last_status)
                        .await
                }
            }
        }
    }

    async fn broadcast_resume(&self, children: &[SignatureId]) {
        let results = join_all(children.iter().map(|child| self.resume_by_id(child))).await;
        for (child, result) in children.iter().zip(results) {
            if let Err(e) = result {
                warn!(signature = %child, error = %e, "resume skipped");
            }
        }
    }

    /// Hard interruption is reserved: callers get an explicit refusal, never
    /// silent soft semantics.
    pub fn interrupt(&self, _signature: &Signature) -> FlowResult<()> {
        Err(FlowError::Unsupported("interrupt"))
    }

    pub async fn pause(&self, signature: &Signature, kind: PauseKind) -> FlowResult<()> {
        match kind {
            PauseKind::Soft => self.suspend(signature).await,
            PauseKind::Hard => self.interrupt(signature),
        }
    }

    /// Locked suspend by ID.
    pub async fn suspend_by_id(&self, id: &SignatureId) -> FlowResult<()> {
        let lock = self.lock_key(id.as_str()).await?;
        let outcome = match self.load_signature(id).await {
            Ok(signature) => self.suspend_boxed(signature).await,
            Err(e) => Err(e),
        };
        lock.release().await?;
        outcome
    }

    fn suspend_boxed(&self, signature: Signature) -> BoxFuture<'_, FlowResult<()>> {
        Box::pin(async move { self.suspend(&signature).await })
    }

    /// Locked resume by ID.
    pub async fn resume_by_id(&self, id: &SignatureId) -> FlowResult<()> {
        let lock = self.lock_key(id.as_str()).await?;
        let outcome = match self.load_signature(id).await {
            Ok(signature) => self.resume_boxed(signature).await,
            Err(e) => Err(e),
        };
        lock.release().await?;
        outcome
    }

    fn resume_boxed(&self, signature: Signature) -> BoxFuture<'_, FlowResult<()>> {
        Box::pin(async move { self.resume(&signature).await })
    }

    /// Locked pause by ID.
    pub async fn pause_by_id(&self, id: &SignatureId, kind: PauseKind) -> FlowResult<()> {
        match kind {
            PauseKind::Soft => self.suspend_by_id(id).await,
            PauseKind::Hard => Err(FlowError::Unsupported("interrupt")),
        }
    }

    pub async fn interrupt_by_id(&self, _id: &SignatureId) -> FlowResult<()> {
        Err(FlowError::Unsupported("interrupt"))
    }
}
