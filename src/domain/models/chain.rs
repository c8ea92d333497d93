//! Chain signature — a linear pipeline of signatures.

use serde::{Deserialize, Serialize};

use crate::domain::models::signature::{SignatureCore, SignatureId, SignatureKind};

/// A signature whose children run sequentially.
///
/// The chain owns its step signatures: they are deleted together with the
/// chain. The chain itself is never handed to the executor — triggering a
/// chain triggers its first step, and the per-step callback wiring carries
/// execution to the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSignature {
    #[serde(flatten)]
    pub core: SignatureCore,
    /// Step signature IDs in declaration order. Always at least two.
    pub tasks: Vec<SignatureId>,
}

impl ChainSignature {
    pub fn new(task_name: impl Into<String>, tasks: Vec<SignatureId>) -> Self {
        Self {
            core: SignatureCore::new(SignatureKind::Chain, task_name),
            tasks,
        }
    }

    pub fn first_task(&self) -> Option<&SignatureId> {
        self.tasks.first()
    }
}
