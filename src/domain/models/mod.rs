//! Domain models for the mageflow orchestration core.

pub mod chain;
pub mod payload;
pub mod registration;
pub mod root;
pub mod signature;
pub mod status;
pub mod swarm;

pub use chain::ChainSignature;
pub use payload::{deep_merge, merge_maps, JsonMap};
pub use registration::{InputSchema, TaskRegistration};
pub use root::RootSignature;
pub use signature::{Signature, SignatureCore, SignatureId, SignatureKind, SignatureRef, TaskSignature};
pub use status::{PauseKind, SignatureStatus, TaskStatus};
pub use swarm::{BatchItemSignature, SwarmConfig, SwarmSignature, BATCH_TASK_NAME_PREFIX};
