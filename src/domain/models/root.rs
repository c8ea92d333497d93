//! Root signature — a wrapping task with an implicit swarm.

use serde::{Deserialize, Serialize};

use crate::domain::models::signature::{SignatureCore, SignatureId, SignatureKind};
use crate::domain::models::swarm::SwarmConfig;

/// A signature whose body's child triggers are funneled into an owned swarm.
///
/// The swarm is created when the root starts and closed when the body
/// returns; the root's own callbacks are transplanted onto the swarm so they
/// fire only after every child settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootSignature {
    #[serde(flatten)]
    pub core: SignatureCore,
    /// The owned swarm, set on start.
    #[serde(default)]
    pub swarm_id: Option<SignatureId>,
    #[serde(default)]
    pub swarm_config: SwarmConfig,
}

impl RootSignature {
    pub fn new(task_name: impl Into<String>, swarm_config: SwarmConfig) -> Self {
        Self {
            core: SignatureCore::new(SignatureKind::Root, task_name),
            swarm_id: None,
            swarm_config,
        }
    }
}
