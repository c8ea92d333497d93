//! Root engine: the implicit swarm around a wrapping task's body.

use tracing::{debug, warn};

use crate::domain::errors::FlowResult;
use crate::domain::models::root::RootSignature;
use crate::domain::models::signature::{Signature, SignatureId};
use crate::domain::models::swarm::SwarmSignature;
use crate::domain::ports::store::FieldOp;
use serde_json::Value;

use super::FlowEngine;

impl FlowEngine {
    /// Root start hook: create the implicit swarm and transplant the root's
    /// callbacks onto it, so they fire only after every child settled.
    pub(crate) async fn root_start(&self, root: &RootSignature) -> FlowResult<SignatureId> {
        let mut swarm = SwarmSignature::new(
            format!("root-swarm:{}", root.core.task_name),
            root.swarm_config.clone(),
        );
        swarm.core.success_callbacks = root.core.success_callbacks.clone();
        swarm.core.error_callbacks = root.core.error_callbacks.clone();
        let swarm_id = swarm.core.id.clone();
        self.save_signature(&Signature::Swarm(swarm)).await?;

        self.store
            .apply(
                root.core.id.as_str(),
                vec![
                    FieldOp::Set {
                        path: "swarm_id".to_string(),
                        value: Value::String(swarm_id.as_str().to_string()),
                    },
                    FieldOp::Set {
                        path: "success_callbacks".to_string(),
                        value: Value::Array(Vec::new()),
                    },
                    FieldOp::Set {
                        path: "error_callbacks".to_string(),
                        value: Value::Array(Vec::new()),
                    },
                ],
            )
            .await?;
        debug!(root = %root.core.id, swarm = %swarm_id, "root swarm created");
        Ok(swarm_id)
    }

    /// Root end hook: close the swarm so completion can fire. A failed body
    /// suspends the swarm and lifts its error callbacks back onto the root,
    /// so the invoker's error path reports the failure.
    ///
    /// The swarm is read once, before the close: closing can complete the
    /// swarm and delete its record, and the failure path must still see the
    /// callbacks it carried.
    pub(crate) async fn root_end(&self, root: &RootSignature, success: bool) -> FlowResult<()> {
        let Some(swarm_id) = &root.swarm_id else {
            warn!(root = %root.core.id, "root ended without a swarm");
            return Ok(());
        };

        let swarm = match self.try_load_signature(swarm_id).await? {
            Some(Signature::Swarm(swarm)) => Some(swarm),
            _ => None,
        };
        if swarm.is_some() {
            self.close_swarm(swarm_id).await?;
        }

        if !success {
            if let Some(swarm) = swarm {
                let signature = Signature::Swarm(swarm.clone());
                if let Err(e) = self.suspend(&signature).await {
                    // Gone already: the close completed it.
                    warn!(swarm = %swarm.core.id, error = %e, "suspend of root swarm skipped");
                }
                self.store
                    .apply(
                        root.core.id.as_str(),
                        vec![FieldOp::Set {
                            path: "error_callbacks".to_string(),
                            value: serde_json::to_value(&swarm.core.error_callbacks)?,
                        }],
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
