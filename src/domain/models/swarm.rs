//! Swarm signatures — bounded-concurrency parallel execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::signature::{SignatureCore, SignatureId, SignatureKind};

/// Swarm behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Upper bound on concurrently running originals. `0` means nothing is
    /// started automatically; the backlog is preserved for external draining.
    #[serde(default = "SwarmConfig::default_max_concurrency")]
    pub max_concurrency: usize,
    /// Cancel the swarm once this many items failed. `None` and `Some(0)`
    /// both mean no threshold.
    #[serde(default)]
    pub stop_after_n_failures: Option<usize>,
    /// Cap on swarm membership enforced by `add_task`.
    #[serde(default)]
    pub max_tasks_allowed: Option<usize>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_concurrency: Self::default_max_concurrency(),
            stop_after_n_failures: None,
            max_tasks_allowed: None,
        }
    }
}

impl SwarmConfig {
    fn default_max_concurrency() -> usize {
        30
    }

    /// Failure threshold with the degenerate zero normalized away.
    pub fn effective_failure_threshold(&self) -> Option<usize> {
        self.stop_after_n_failures.filter(|n| *n > 0)
    }
}

/// A signature whose children run in parallel under a concurrency cap.
///
/// Children are wrapped in [`BatchItemSignature`]s; the swarm owns the
/// wrappers and, transitively, the originals they point at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmSignature {
    #[serde(flatten)]
    pub core: SignatureCore,
    /// Batch-item wrapper IDs, in membership order.
    #[serde(default)]
    pub tasks: Vec<SignatureId>,
    /// FIFO backlog of batch items waiting for a concurrency slot.
    #[serde(default)]
    pub tasks_left_to_run: Vec<SignatureId>,
    #[serde(default)]
    pub finished_tasks: Vec<SignatureId>,
    #[serde(default)]
    pub failed_tasks: Vec<SignatureId>,
    /// Successful outputs in completion order. Not positionally aligned with
    /// `tasks`.
    #[serde(default)]
    pub tasks_results: Vec<Value>,
    /// Once closed, membership is frozen.
    #[serde(default)]
    pub is_swarm_closed: bool,
    /// Set by the start task after it partitioned `tasks`; later additions
    /// must kick themselves off instead of waiting for the partition.
    #[serde(default)]
    pub is_swarm_started: bool,
    /// Concurrency counter, mutated only through atomic store ops.
    #[serde(default)]
    pub current_running_tasks: i64,
    /// One-shot guard for the done transition; claimed under the swarm lock
    /// before success callbacks fire.
    #[serde(default)]
    pub completion_claimed: bool,
    #[serde(default)]
    pub config: SwarmConfig,
}

impl SwarmSignature {
    pub fn new(task_name: impl Into<String>, config: SwarmConfig) -> Self {
        Self {
            core: SignatureCore::new(SignatureKind::Swarm, task_name),
            tasks: Vec::new(),
            tasks_left_to_run: Vec::new(),
            finished_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            tasks_results: Vec::new(),
            is_swarm_closed: false,
            is_swarm_started: false,
            current_running_tasks: 0,
            completion_claimed: false,
            config,
        }
    }

    /// A swarm has started once any item ran or finished.
    pub fn has_started(&self) -> bool {
        self.current_running_tasks > 0
            || !self.finished_tasks.is_empty()
            || !self.failed_tasks.is_empty()
    }

    pub fn can_add_task(&self) -> bool {
        match self.config.max_tasks_allowed {
            Some(cap) => self.tasks.len() < cap,
            None => true,
        }
    }

    /// Done iff closed and every member settled (W4).
    pub fn is_done(&self) -> bool {
        if !self.is_swarm_closed {
            return false;
        }
        let settled: std::collections::HashSet<&SignatureId> = self
            .finished_tasks
            .iter()
            .chain(self.failed_tasks.iter())
            .collect();
        self.tasks.iter().all(|id| settled.contains(id))
    }

    /// Open capacity under the concurrency cap.
    pub fn free_slots(&self) -> usize {
        let running = usize::try_from(self.current_running_tasks).unwrap_or(0);
        self.config.max_concurrency.saturating_sub(running)
    }
}

/// Thin swarm-owned wrapper around an original signature.
///
/// The wrapper receives the success/error callbacks the swarm wires in and
/// bridges them back to swarm bookkeeping; the original stays untouched for
/// the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemSignature {
    #[serde(flatten)]
    pub core: SignatureCore,
    pub swarm_id: SignatureId,
    pub original_task_id: SignatureId,
}

impl BatchItemSignature {
    pub fn new(
        task_name: impl Into<String>,
        swarm_id: SignatureId,
        original_task_id: SignatureId,
    ) -> Self {
        Self {
            core: SignatureCore::new(SignatureKind::SwarmItem, task_name),
            swarm_id,
            original_task_id,
        }
    }
}

/// Batch-item task names carry this prefix plus the original task name.
pub const BATCH_TASK_NAME_PREFIX: &str = "batch-task-";
