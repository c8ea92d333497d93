//! Signature status machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a persisted signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    /// Created, not yet picked up by an executor worker
    Pending,
    /// A worker is executing the task body
    Active,
    /// Soft-paused; the invoker refuses new attempts
    Suspended,
    /// Reserved for hard interruption (not implemented)
    Interrupted,
    /// Canceled; the invoker removes the signature on next touch
    Canceled,
}

impl Default for SignatureStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Interrupted => "interrupted",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "interrupted" => Some(Self::Interrupted),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// How a pause should take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    /// Stop the task before its next start; running bodies finish
    Soft,
    /// Preempt the running body (reserved, unimplemented)
    Hard,
}

/// Embedded status sub-record of a signature.
///
/// `last_status` always holds the status prior to the most recent transition,
/// which is what `resume` restores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub status: SignatureStatus,
    #[serde(default)]
    pub last_status: SignatureStatus,
    /// Execution ID assigned by the executor to the running attempt.
    #[serde(default)]
    pub worker_execution_id: String,
}

impl TaskStatus {
    /// The invoker runs the body only for pending or active signatures.
    pub fn should_run(&self) -> bool {
        matches!(
            self.status,
            SignatureStatus::Pending | SignatureStatus::Active
        )
    }

    pub fn is_canceled(&self) -> bool {
        self.status == SignatureStatus::Canceled
    }

    /// Record a transition, keeping the previous status for `resume`.
    pub fn transition(&mut self, status: SignatureStatus) {
        self.last_status = self.status;
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_run_only_for_pending_and_active() {
        let mut ts = TaskStatus::default();
        assert!(ts.should_run());
        ts.transition(SignatureStatus::Active);
        assert!(ts.should_run());
        ts.transition(SignatureStatus::Suspended);
        assert!(!ts.should_run());
        ts.transition(SignatureStatus::Canceled);
        assert!(!ts.should_run());
    }

    #[test]
    fn transition_keeps_last_status() {
        let mut ts = TaskStatus::default();
        ts.transition(SignatureStatus::Active);
        assert_eq!(ts.last_status, SignatureStatus::Pending);
        ts.transition(SignatureStatus::Suspended);
        assert_eq!(ts.last_status, SignatureStatus::Active);
        assert_eq!(ts.status, SignatureStatus::Suspended);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SignatureStatus::Pending,
            SignatureStatus::Active,
            SignatureStatus::Suspended,
            SignatureStatus::Interrupted,
            SignatureStatus::Canceled,
        ] {
            assert_eq!(SignatureStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SignatureStatus::from_str("cancelled"), Some(SignatureStatus::Canceled));
        assert_eq!(SignatureStatus::from_str("bogus"), None);
    }
}
