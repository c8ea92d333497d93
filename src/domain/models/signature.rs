//! The persisted signature — the unit of durable task orchestration.
//!
//! A signature captures one logical task invocation: its kwargs, callback
//! wiring and lifecycle status. Composite engines (chain, swarm, root) are
//! themselves signatures, so the whole callback graph is stored as signature
//! records referencing each other by ID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{FlowError, FlowResult};
use crate::domain::models::chain::ChainSignature;
use crate::domain::models::payload::JsonMap;
use crate::domain::models::registration::InputSchema;
use crate::domain::models::root::RootSignature;
use crate::domain::models::status::TaskStatus;
use crate::domain::models::swarm::{BatchItemSignature, SwarmSignature};

/// Concrete signature subtype, persisted both as the key prefix and the
/// record's `kind` tag so the loader can dispatch without a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureKind {
    Task,
    Chain,
    Swarm,
    SwarmItem,
    Root,
}

impl SignatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Chain => "chain",
            Self::Swarm => "swarm",
            Self::SwarmItem => "swarm-item",
            Self::Root => "root",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "chain" => Some(Self::Chain),
            "swarm" => Some(Self::Swarm),
            "swarm-item" => Some(Self::SwarmItem),
            "root" => Some(Self::Root),
            _ => None,
        }
    }
}

/// Opaque signature key of the form `<kind>:<uid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureId(String);

impl SignatureId {
    pub fn generate(kind: SignatureKind) -> Self {
        Self(format!("{}:{}", kind.as_str(), Uuid::new_v4()))
    }

    /// Parse the subtype tag embedded in the key.
    pub fn kind(&self) -> FlowResult<SignatureKind> {
        let (prefix, _) = self
            .0
            .split_once(':')
            .ok_or_else(|| FlowError::InvalidId(self.0.clone()))?;
        SignatureKind::from_str(prefix).ok_or_else(|| FlowError::InvalidId(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SignatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SignatureId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SignatureId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Fields shared by every signature subtype.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureCore {
    pub id: SignatureId,
    /// Logical task name, resolvable through the task registry.
    pub task_name: String,
    /// Input overrides merged into every invocation.
    #[serde(default)]
    pub kwargs: JsonMap,
    pub created_at: DateTime<Utc>,
    /// Schema annotation of the input payload, if any.
    #[serde(default)]
    pub input_schema: Option<InputSchema>,
    /// One-shot callbacks triggered on success, in order.
    #[serde(default)]
    pub success_callbacks: Vec<SignatureId>,
    /// One-shot callbacks triggered on failure, in order.
    #[serde(default)]
    pub error_callbacks: Vec<SignatureId>,
    #[serde(default)]
    pub task_status: TaskStatus,
    /// Contextual IDs piggybacked through the executor as out-of-band
    /// metadata, used by the invoker and the composite handlers to find
    /// their records.
    #[serde(default)]
    pub task_identifiers: JsonMap,
}

impl SignatureCore {
    pub fn new(kind: SignatureKind, task_name: impl Into<String>) -> Self {
        Self {
            id: SignatureId::generate(kind),
            task_name: task_name.into(),
            kwargs: JsonMap::new(),
            created_at: Utc::now(),
            input_schema: None,
            success_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
            task_status: TaskStatus::default(),
            task_identifiers: JsonMap::new(),
        }
    }

    /// The field a success-callback trigger nests the upstream result under:
    /// the schema's designated field, or `results` when no schema names one.
    pub fn return_value_field(&self) -> String {
        self.input_schema
            .as_ref()
            .map_or_else(|| "results".to_string(), |s| s.return_field().to_string())
    }
}

/// Plain single-task signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSignature {
    #[serde(flatten)]
    pub core: SignatureCore,
}

impl TaskSignature {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            core: SignatureCore::new(SignatureKind::Task, task_name),
        }
    }
}

/// Polymorphic signature record.
///
/// Serialized internally tagged; the tag matches the key prefix so
/// deserialization and key routing always agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Signature {
    Task(TaskSignature),
    Chain(ChainSignature),
    Swarm(SwarmSignature),
    SwarmItem(BatchItemSignature),
    Root(RootSignature),
}

impl Signature {
    pub fn kind(&self) -> SignatureKind {
        match self {
            Self::Task(_) => SignatureKind::Task,
            Self::Chain(_) => SignatureKind::Chain,
            Self::Swarm(_) => SignatureKind::Swarm,
            Self::SwarmItem(_) => SignatureKind::SwarmItem,
            Self::Root(_) => SignatureKind::Root,
        }
    }

    pub fn core(&self) -> &SignatureCore {
        match self {
            Self::Task(s) => &s.core,
            Self::Chain(s) => &s.core,
            Self::Swarm(s) => &s.core,
            Self::SwarmItem(s) => &s.core,
            Self::Root(s) => &s.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut SignatureCore {
        match self {
            Self::Task(s) => &mut s.core,
            Self::Chain(s) => &mut s.core,
            Self::Swarm(s) => &mut s.core,
            Self::SwarmItem(s) => &mut s.core,
            Self::Root(s) => &mut s.core,
        }
    }

    pub fn id(&self) -> &SignatureId {
        &self.core().id
    }

    pub fn task_name(&self) -> &str {
        &self.core().task_name
    }

    pub fn should_run(&self) -> bool {
        self.core().task_status.should_run()
    }

    /// Clone under a fresh ID of the same kind.
    pub fn duplicated(&self) -> Self {
        let mut copy = self.clone();
        copy.core_mut().id = SignatureId::generate(self.kind());
        copy
    }

    pub fn as_swarm(&self) -> Option<&SwarmSignature> {
        match self {
            Self::Swarm(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_swarm_mut(&mut self) -> Option<&mut SwarmSignature> {
        match self {
            Self::Swarm(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_chain(&self) -> Option<&ChainSignature> {
        match self {
            Self::Chain(s) => Some(s),
            _ => None,
        }
    }
}

/// Something resolvable into a saved signature: an existing key, or a logical
/// task name a fresh signature is created for.
#[derive(Debug, Clone)]
pub enum SignatureRef {
    Id(SignatureId),
    Task(String),
}

impl From<SignatureId> for SignatureRef {
    fn from(id: SignatureId) -> Self {
        Self::Id(id)
    }
}

impl From<&SignatureId> for SignatureRef {
    fn from(id: &SignatureId) -> Self {
        Self::Id(id.clone())
    }
}

impl From<&Signature> for SignatureRef {
    fn from(sig: &Signature) -> Self {
        Self::Id(sig.id().clone())
    }
}

impl From<&str> for SignatureRef {
    fn from(task_name: &str) -> Self {
        Self::Task(task_name.to_string())
    }
}

impl From<String> for SignatureRef {
    fn from(task_name: String) -> Self {
        Self::Task(task_name)
    }
}
