//! Error taxonomy for the Stagegate core.
//!
//! Verification failures are not errors: they are classified and turned
//! into completion decisions. Errors here mean an operation was refused or
//! could not run.

use stagegate_state::{PipelineStatus, StorageError};

/// A requested operation does not fit the pipeline's current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateViolation {
    #[error("pipeline not found: {pipeline_id}")]
    NotFound { pipeline_id: String },

    #[error("pipeline already initialized: {pipeline_id}")]
    AlreadyInitialized { pipeline_id: String },

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: PipelineStatus,
        to: PipelineStatus,
    },

    #[error("pipeline is locked by stage '{holder}'")]
    Locked { holder: String },

    #[error("pipeline is not locked")]
    NotLocked,

    #[error("pipeline is awaiting a human ({gate}: {reason})")]
    AwaitingHuman { gate: String, reason: String },

    #[error("no human decision is pending")]
    GateNotPending,

    #[error("pipeline in status {status} cannot be audited")]
    NotAuditable { status: PipelineStatus },

    #[error("no verification result recorded")]
    NoVerificationResult,

    #[error("latest verification is for attempt {result_attempt}, pipeline is on attempt {current_attempt}")]
    StaleVerification {
        result_attempt: u32,
        current_attempt: u32,
    },

    #[error("latest verification is for unit {result_unit:?}, pipeline is on unit {current_unit:?}")]
    VerificationUnitMismatch {
        result_unit: Option<String>,
        current_unit: Option<String>,
    },

    #[error("verification result {result_id} was already decided by {decision_id}")]
    VerificationConsumed {
        result_id: String,
        decision_id: String,
    },

    #[error("decision {decision_id} does not apply to the current state: {detail}")]
    StaleDecision { decision_id: String, detail: String },

    #[error("pipeline was modified concurrently, reload and retry")]
    ConcurrentModification,

    #[error("stage lock is no longer held")]
    StaleLock,

    #[error("pipeline is in terminal status {status}")]
    Terminal { status: PipelineStatus },

    #[error("execution units cannot be replanned after {completed} completed")]
    PlanLocked { completed: usize },
}

/// Tamper-evidence and hash-lock failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("hash mismatch on artifact {artifact_id}: expected {expected}, got {actual}")]
    HashMismatch {
        artifact_id: String,
        expected: String,
        actual: String,
    },

    #[error("artifact {artifact_id} is approved and hash-locked")]
    LockedArtifact { artifact_id: String },

    #[error("artifact {artifact_id} has no content hash")]
    MissingHash { artifact_id: String },

    #[error("upstream {hash} is not an approved artifact of this pipeline")]
    UnapprovedUpstream { hash: String },

    #[error("upstream {hash} is a {found} artifact, not an input of {artifact_type}")]
    ForeignUpstream {
        hash: String,
        found: String,
        artifact_type: String,
    },

    #[error("{artifact_type} requires an approved {required} upstream")]
    MissingUpstream {
        artifact_type: String,
        required: String,
    },
}

/// Named checks of the downstream precondition validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionCheck {
    PipelineExists,
    CompletionDecision,
    ManifestExists,
    ManifestHashLocked,
    WorkspaceExists,
    PipelineUnlocked,
}

impl PreconditionCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreconditionCheck::PipelineExists => "pipeline_exists",
            PreconditionCheck::CompletionDecision => "completion_decision",
            PreconditionCheck::ManifestExists => "manifest_exists",
            PreconditionCheck::ManifestHashLocked => "manifest_hash_locked",
            PreconditionCheck::WorkspaceExists => "workspace_exists",
            PreconditionCheck::PipelineUnlocked => "pipeline_unlocked",
        }
    }
}

impl std::fmt::Display for PreconditionCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First failing precondition, with the lines that explain it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("precondition '{check}' failed: {}", diagnostics.join("; "))]
pub struct PreconditionFailure {
    pub check: PreconditionCheck,
    pub diagnostics: Vec<String>,
}

/// Stagegate core errors.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("state violation: {0}")]
    StateViolation(#[from] StateViolation),

    #[error("{0}")]
    PreconditionFailure(#[from] PreconditionFailure),

    #[error("integrity violation: {0}")]
    IntegrityViolation(#[from] IntegrityViolation),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage outcomes that carry state meaning are lifted into the taxonomy;
/// the rest stay backend errors.
impl From<StorageError> for GateError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::PipelineNotFound { pipeline_id } => {
                StateViolation::NotFound { pipeline_id }.into()
            }
            StorageError::PipelineExists { pipeline_id } => {
                StateViolation::AlreadyInitialized { pipeline_id }.into()
            }
            StorageError::VersionConflict { .. } => StateViolation::ConcurrentModification.into(),
            StorageError::ImmutableRecord { id } => {
                IntegrityViolation::LockedArtifact { artifact_id: id }.into()
            }
            other => GateError::Storage(other),
        }
    }
}

impl GateError {
    pub fn state_violation(&self) -> Option<&StateViolation> {
        match self {
            GateError::StateViolation(v) => Some(v),
            _ => None,
        }
    }

    pub fn integrity_violation(&self) -> Option<&IntegrityViolation> {
        match self {
            GateError::IntegrityViolation(v) => Some(v),
            _ => None,
        }
    }
}

/// Result type for Stagegate core operations.
pub type Result<T> = std::result::Result<T, GateError>;
