//! Storage trait definitions for Stagegate
//!
//! These traits define the repository abstractions the core consumes:
//! - `PipelineReader` / `PipelineStore`: pipeline state with compare-and-swap writes
//! - `ArtifactStore`: artifacts, frozen once approved
//! - `VerificationStore`: immutable verification results
//! - `DecisionStore`: immutable completion decisions
//! - `EventLog`: append-only lifecycle events
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::records::{
    Artifact, ArtifactType, CompletionDecision, PipelineEvent, PipelineId, PipelineState,
    VerificationResult,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 lowercase hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::str::FromStr for ContentDigest {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ContentDigest::try_from(s.to_string())
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Read-only access to pipeline state.
#[async_trait]
pub trait PipelineReader: Send + Sync {
    /// Fetch the current state, `None` if the pipeline was never initialized.
    async fn get_pipeline(&self, pipeline_id: &PipelineId) -> StorageResult<Option<PipelineState>>;

    /// List all pipelines, ordered by id.
    async fn list_pipelines(&self) -> StorageResult<Vec<PipelineState>>;
}

/// Pipeline state persistence.
///
/// Guarantees:
/// - `create_pipeline` fails with `PipelineExists` if the id is taken.
/// - `compare_and_swap` writes only if the stored `version` equals
///   `expected_version`; otherwise nothing is written and `VersionConflict`
///   is returned. This is the single-writer primitive per pipeline.
#[async_trait]
pub trait PipelineStore: PipelineReader {
    async fn create_pipeline(&self, state: &PipelineState) -> StorageResult<()>;

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &PipelineState,
    ) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Artifact persistence.
///
/// Guarantees:
/// - `replace_draft` and `approve_artifact` only touch drafts; an approved
///   artifact is immutable and both return `ImmutableRecord` for it.
/// - `approve_artifact` sets approval, hash and timestamp in one write.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn insert_artifact(&self, artifact: &Artifact) -> StorageResult<()>;

    async fn get_artifact(&self, artifact_id: &str) -> StorageResult<Option<Artifact>>;

    async fn replace_draft(&self, artifact: &Artifact) -> StorageResult<()>;

    async fn approve_artifact(
        &self,
        artifact_id: &str,
        content_hash: &ContentDigest,
        approved_at: DateTime<Utc>,
    ) -> StorageResult<Artifact>;

    /// Artifacts of a pipeline, optionally filtered by type, oldest first.
    async fn list_artifacts(
        &self,
        pipeline_id: &PipelineId,
        artifact_type: Option<ArtifactType>,
    ) -> StorageResult<Vec<Artifact>>;

    /// Find an artifact of the pipeline by its content hash.
    async fn find_by_hash(
        &self,
        pipeline_id: &PipelineId,
        content_hash: &ContentDigest,
    ) -> StorageResult<Option<Artifact>>;
}

// ---------------------------------------------------------------------------
// Verification results & decisions
// ---------------------------------------------------------------------------

/// Immutable verification results.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Record a result. Fails with `Duplicate` if the id already exists.
    async fn record_result(&self, result: &VerificationResult) -> StorageResult<()>;

    /// Most recently recorded result for the pipeline.
    async fn latest_result(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Option<VerificationResult>>;

    /// All results in recording order.
    async fn list_results(&self, pipeline_id: &PipelineId)
        -> StorageResult<Vec<VerificationResult>>;
}

/// Immutable completion decisions.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Record a decision. Fails with `Duplicate` if the id already exists.
    async fn record_decision(&self, decision: &CompletionDecision) -> StorageResult<()>;

    async fn latest_decision(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Option<CompletionDecision>>;

    async fn list_decisions(&self, pipeline_id: &PipelineId)
        -> StorageResult<Vec<CompletionDecision>>;
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Append-only lifecycle event log.
///
/// Guarantees:
/// - `append_event` assigns the next monotonic `seq` for the pipeline.
/// - `events` returns entries ordered by `seq`.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append_event(
        &self,
        pipeline_id: &PipelineId,
        kind: &str,
        payload: serde_json::Value,
    ) -> StorageResult<PipelineEvent>;

    async fn events(&self, pipeline_id: &PipelineId) -> StorageResult<Vec<PipelineEvent>>;
}

/// Every repository in one backend.
pub trait GateStore:
    PipelineStore + ArtifactStore + VerificationStore + DecisionStore + EventLog
{
}

impl<T> GateStore for T where
    T: PipelineStore + ArtifactStore + VerificationStore + DecisionStore + EventLog
{
}
