//! Stagegate-State: persistence layer for the Stagegate pipeline.
//!
//! Holds every durable record the conductor, verification pipeline and
//! auditor read or write, together with the repository traits they program
//! against.
//!
//! ## Key Components
//!
//! - `records`: pipeline state, artifacts, verification results, decisions, events
//! - `storage_traits`: backend-agnostic async repositories plus `ContentDigest`
//! - `SurrealGateStore`: SurrealDB implementation (`mem://`, `surrealkv://`, ...)
//! - `fakes::MemoryGateStore`: dependency-free implementation for tests

mod error;
pub mod fakes;
pub mod migrations;
pub mod records;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use records::{
    ApprovalStatus, Artifact, ArtifactType, CompletionDecision, DecisionType,
    ExecutionProgress, FailureClassification, HumanGate, LockToken, PipelineEvent, PipelineId,
    PipelineState, PipelineStatus, RepairCounter, StepStatus, VerificationResult,
    VerificationStep,
};
pub use storage_traits::{
    ArtifactStore, ContentDigest, DecisionStore, EventLog, GateStore, PipelineReader,
    PipelineStore, StorageResult, VerificationStore,
};
pub use surreal_store::SurrealGateStore;

/// Result type for stagegate-state operations
pub type Result<T> = std::result::Result<T, StateError>;
