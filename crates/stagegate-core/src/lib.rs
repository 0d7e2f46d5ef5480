//! Stagegate Core Library
//!
//! Gated, hash-locked, auditable multi-stage build pipelines: the conductor
//! state machine, provenance hashing and the artifact registry, the
//! verification pipeline with its bounded repair loop, the completion
//! auditor and the downstream precondition validator.

pub mod artifacts;
pub mod auditor;
pub mod checks;
pub mod classification;
pub mod conductor;
pub mod config;
pub mod digest;
pub mod error;
pub mod fsm;
pub mod obs;
pub mod preconditions;
pub mod provenance;
pub mod repair;
pub mod telemetry;
pub mod verification;
pub mod workspace;

use std::sync::Arc;

use stagegate_state::GateStore;

pub use artifacts::ArtifactRegistry;
pub use auditor::{decide, AuditInput, CompletionAuditor, Verdict};
pub use checks::{CommandCheck, DanglingReferenceCheck, DuplicateIdentifierCheck, ForbiddenPathCheck};
pub use classification::{Classification, ClassificationRules, RuleSet};
pub use conductor::{Conductor, StageLock, StateSnapshot};
pub use config::{CommandSpec, GateConfig};
pub use digest::{canonical_json, compute_digest};
pub use error::{
    GateError, IntegrityViolation, PreconditionCheck, PreconditionFailure, Result, StateViolation,
};
pub use obs::PipelineSpan;
pub use preconditions::PreconditionValidator;
pub use provenance::{required_upstream, CanonicalSchema, ProvenanceHasher};
pub use repair::{RepairLog, RepairLoop, RepairRound, Repairer};
pub use telemetry::init_tracing;
pub use verification::{Check, CheckOutcome, VerificationPipeline, WorkspaceView};
pub use workspace::{FsWorkspace, MemoryWorkspace, Workspace};

/// Stagegate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every component wired to one store and one configuration.
pub struct Stagegate {
    pub conductor: Conductor,
    pub registry: ArtifactRegistry,
    pub verification: VerificationPipeline,
    pub auditor: CompletionAuditor,
    pub preconditions: PreconditionValidator,
}

impl Stagegate {
    /// Preconditions check workspaces under `config.workspace_root`.
    pub fn new<S: GateStore + 'static>(store: Arc<S>, config: &GateConfig) -> Result<Self> {
        let workspaces: Arc<dyn Workspace> = Arc::new(FsWorkspace::new(&config.workspace_root));
        Self::with_workspace(store, config, workspaces)
    }

    pub fn with_workspace<S: GateStore + 'static>(
        store: Arc<S>,
        config: &GateConfig,
        workspaces: Arc<dyn Workspace>,
    ) -> Result<Self> {
        let conductor =
            Conductor::new(store.clone(), store.clone()).with_repair_budget(config.repair_budget);
        let registry = ArtifactRegistry::new(store.clone(), store.clone(), conductor.clone());
        let verification = VerificationPipeline::new(store.clone(), store.clone())
            .with_checks(config.builtin_checks()?);
        let auditor =
            CompletionAuditor::new(store.clone(), store.clone(), store.clone(), store.clone())
                .with_rules(config.classification_rules()?);
        let preconditions = PreconditionValidator::new(
            store.clone(),
            store.clone(),
            store,
            workspaces,
            conductor.clone(),
        );

        Ok(Self {
            conductor,
            registry,
            verification,
            auditor,
            preconditions,
        })
    }

    pub fn repair_loop(&self, repairer: Arc<dyn Repairer>) -> RepairLoop<'_> {
        RepairLoop::new(&self.verification, &self.auditor, &self.conductor, repairer)
    }
}
