//! Precondition validator for operations gated on a completed pipeline.
//!
//! Checks run in a fixed order and stop at the first failure. The validator
//! never retries and never runs the gated operation itself. A manifest whose
//! hash no longer matches halts the pipeline.

use std::sync::Arc;

use stagegate_state::{
    Artifact, ArtifactStore, ArtifactType, DecisionStore, DecisionType, PipelineId, PipelineReader,
};

use crate::conductor::Conductor;
use crate::error::{GateError, IntegrityViolation, PreconditionCheck, PreconditionFailure, Result};
use crate::obs;
use crate::provenance::ProvenanceHasher;
use crate::workspace::Workspace;

fn fail(check: PreconditionCheck, diagnostics: Vec<String>) -> PreconditionFailure {
    PreconditionFailure { check, diagnostics }
}

pub struct PreconditionValidator {
    pipelines: Arc<dyn PipelineReader>,
    decisions: Arc<dyn DecisionStore>,
    artifacts: Arc<dyn ArtifactStore>,
    workspace: Arc<dyn Workspace>,
    conductor: Conductor,
    hasher: ProvenanceHasher,
}

impl PreconditionValidator {
    /// `conductor` is only used to halt a pipeline on an integrity violation.
    pub fn new(
        pipelines: Arc<dyn PipelineReader>,
        decisions: Arc<dyn DecisionStore>,
        artifacts: Arc<dyn ArtifactStore>,
        workspace: Arc<dyn Workspace>,
        conductor: Conductor,
    ) -> Self {
        Self {
            pipelines,
            decisions,
            artifacts,
            workspace,
            conductor,
            hasher: ProvenanceHasher::default(),
        }
    }

    pub fn with_hasher(mut self, hasher: ProvenanceHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Validate every precondition in order.
    pub async fn validate(&self, pipeline_id: &PipelineId) -> Result<()> {
        match self.run(pipeline_id).await? {
            Ok(()) => Ok(()),
            Err(failure) => {
                obs::emit_precondition_failed(pipeline_id.as_str(), failure.check.as_str());
                Err(GateError::PreconditionFailure(failure))
            }
        }
    }

    /// Storage errors surface as the outer error; a failed check as the
    /// inner one.
    async fn run(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<std::result::Result<(), PreconditionFailure>> {
        let Some(state) = self.pipelines.get_pipeline(pipeline_id).await? else {
            return Ok(Err(fail(
                PreconditionCheck::PipelineExists,
                vec![format!("Pipeline {pipeline_id} does not exist")],
            )));
        };

        let decision = self.decisions.latest_decision(pipeline_id).await?;
        match decision.as_ref().map(|d| d.decision_type) {
            Some(DecisionType::MarkCompleted) => {}
            Some(other) => {
                return Ok(Err(fail(
                    PreconditionCheck::CompletionDecision,
                    vec![format!(
                        "Latest completion decision is {other}, expected mark_completed"
                    )],
                )))
            }
            None => {
                return Ok(Err(fail(
                    PreconditionCheck::CompletionDecision,
                    vec!["No completion decision recorded".to_string()],
                )))
            }
        }

        let Some(manifest) = self.latest_manifest(pipeline_id).await? else {
            return Ok(Err(fail(
                PreconditionCheck::ManifestExists,
                vec![format!("No manifest artifact for pipeline {pipeline_id}")],
            )));
        };

        if let Some(diagnostics) = self.hash_lock_problems(pipeline_id, &manifest).await? {
            return Ok(Err(fail(PreconditionCheck::ManifestHashLocked, diagnostics)));
        }

        if !self.workspace.exists(&state.workspace_ref) {
            return Ok(Err(fail(
                PreconditionCheck::WorkspaceExists,
                vec![format!("Workspace '{}' does not exist", state.workspace_ref)],
            )));
        }

        if let Some(holder) = state.lock.holder() {
            return Ok(Err(fail(
                PreconditionCheck::PipelineUnlocked,
                vec![format!("Pipeline is locked by stage '{holder}'")],
            )));
        }

        Ok(Ok(()))
    }

    async fn latest_manifest(&self, pipeline_id: &PipelineId) -> Result<Option<Artifact>> {
        Ok(self
            .artifacts
            .list_artifacts(pipeline_id, Some(ArtifactType::Manifest))
            .await?
            .into_iter()
            .max_by_key(|a| a.version))
    }

    async fn hash_lock_problems(
        &self,
        pipeline_id: &PipelineId,
        manifest: &Artifact,
    ) -> Result<Option<Vec<String>>> {
        let mut diagnostics = Vec::new();
        if manifest.content_hash.is_none() {
            diagnostics.push(format!("Manifest {} has no content hash", manifest.artifact_id));
        }
        if !manifest.is_approved() {
            diagnostics.push(format!("Manifest {} is not approved", manifest.artifact_id));
        }
        if diagnostics.is_empty() {
            if let Err(err) = self.hasher.verify(manifest) {
                if let Some(violation @ IntegrityViolation::HashMismatch { .. }) =
                    err.integrity_violation()
                {
                    self.conductor
                        .halt(pipeline_id, &format!("integrity violation: {violation}"))
                        .await?;
                }
                diagnostics.push(err.to_string());
            }
        }
        Ok((!diagnostics.is_empty()).then_some(diagnostics))
    }
}
