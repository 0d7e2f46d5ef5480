//! Structured observability hooks for pipeline lifecycle events.
//!
//! This module provides:
//! - Pipeline-scoped tracing spans via the `PipelineSpan` RAII guard
//! - Emission functions for conductor, artifact, verification and audit events
//!
//! Events are emitted at `info!` level with an `event` field naming the
//! lifecycle kind, mirroring the kinds written to the pipeline event log.

use tracing::{info, warn};

/// RAII guard that enters a pipeline-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = PipelineSpan::enter("p-123");
/// // every event below carries pipeline_id = "p-123"
/// ```
pub struct PipelineSpan {
    _span: tracing::span::EnteredSpan,
}

impl PipelineSpan {
    pub fn enter(pipeline_id: &str) -> Self {
        let span = tracing::info_span!("stagegate.pipeline", pipeline_id = %pipeline_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_initialized(pipeline_id: &str, workspace_ref: &str) {
    info!(event = "pipeline.initialized", pipeline_id = %pipeline_id, workspace_ref = %workspace_ref);
}

pub fn emit_transitioned(pipeline_id: &str, from: &str, to: &str) {
    info!(event = "pipeline.transitioned", pipeline_id = %pipeline_id, from = %from, to = %to);
}

pub fn emit_locked(pipeline_id: &str, stage: &str) {
    info!(event = "pipeline.locked", pipeline_id = %pipeline_id, stage = %stage);
}

pub fn emit_unlocked(pipeline_id: &str, stage: &str) {
    info!(event = "pipeline.unlocked", pipeline_id = %pipeline_id, stage = %stage);
}

/// Emit a human-gate event (`gate.requested`, `gate.approved`, ...).
pub fn emit_gate(kind: &str, pipeline_id: &str, detail: &str) {
    info!(event = %kind, pipeline_id = %pipeline_id, detail = %detail);
}

/// Halts are warnings: something needs a person.
pub fn emit_halted(pipeline_id: &str, reason: &str) {
    warn!(event = "pipeline.halted", pipeline_id = %pipeline_id, reason = %reason);
}

pub fn emit_artifact_approved(pipeline_id: &str, artifact_id: &str, artifact_type: &str, hash: &str) {
    info!(
        event = "artifact.approved",
        pipeline_id = %pipeline_id,
        artifact_id = %artifact_id,
        artifact_type = %artifact_type,
        content_hash = %hash,
    );
}

pub fn emit_verification_recorded(
    pipeline_id: &str,
    attempt: u32,
    passed: bool,
    steps: usize,
    result_hash: &str,
) {
    info!(
        event = "verification.recorded",
        pipeline_id = %pipeline_id,
        attempt = attempt,
        passed = passed,
        steps = steps,
        result_hash = %result_hash,
    );
}

/// A checker returned an error or panicked; the step is recorded as failed.
pub fn emit_check_crashed(check: &str, detail: &str) {
    warn!(event = "verification.check_crashed", check = %check, detail = %detail);
}

pub fn emit_audit_decided(
    pipeline_id: &str,
    decision: &str,
    classification: Option<&str>,
    attempt: u32,
) {
    info!(
        event = "audit.decided",
        pipeline_id = %pipeline_id,
        decision = %decision,
        classification = classification.unwrap_or("none"),
        attempt = attempt,
    );
}

/// No classification rule matched; handled as repairable.
pub fn emit_unclassified_failure(pipeline_id: &str, first_line: &str) {
    warn!(event = "audit.unclassified", pipeline_id = %pipeline_id, diagnostic = %first_line);
}

pub fn emit_precondition_failed(pipeline_id: &str, check: &str) {
    warn!(event = "precondition.failed", pipeline_id = %pipeline_id, check = %check);
}

pub fn emit_repair_round(pipeline_id: &str, attempt: u32, decision: &str) {
    info!(event = "repair.round", pipeline_id = %pipeline_id, attempt = attempt, decision = %decision);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_span_create() {
        let _span = PipelineSpan::enter("test-pipeline");
        emit_transitioned("test-pipeline", "initialized", "documenting");
    }
}
