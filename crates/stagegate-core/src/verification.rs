//! Verification pipeline: run pluggable checks against a workspace and
//! record one immutable, hashed result per attempt.
//!
//! A check that errors or panics becomes a failed step carrying a synthetic
//! diagnostic; a verification run always ends with a result.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use stagegate_state::{
    EventLog, PipelineId, StepStatus, VerificationResult, VerificationStep, VerificationStore,
};
use uuid::Uuid;

use crate::error::Result;
use crate::obs;
use crate::provenance::ProvenanceHasher;
use crate::workspace::Workspace;

/// What a check sees: the workspace plus the attempt it is verifying.
pub struct WorkspaceView<'a> {
    pub pipeline_id: &'a PipelineId,
    pub attempt: u32,
    workspace: &'a dyn Workspace,
}

impl<'a> WorkspaceView<'a> {
    pub fn new(pipeline_id: &'a PipelineId, attempt: u32, workspace: &'a dyn Workspace) -> Self {
        Self {
            pipeline_id,
            attempt,
            workspace,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.workspace.exists(path)
    }

    pub fn read_to_string(&self, path: &str) -> std::io::Result<String> {
        self.workspace.read_to_string(path)
    }

    pub fn list_files(&self) -> std::io::Result<Vec<String>> {
        self.workspace.list_files()
    }

    pub fn root(&self) -> Option<&Path> {
        self.workspace.root()
    }
}

/// Raw output of one check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckOutcome {
    /// Zero passes.
    pub exit_code: i32,
    pub stdout: String,
    pub diagnostics: Vec<String>,
}

impl CheckOutcome {
    /// Static-analysis outcome: passes iff there is nothing to report.
    pub fn from_diagnostics(diagnostics: Vec<String>) -> Self {
        Self {
            exit_code: if diagnostics.is_empty() { 0 } else { 1 },
            stdout: String::new(),
            diagnostics,
        }
    }
}

/// A pluggable verification step.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    /// Command line recorded in the step.
    fn command(&self) -> String;

    async fn run(&self, view: &WorkspaceView<'_>) -> anyhow::Result<CheckOutcome>;
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn step_from_outcome(index: u32, command: String, outcome: CheckOutcome) -> VerificationStep {
    let mut diagnostics: Vec<String> = outcome
        .diagnostics
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    diagnostics.sort();
    diagnostics.dedup();

    VerificationStep {
        index,
        command,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: diagnostics.join("\n"),
        status: if outcome.exit_code == 0 {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        },
    }
}

fn crashed_step(index: u32, check: &dyn Check, detail: &str) -> VerificationStep {
    obs::emit_check_crashed(check.name(), detail);
    VerificationStep {
        index,
        command: check.command(),
        exit_code: -1,
        stdout: String::new(),
        stderr: format!("Checker '{}' crashed: {}", check.name(), detail),
        status: StepStatus::Failed,
    }
}

/// Run `checks` in order and build the (unpersisted) result for
/// `execution_unit_id`.
pub async fn execute_checks(
    checks: &[Arc<dyn Check>],
    hasher: &ProvenanceHasher,
    pipeline_id: &PipelineId,
    attempt: u32,
    execution_unit_id: Option<&str>,
    workspace: &dyn Workspace,
) -> Result<VerificationResult> {
    let view = WorkspaceView::new(pipeline_id, attempt, workspace);
    let mut steps = Vec::with_capacity(checks.len());

    for (index, check) in checks.iter().enumerate() {
        let index = index as u32;
        let step = match AssertUnwindSafe(check.run(&view)).catch_unwind().await {
            Ok(Ok(outcome)) => step_from_outcome(index, check.command(), outcome),
            Ok(Err(err)) => crashed_step(index, &**check, &format!("{err:#}")),
            Err(payload) => crashed_step(index, &**check, &panic_detail(payload)),
        };
        steps.push(step);
    }

    let overall_status = VerificationResult::overall_of(&steps);
    let result_hash = hasher.hash_verification(pipeline_id, attempt, overall_status, &steps)?;
    Ok(VerificationResult {
        result_id: Uuid::new_v4().to_string(),
        pipeline_id: pipeline_id.clone(),
        attempt,
        execution_unit_id: execution_unit_id.map(str::to_string),
        steps,
        overall_status,
        result_hash,
        executed_at: Utc::now(),
    })
}

/// Ordered checks plus the sinks a recorded result goes to.
pub struct VerificationPipeline {
    checks: Vec<Arc<dyn Check>>,
    results: Arc<dyn VerificationStore>,
    events: Arc<dyn EventLog>,
    hasher: ProvenanceHasher,
}

impl VerificationPipeline {
    pub fn new(results: Arc<dyn VerificationStore>, events: Arc<dyn EventLog>) -> Self {
        Self {
            checks: Vec::new(),
            results,
            events,
            hasher: ProvenanceHasher::default(),
        }
    }

    pub fn with_check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_checks(mut self, checks: impl IntoIterator<Item = Arc<dyn Check>>) -> Self {
        self.checks.extend(checks);
        self
    }

    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Verify attempt `attempt` of `execution_unit_id`, persist the result
    /// and log `verification.recorded`.
    ///
    /// The auditor only accepts a result whose attempt and unit match the
    /// pipeline's current ones.
    pub async fn run_checks(
        &self,
        pipeline_id: &PipelineId,
        attempt: u32,
        execution_unit_id: Option<&str>,
        workspace: &dyn Workspace,
    ) -> Result<VerificationResult> {
        let result = execute_checks(
            &self.checks,
            &self.hasher,
            pipeline_id,
            attempt,
            execution_unit_id,
            workspace,
        )
        .await?;

        self.results.record_result(&result).await?;
        self.events
            .append_event(
                pipeline_id,
                "verification.recorded",
                json!({
                    "result_id": result.result_id,
                    "attempt": attempt,
                    "execution_unit_id": execution_unit_id,
                    "overall_status": result.overall_status.as_str(),
                    "result_hash": result.result_hash.as_str(),
                    "steps": result.steps.len(),
                }),
            )
            .await?;
        obs::emit_verification_recorded(
            pipeline_id.as_str(),
            attempt,
            result.passed(),
            result.steps.len(),
            result.result_hash.as_str(),
        );
        Ok(result)
    }
}
