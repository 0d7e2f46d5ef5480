//! Bounded repair loop: verify, audit, apply, repair, repeat.
//!
//! Rounds are strictly sequential and driven from here rather than by
//! recursion. The loop only continues on `retry_with_repair`, and the
//! auditor stops issuing that once the attempt reaches the budget.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagegate_state::{
    ContentDigest, DecisionType, FailureClassification, PipelineId, PipelineStatus, StepStatus,
};

use crate::auditor::CompletionAuditor;
use crate::conductor::Conductor;
use crate::error::Result;
use crate::obs;
use crate::verification::VerificationPipeline;
use crate::workspace::Workspace;

/// External action that tries to fix a failed attempt in place.
#[async_trait]
pub trait Repairer: Send + Sync {
    /// Repair the workspace after `attempt` failed with `diagnostics`.
    async fn repair(
        &self,
        pipeline_id: &PipelineId,
        attempt: u32,
        diagnostics: &[String],
    ) -> anyhow::Result<()>;
}

/// One verify-audit-apply round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRound {
    pub attempt: u32,
    pub result_hash: ContentDigest,
    pub overall_status: StepStatus,
    pub decision: DecisionType,
    pub classification: Option<FailureClassification>,
    pub reason: Option<String>,
    /// Set when the repairer itself failed; the loop stops there.
    pub repair_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairLog {
    pub pipeline_id: PipelineId,
    pub rounds: Vec<RepairRound>,
    pub final_decision: Option<DecisionType>,
    pub final_status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RepairLog {
    pub fn attempts_used(&self) -> usize {
        self.rounds.len()
    }
}

pub struct RepairLoop<'a> {
    verification: &'a VerificationPipeline,
    auditor: &'a CompletionAuditor,
    conductor: &'a Conductor,
    repairer: Arc<dyn Repairer>,
}

impl<'a> RepairLoop<'a> {
    pub fn new(
        verification: &'a VerificationPipeline,
        auditor: &'a CompletionAuditor,
        conductor: &'a Conductor,
        repairer: Arc<dyn Repairer>,
    ) -> Self {
        Self {
            verification,
            auditor,
            conductor,
            repairer,
        }
    }

    /// Run rounds until a decision other than `retry_with_repair`, or until
    /// the repairer fails.
    pub async fn run(&self, pipeline_id: &PipelineId, workspace: &dyn Workspace) -> Result<RepairLog> {
        let _span = obs::PipelineSpan::enter(pipeline_id.as_str());
        let started_at = Utc::now();
        let mut rounds = Vec::new();

        loop {
            let state = self.conductor.state(pipeline_id).await?;
            let attempt = state.repair.attempt;
            let result = self
                .verification
                .run_checks(pipeline_id, attempt, state.progress.current(), workspace)
                .await?;
            let decision = self.auditor.audit(pipeline_id).await?;
            self.conductor.apply_decision(&decision).await?;
            obs::emit_repair_round(
                pipeline_id.as_str(),
                attempt,
                decision.decision_type.as_str(),
            );

            let mut round = RepairRound {
                attempt,
                result_hash: result.result_hash.clone(),
                overall_status: result.overall_status,
                decision: decision.decision_type,
                classification: decision.classification,
                reason: decision.reason.clone(),
                repair_error: None,
            };

            if decision.decision_type != DecisionType::RetryWithRepair {
                rounds.push(round);
                break;
            }

            let diagnostics = result.failure_diagnostics();
            if let Err(err) = self
                .repairer
                .repair(pipeline_id, attempt, &diagnostics)
                .await
            {
                tracing::warn!(
                    event = "repair.failed",
                    pipeline_id = %pipeline_id,
                    attempt = attempt,
                    error = %err,
                );
                round.repair_error = Some(format!("{err:#}"));
                rounds.push(round);
                break;
            }
            rounds.push(round);
        }

        let final_status = self.conductor.state(pipeline_id).await?.status;
        Ok(RepairLog {
            pipeline_id: pipeline_id.clone(),
            final_decision: rounds.last().map(|r| r.decision),
            rounds,
            final_status,
            started_at,
            finished_at: Utc::now(),
        })
    }
}
