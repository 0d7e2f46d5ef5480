//! Completion auditor: turns the latest verification result into exactly one
//! recorded decision.
//!
//! [`decide`] is the pure decision table. [`CompletionAuditor`] loads its
//! inputs, classifies the failure and records the verdict. It can read
//! pipelines and results, write decisions and events, and nothing else.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stagegate_state::{
    CompletionDecision, ContentDigest, DecisionStore, DecisionType, EventLog,
    FailureClassification, PipelineId, PipelineReader, PipelineStatus, StepStatus,
    VerificationStore,
};
use uuid::Uuid;

use crate::classification::{Classification, ClassificationRules};
use crate::error::{Result, StateViolation};
use crate::obs;

/// Everything the decision table looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditInput {
    pub overall_status: StepStatus,
    pub attempt: u32,
    pub budget: u32,
    /// Units still waiting after the current one.
    pub pending_units: usize,
    pub current_unit: Option<String>,
    pub next_unit: Option<String>,
    /// Classification of the failure; `None` when the result passed.
    pub classification: Option<Classification>,
    /// Failure diagnostics in step order.
    pub diagnostics: Vec<String>,
}

/// Output of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision_type: DecisionType,
    pub reason: Option<String>,
    pub execution_unit_id: Option<String>,
    pub classification: Option<FailureClassification>,
}

/// The decision table. First match wins:
///
/// 1. passed, units pending: proceed to the next unit
/// 2. passed, nothing pending: mark completed
/// 3. failed, non-repairable: mark failed
/// 4. failed, repairable, budget spent: escalate
/// 5. failed, repairable: retry with repair
///
/// Unclassified failures take the repairable rows.
pub fn decide(input: &AuditInput) -> Verdict {
    if input.overall_status == StepStatus::Passed {
        return if input.pending_units > 0 {
            Verdict {
                decision_type: DecisionType::ProceedToNextUnit,
                reason: None,
                execution_unit_id: input.next_unit.clone(),
                classification: None,
            }
        } else {
            Verdict {
                decision_type: DecisionType::MarkCompleted,
                reason: None,
                execution_unit_id: input.current_unit.clone(),
                classification: None,
            }
        };
    }

    let class = input
        .classification
        .as_ref()
        .map(|c| c.class)
        .unwrap_or(FailureClassification::Unclassified);
    let first_line = input
        .classification
        .as_ref()
        .and_then(|c| c.matched_line.clone())
        .or_else(|| input.diagnostics.first().cloned())
        .unwrap_or_else(|| "verification failed without diagnostics".to_string());

    let (decision_type, reason) = if !class.is_repairable() {
        (
            DecisionType::MarkFailed,
            format!("Non-repairable failure: {first_line}"),
        )
    } else if input.attempt >= input.budget {
        (
            DecisionType::EscalateToHuman,
            format!(
                "Repair budget exhausted after {} attempts: {first_line}",
                input.attempt
            ),
        )
    } else {
        (DecisionType::RetryWithRepair, first_line)
    };

    Verdict {
        decision_type,
        reason: Some(reason),
        execution_unit_id: input.current_unit.clone(),
        classification: Some(class),
    }
}

/// The verification result an audit was based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionBasis {
    pub result_id: String,
    pub result_hash: ContentDigest,
}

/// Audits pipelines and records one decision per call.
#[derive(Clone)]
pub struct CompletionAuditor {
    pipelines: Arc<dyn PipelineReader>,
    results: Arc<dyn VerificationStore>,
    decisions: Arc<dyn DecisionStore>,
    events: Arc<dyn EventLog>,
    rules: ClassificationRules,
}

impl CompletionAuditor {
    pub fn new(
        pipelines: Arc<dyn PipelineReader>,
        results: Arc<dyn VerificationStore>,
        decisions: Arc<dyn DecisionStore>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            pipelines,
            results,
            decisions,
            events,
            rules: ClassificationRules::default(),
        }
    }

    pub fn with_rules(mut self, rules: ClassificationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &ClassificationRules {
        &self.rules
    }

    /// Build the decision-table input for a pipeline without deciding.
    pub async fn input(&self, pipeline_id: &PipelineId) -> Result<(AuditInput, CompletionBasis)> {
        let state = self
            .pipelines
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| StateViolation::NotFound {
                pipeline_id: pipeline_id.to_string(),
            })?;
        if !matches!(
            state.status,
            PipelineStatus::Building | PipelineStatus::Verifying
        ) {
            return Err(StateViolation::NotAuditable {
                status: state.status,
            }
            .into());
        }

        let result = self
            .results
            .latest_result(pipeline_id)
            .await?
            .ok_or(StateViolation::NoVerificationResult)?;
        if result.attempt != state.repair.attempt {
            return Err(StateViolation::StaleVerification {
                result_attempt: result.attempt,
                current_attempt: state.repair.attempt,
            }
            .into());
        }
        let current_unit = state.progress.current();
        if result.execution_unit_id.as_deref() != current_unit {
            return Err(StateViolation::VerificationUnitMismatch {
                result_unit: result.execution_unit_id,
                current_unit: current_unit.map(str::to_string),
            }
            .into());
        }
        if let Some(decided) = self.decisions.latest_decision(pipeline_id).await? {
            if decided.verification_result_id.as_deref() == Some(result.result_id.as_str()) {
                return Err(StateViolation::VerificationConsumed {
                    result_id: result.result_id,
                    decision_id: decided.decision_id,
                }
                .into());
            }
        }

        let diagnostics = result.failure_diagnostics();
        let classification = if result.passed() {
            None
        } else {
            Some(self.rules.classify(&diagnostics))
        };

        let input = AuditInput {
            overall_status: result.overall_status,
            attempt: state.repair.attempt,
            budget: state.repair.budget,
            pending_units: state.progress.pending_after_current(),
            current_unit: state.progress.current().map(str::to_string),
            next_unit: state.progress.next_unit().map(str::to_string),
            classification,
            diagnostics,
        };
        let basis = CompletionBasis {
            result_id: result.result_id,
            result_hash: result.result_hash,
        };
        Ok((input, basis))
    }

    /// Decide on the latest verification result, record the decision and
    /// append `audit.decided`.
    pub async fn audit(&self, pipeline_id: &PipelineId) -> Result<CompletionDecision> {
        let (input, basis) = self.input(pipeline_id).await?;
        let verdict = decide(&input);

        let decision = CompletionDecision {
            decision_id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.clone(),
            decision_type: verdict.decision_type,
            reason: verdict.reason,
            execution_unit_id: verdict.execution_unit_id,
            attempt: input.attempt,
            classification: verdict.classification,
            verification_hash: basis.result_hash,
            verification_result_id: Some(basis.result_id.clone()),
            decided_at: Utc::now(),
        };

        self.decisions.record_decision(&decision).await?;
        self.events
            .append_event(
                pipeline_id,
                "audit.decided",
                json!({
                    "decision_id": decision.decision_id,
                    "decision_type": decision.decision_type.as_str(),
                    "reason": decision.reason,
                    "execution_unit_id": decision.execution_unit_id,
                    "attempt": decision.attempt,
                    "classification": decision.classification.map(|c| c.as_str()),
                    "result_id": basis.result_id,
                    "verification_hash": decision.verification_hash.as_str(),
                }),
            )
            .await?;

        if let Some(Classification {
            class: FailureClassification::Unclassified,
            matched_line,
            ..
        }) = &input.classification
        {
            obs::emit_unclassified_failure(
                pipeline_id.as_str(),
                matched_line.as_deref().unwrap_or_default(),
            );
        }
        obs::emit_audit_decided(
            pipeline_id.as_str(),
            decision.decision_type.as_str(),
            decision.classification.map(|c| c.as_str()),
            decision.attempt,
        );
        Ok(decision)
    }
}
