//! Auditor decisions over recorded verification results.

use std::sync::Arc;

use chrono::Utc;
use stagegate_core::{CompletionAuditor, ProvenanceHasher, StateViolation};
use stagegate_state::fakes::MemoryGateStore;
use stagegate_state::{
    DecisionStore, DecisionType, EventLog, ExecutionProgress, FailureClassification, PipelineId,
    PipelineReader, PipelineState, PipelineStatus, PipelineStore, StepStatus, VerificationResult,
    VerificationStep, VerificationStore,
};
use uuid::Uuid;

struct Setup {
    store: Arc<MemoryGateStore>,
    auditor: CompletionAuditor,
    pid: PipelineId,
}

async fn setup(status: PipelineStatus, attempt: u32, units: &[&str]) -> Setup {
    let store = Arc::new(MemoryGateStore::new());
    let pid = PipelineId::from("p");
    let mut state = PipelineState::new(pid.clone(), "p", 3);
    state.status = status;
    state.repair.attempt = attempt;
    state.progress = ExecutionProgress::new(units.iter().map(|u| u.to_string()).collect());
    store.create_pipeline(&state).await.expect("create");
    let auditor =
        CompletionAuditor::new(store.clone(), store.clone(), store.clone(), store.clone());
    Setup {
        store,
        auditor,
        pid,
    }
}

async fn record(s: &Setup, attempt: u32, stderr: Option<&str>) -> VerificationResult {
    let steps = vec![VerificationStep {
        index: 0,
        command: "check".to_string(),
        exit_code: if stderr.is_some() { 1 } else { 0 },
        stdout: String::new(),
        stderr: stderr.unwrap_or_default().to_string(),
        status: if stderr.is_some() {
            StepStatus::Failed
        } else {
            StepStatus::Passed
        },
    }];
    let overall_status = VerificationResult::overall_of(&steps);
    let unit = s
        .store
        .get_pipeline(&s.pid)
        .await
        .expect("get")
        .and_then(|state| state.progress.current().map(str::to_string));
    let result = VerificationResult {
        result_id: Uuid::new_v4().to_string(),
        pipeline_id: s.pid.clone(),
        attempt,
        execution_unit_id: unit,
        result_hash: ProvenanceHasher::new()
            .hash_verification(&s.pid, attempt, overall_status, &steps)
            .expect("hash"),
        steps,
        overall_status,
        executed_at: Utc::now(),
    };
    s.store.record_result(&result).await.expect("record");
    result
}

#[tokio::test]
async fn runtime_error_on_first_attempt_retries() {
    let s = setup(PipelineStatus::Verifying, 1, &[]).await;
    let result = record(&s, 1, Some("Runtime error: x is undefined")).await;

    let decision = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(decision.decision_type, DecisionType::RetryWithRepair);
    assert_eq!(decision.classification, Some(FailureClassification::Repairable));
    assert_eq!(decision.verification_hash, result.result_hash);
    assert_eq!(decision.attempt, 1);
}

#[tokio::test]
async fn runtime_error_on_last_attempt_escalates() {
    let s = setup(PipelineStatus::Verifying, 3, &[]).await;
    record(&s, 3, Some("Runtime error: x is undefined")).await;

    let decision = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(decision.decision_type, DecisionType::EscalateToHuman);
    assert!(decision.reason.is_some());
}

#[tokio::test]
async fn security_violation_fails_on_first_attempt() {
    let s = setup(PipelineStatus::Building, 1, &[]).await;
    record(&s, 1, Some("Security violation: forbidden API")).await;

    let decision = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(decision.decision_type, DecisionType::MarkFailed);
    assert_eq!(
        decision.classification,
        Some(FailureClassification::NonRepairable)
    );
}

#[tokio::test]
async fn passed_with_pending_units_proceeds() {
    let s = setup(PipelineStatus::Verifying, 1, &["u1", "u2", "u3"]).await;
    record(&s, 1, None).await;

    let decision = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(decision.decision_type, DecisionType::ProceedToNextUnit);
    assert_eq!(decision.execution_unit_id.as_deref(), Some("u2"));
    assert!(decision.classification.is_none());
}

#[tokio::test]
async fn passed_with_nothing_pending_completes() {
    let s = setup(PipelineStatus::Verifying, 1, &["only"]).await;
    record(&s, 1, None).await;

    let decision = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(decision.decision_type, DecisionType::MarkCompleted);
}

#[tokio::test]
async fn each_result_is_decided_exactly_once() {
    let s = setup(PipelineStatus::Verifying, 1, &[]).await;
    let result = record(&s, 1, Some("weird failure nobody wrote a rule for")).await;

    let first = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(
        first.classification,
        Some(FailureClassification::Unclassified)
    );
    assert_eq!(
        first.verification_result_id.as_deref(),
        Some(result.result_id.as_str())
    );

    let err = s.auditor.audit(&s.pid).await.unwrap_err();
    assert_eq!(
        err.state_violation(),
        Some(&StateViolation::VerificationConsumed {
            result_id: result.result_id.clone(),
            decision_id: first.decision_id.clone(),
        })
    );

    assert_eq!(s.store.list_decisions(&s.pid).await.expect("list").len(), 1);
    let events = s.store.events(&s.pid).await.expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "audit.decided");
    assert_eq!(events[0].payload["classification"], "unclassified");

    // A fresh verification of the same attempt can be decided again.
    record(&s, 1, Some("weird failure nobody wrote a rule for")).await;
    let second = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(first.decision_type, second.decision_type);
    assert_ne!(first.decision_id, second.decision_id);
}

#[tokio::test]
async fn next_unit_is_not_decided_on_previous_unit_result() {
    let s = setup(PipelineStatus::Verifying, 1, &["u1", "u2", "u3"]).await;
    record(&s, 1, None).await;
    let decision = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(decision.decision_type, DecisionType::ProceedToNextUnit);

    // The conductor moves on to u2 with a fresh counter.
    let mut state = s.store.get_pipeline(&s.pid).await.expect("get").expect("some");
    let expected = state.version;
    state.progress.completed = 1;
    state.status = PipelineStatus::Building;
    state.version += 1;
    s.store
        .compare_and_swap(expected, &state)
        .await
        .expect("advance");

    let err = s.auditor.audit(&s.pid).await.unwrap_err();
    assert_eq!(
        err.state_violation(),
        Some(&StateViolation::VerificationUnitMismatch {
            result_unit: Some("u1".to_string()),
            current_unit: Some("u2".to_string()),
        })
    );
    assert_eq!(s.store.list_decisions(&s.pid).await.expect("list").len(), 1);

    record(&s, 1, None).await;
    let decision = s.auditor.audit(&s.pid).await.expect("audit");
    assert_eq!(decision.execution_unit_id.as_deref(), Some("u3"));
}

#[tokio::test]
async fn audit_refused_outside_build_and_verify() {
    for status in [
        PipelineStatus::Initialized,
        PipelineStatus::Planning,
        PipelineStatus::Completed,
        PipelineStatus::Failed,
    ] {
        let s = setup(status, 1, &[]).await;
        record(&s, 1, None).await;
        let err = s.auditor.audit(&s.pid).await.unwrap_err();
        assert_eq!(
            err.state_violation(),
            Some(&StateViolation::NotAuditable { status })
        );
        assert!(s.store.list_decisions(&s.pid).await.expect("list").is_empty());
        assert!(s.store.events(&s.pid).await.expect("events").is_empty());
    }
}

#[tokio::test]
async fn audit_needs_a_current_result() {
    let s = setup(PipelineStatus::Verifying, 2, &[]).await;
    let err = s.auditor.audit(&s.pid).await.unwrap_err();
    assert_eq!(
        err.state_violation(),
        Some(&StateViolation::NoVerificationResult)
    );

    record(&s, 1, Some("Compile error")).await;
    let err = s.auditor.audit(&s.pid).await.unwrap_err();
    assert_eq!(
        err.state_violation(),
        Some(&StateViolation::StaleVerification {
            result_attempt: 1,
            current_attempt: 2,
        })
    );

    let err = s
        .auditor
        .audit(&PipelineId::from("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.state_violation(),
        Some(StateViolation::NotFound { .. })
    ));
}
