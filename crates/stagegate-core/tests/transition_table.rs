//! Exhaustive transition-table tests against the conductor.

use std::sync::Arc;

use stagegate_core::fsm::allowed_next;
use stagegate_core::{Conductor, StateViolation};
use stagegate_state::fakes::MemoryGateStore;
use stagegate_state::{
    EventLog, PipelineId, PipelineReader, PipelineState, PipelineStatus, PipelineStore,
};

async fn pipeline_in(status: PipelineStatus) -> (Conductor, Arc<MemoryGateStore>, PipelineId) {
    let store = Arc::new(MemoryGateStore::new());
    let pid = PipelineId::from(format!("p-{status}").as_str());
    let mut state = PipelineState::new(pid.clone(), pid.as_str(), 3);
    state.status = status;
    store.create_pipeline(&state).await.expect("create");
    (Conductor::new(store.clone(), store.clone()), store, pid)
}

#[tokio::test]
async fn transition_succeeds_iff_edge_is_in_table() {
    for from in PipelineStatus::ALL {
        for to in PipelineStatus::ALL {
            let (conductor, store, pid) = pipeline_in(from).await;
            let before = store.get_pipeline(&pid).await.expect("get").expect("some");

            let outcome = conductor.transition(&pid, to).await;
            let after = store.get_pipeline(&pid).await.expect("get").expect("some");

            if allowed_next(from).contains(&to) {
                let state = outcome.unwrap_or_else(|e| panic!("{from} -> {to}: {e}"));
                assert_eq!(state.status, to);
                assert_eq!(after.version, before.version + 1);
                let events = store.events(&pid).await.expect("events");
                assert_eq!(events.len(), 1, "{from} -> {to}");
                assert_eq!(events[0].kind, "pipeline.transitioned");
            } else {
                let err = outcome.expect_err("edge not in table");
                assert_eq!(
                    err.state_violation(),
                    Some(&StateViolation::InvalidTransition { from, to })
                );
                assert_eq!(after, before, "{from} -> {to} must not write");
                assert!(store.events(&pid).await.expect("events").is_empty());
            }
        }
    }
}

#[tokio::test]
async fn terminal_statuses_have_no_exits() {
    for status in PipelineStatus::ALL {
        assert_eq!(status.is_terminal(), allowed_next(status).is_empty());
    }
}

#[tokio::test]
async fn every_non_terminal_status_can_fail() {
    for status in PipelineStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
        let (conductor, _, pid) = pipeline_in(status).await;
        let state = conductor
            .transition(&pid, PipelineStatus::Failed)
            .await
            .expect("escape to failed");
        assert_eq!(state.status, PipelineStatus::Failed);
    }
}

#[tokio::test]
async fn locked_pipeline_refuses_without_writing() {
    let (conductor, store, pid) = pipeline_in(PipelineStatus::Initialized).await;
    let lock = conductor.lock(&pid, "documenting").await.expect("lock");
    let before = store.get_pipeline(&pid).await.expect("get").expect("some");

    let err = conductor
        .transition(&pid, PipelineStatus::Documenting)
        .await
        .expect_err("locked");
    assert_eq!(
        err.state_violation(),
        Some(&StateViolation::Locked {
            holder: "documenting".to_string()
        })
    );
    let after = store.get_pipeline(&pid).await.expect("get").expect("some");
    assert_eq!(after, before);

    let state = conductor
        .complete_stage(&lock, PipelineStatus::Documenting)
        .await
        .expect("complete");
    assert!(!state.locked());
    assert_eq!(state.last_stage.as_deref(), Some("documenting"));
}

#[tokio::test]
async fn gate_blocks_transitions_until_a_human_answers() {
    let (conductor, _, pid) = pipeline_in(PipelineStatus::Planning).await;
    conductor
        .request_approval(&pid, "review build plan")
        .await
        .expect("request");

    let err = conductor
        .transition(&pid, PipelineStatus::Building)
        .await
        .expect_err("gated");
    assert!(matches!(
        err.state_violation(),
        Some(StateViolation::AwaitingHuman { .. })
    ));
    let snapshot = conductor.snapshot(&pid).await.expect("snapshot");
    assert!(snapshot.awaiting_human);
    assert!(snapshot.allowed_next_states.is_empty());

    let state = conductor
        .approve(&pid, PipelineStatus::Building, "reviewer")
        .await
        .expect("approve");
    assert_eq!(state.status, PipelineStatus::Building);
    assert!(state.gate.is_open());
}

#[tokio::test]
async fn stale_writer_loses_the_race() {
    let (conductor, store, pid) = pipeline_in(PipelineStatus::Initialized).await;
    let stale = store.get_pipeline(&pid).await.expect("get").expect("some");
    conductor
        .transition(&pid, PipelineStatus::Documenting)
        .await
        .expect("first writer");

    let mut racing = stale.next_revision();
    racing.status = PipelineStatus::Failed;
    let err = store
        .compare_and_swap(stale.version, &racing)
        .await
        .expect_err("version moved");
    let err: stagegate_core::GateError = err.into();
    assert_eq!(
        err.state_violation(),
        Some(&StateViolation::ConcurrentModification)
    );
}
