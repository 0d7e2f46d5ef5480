//! The conductor: the only writer of pipeline state.
//!
//! Pipeline status moves through the static table in [`crate::fsm`]. Two
//! orthogonal tokens sit beside it: the stage lock (a producer run is in
//! flight) and the human gate (sign-off, escalation or halt pending). Every
//! operation loads the state, validates against both tokens and the table,
//! and commits with a compare-and-swap on `version`, so a refused or raced
//! operation writes nothing.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stagegate_state::{
    CompletionDecision, DecisionType, EventLog, ExecutionProgress, HumanGate, LockToken,
    PipelineId, PipelineState, PipelineStatus, PipelineStore, RepairCounter,
};
use uuid::Uuid;

use crate::error::{Result, StateViolation};
use crate::fsm;
use crate::obs;

/// Read-only view of a pipeline for callers and operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub pipeline_id: PipelineId,
    pub status: PipelineStatus,
    pub locked: bool,
    pub lock_holder: Option<String>,
    pub lock_id: Option<Uuid>,
    pub awaiting_human: bool,
    pub gate: String,
    pub gate_reason: Option<String>,
    pub last_stage: Option<String>,
    /// Statuses an automatic `transition` could reach right now. Empty while
    /// locked or awaiting a human.
    pub allowed_next_states: Vec<PipelineStatus>,
    pub repair_attempt: u32,
    pub repair_budget: u32,
    pub current_unit: Option<String>,
    pub pending_units: usize,
    pub version: u64,
}

impl StateSnapshot {
    pub fn of(state: &PipelineState) -> Self {
        let allowed_next_states = if state.locked() || state.awaiting_human() {
            Vec::new()
        } else {
            fsm::allowed_next(state.status).to_vec()
        };
        let lock_id = match &state.lock {
            LockToken::Held { lock_id, .. } => Some(*lock_id),
            LockToken::Free => None,
        };
        Self {
            pipeline_id: state.pipeline_id.clone(),
            status: state.status,
            locked: state.locked(),
            lock_holder: state.lock.holder().map(str::to_string),
            lock_id,
            awaiting_human: state.awaiting_human(),
            gate: state.gate.label().to_string(),
            gate_reason: state.gate.reason().map(str::to_string),
            last_stage: state.last_stage.clone(),
            allowed_next_states,
            repair_attempt: state.repair.attempt,
            repair_budget: state.repair.budget,
            current_unit: state.progress.current().map(str::to_string),
            pending_units: state.progress.pending_after_current(),
            version: state.version,
        }
    }
}

/// Proof of holding a pipeline's stage lock, returned by [`Conductor::lock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLock {
    pub pipeline_id: PipelineId,
    pub lock_id: Uuid,
    pub stage: String,
}

/// Event to append once the state write has landed.
struct Pending {
    kind: &'static str,
    payload: Value,
}

impl Pending {
    fn new(kind: &'static str, payload: Value) -> Self {
        Self { kind, payload }
    }
}

fn ensure_unlocked(state: &PipelineState) -> std::result::Result<(), StateViolation> {
    match state.lock.holder() {
        Some(holder) => Err(StateViolation::Locked {
            holder: holder.to_string(),
        }),
        None => Ok(()),
    }
}

fn ensure_gate_open(state: &PipelineState) -> std::result::Result<(), StateViolation> {
    if state.gate.is_open() {
        Ok(())
    } else {
        Err(StateViolation::AwaitingHuman {
            gate: state.gate.label().to_string(),
            reason: state.gate.reason().unwrap_or_default().to_string(),
        })
    }
}

fn ensure_gate_closed(state: &PipelineState) -> std::result::Result<(), StateViolation> {
    if state.gate.is_open() {
        Err(StateViolation::GateNotPending)
    } else {
        Ok(())
    }
}

fn ensure_not_terminal(state: &PipelineState) -> std::result::Result<(), StateViolation> {
    if state.status.is_terminal() {
        Err(StateViolation::Terminal {
            status: state.status,
        })
    } else {
        Ok(())
    }
}

fn ensure_holder(state: &PipelineState, lock: &StageLock) -> std::result::Result<(), StateViolation> {
    match &state.lock {
        LockToken::Free => Err(StateViolation::NotLocked),
        LockToken::Held { lock_id, .. } if *lock_id == lock.lock_id => Ok(()),
        LockToken::Held { .. } => Err(StateViolation::StaleLock),
    }
}

/// A decision applies once, to the attempt and unit it was taken for.
fn ensure_decision_current(
    state: &PipelineState,
    decision: &CompletionDecision,
) -> std::result::Result<(), StateViolation> {
    let stale = |detail: String| StateViolation::StaleDecision {
        decision_id: decision.decision_id.clone(),
        detail,
    };
    if state.last_decision_id.as_deref() == Some(decision.decision_id.as_str()) {
        return Err(stale("already applied".to_string()));
    }
    if decision.attempt != state.repair.attempt {
        return Err(stale(format!(
            "taken on attempt {}, pipeline is on attempt {}",
            decision.attempt, state.repair.attempt
        )));
    }
    let expected_unit = match decision.decision_type {
        DecisionType::ProceedToNextUnit => state.progress.next_unit(),
        _ => state.progress.current(),
    };
    if decision.execution_unit_id.as_deref() != expected_unit {
        return Err(stale(format!(
            "names unit {:?}, expected {:?}",
            decision.execution_unit_id, expected_unit
        )));
    }
    Ok(())
}

/// Apply one validated edge to `next`, queueing its event.
fn hop(
    next: &mut PipelineState,
    to: PipelineStatus,
    events: &mut Vec<Pending>,
) -> std::result::Result<(), StateViolation> {
    let from = next.status;
    fsm::check_edge(from, to)?;
    next.status = to;
    events.push(Pending::new(
        "pipeline.transitioned",
        json!({ "from": from.as_str(), "to": to.as_str() }),
    ));
    Ok(())
}

/// Single-writer state machine over a [`PipelineStore`].
#[derive(Clone)]
pub struct Conductor {
    pipelines: Arc<dyn PipelineStore>,
    events: Arc<dyn EventLog>,
    repair_budget: u32,
}

impl Conductor {
    pub fn new(pipelines: Arc<dyn PipelineStore>, events: Arc<dyn EventLog>) -> Self {
        Self {
            pipelines,
            events,
            repair_budget: RepairCounter::DEFAULT_BUDGET,
        }
    }

    /// Repair budget given to pipelines initialized from now on.
    pub fn with_repair_budget(mut self, budget: u32) -> Self {
        self.repair_budget = budget;
        self
    }

    // -- private helpers -----------------------------------------------------

    /// Write `next` with a compare-and-swap, then append `events` in order.
    ///
    /// The two stores share no transaction. The state write lands first, so
    /// a failed append leaves the new state committed with a gap in the log,
    /// and the append error is returned. A lost compare-and-swap writes
    /// neither.
    async fn commit(
        &self,
        current: &PipelineState,
        next: PipelineState,
        events: Vec<Pending>,
    ) -> Result<PipelineState> {
        self.pipelines
            .compare_and_swap(current.version, &next)
            .await?;
        let pid = next.pipeline_id.as_str();
        for event in events {
            if event.kind == "pipeline.transitioned" {
                obs::emit_transitioned(
                    pid,
                    event.payload["from"].as_str().unwrap_or_default(),
                    event.payload["to"].as_str().unwrap_or_default(),
                );
            }
            self.events
                .append_event(&next.pipeline_id, event.kind, event.payload)
                .await?;
        }
        Ok(next)
    }

    // -- lifecycle -----------------------------------------------------------

    /// Create a pipeline whose workspace resource is named after its id.
    pub async fn initialize(&self, pipeline_id: &PipelineId) -> Result<PipelineState> {
        self.initialize_in(pipeline_id, pipeline_id.as_str()).await
    }

    /// Create a pipeline building into `workspace_ref`: `initialized`,
    /// unlocked, gate open.
    pub async fn initialize_in(
        &self,
        pipeline_id: &PipelineId,
        workspace_ref: &str,
    ) -> Result<PipelineState> {
        let state = PipelineState::new(pipeline_id.clone(), workspace_ref, self.repair_budget);
        self.pipelines.create_pipeline(&state).await?;
        self.events
            .append_event(
                pipeline_id,
                "pipeline.initialized",
                json!({ "workspace_ref": workspace_ref, "repair_budget": self.repair_budget }),
            )
            .await?;
        obs::emit_initialized(pipeline_id.as_str(), workspace_ref);
        Ok(state)
    }

    /// Current persisted state.
    pub async fn state(&self, pipeline_id: &PipelineId) -> Result<PipelineState> {
        self.pipelines
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| {
                StateViolation::NotFound {
                    pipeline_id: pipeline_id.0.clone(),
                }
                .into()
            })
    }

    pub async fn snapshot(&self, pipeline_id: &PipelineId) -> Result<StateSnapshot> {
        Ok(StateSnapshot::of(&self.state(pipeline_id).await?))
    }

    /// Automatic advancement along one edge of the table.
    ///
    /// Refused immediately while locked (no queueing) or while the human
    /// gate is closed.
    pub async fn transition(
        &self,
        pipeline_id: &PipelineId,
        target: PipelineStatus,
    ) -> Result<PipelineState> {
        let current = self.state(pipeline_id).await?;
        ensure_unlocked(&current)?;
        ensure_gate_open(&current)?;

        let mut next = current.next_revision();
        let mut events = Vec::new();
        hop(&mut next, target, &mut events)?;
        self.commit(&current, next, events).await
    }

    // -- stage lock ----------------------------------------------------------

    /// Take the stage lock for a producer run. Fails fast if already held.
    pub async fn lock(&self, pipeline_id: &PipelineId, stage: &str) -> Result<StageLock> {
        let current = self.state(pipeline_id).await?;
        ensure_not_terminal(&current)?;
        ensure_unlocked(&current)?;
        ensure_gate_open(&current)?;

        let lock_id = Uuid::new_v4();
        let mut next = current.next_revision();
        next.lock = LockToken::Held {
            lock_id,
            holder: stage.to_string(),
            acquired_at: Utc::now(),
        };
        let events = vec![Pending::new(
            "pipeline.locked",
            json!({ "stage": stage, "lock_id": lock_id }),
        )];
        self.commit(&current, next, events).await?;
        obs::emit_locked(pipeline_id.as_str(), stage);

        Ok(StageLock {
            pipeline_id: pipeline_id.clone(),
            lock_id,
            stage: stage.to_string(),
        })
    }

    /// Finish a producer run: validate and apply `target`, record the stage
    /// and release the lock in one write.
    pub async fn complete_stage(
        &self,
        lock: &StageLock,
        target: PipelineStatus,
    ) -> Result<PipelineState> {
        let current = self.state(&lock.pipeline_id).await?;
        ensure_holder(&current, lock)?;
        ensure_gate_open(&current)?;

        let mut next = current.next_revision();
        let mut events = Vec::new();
        hop(&mut next, target, &mut events)?;
        next.last_stage = Some(lock.stage.clone());
        next.lock = LockToken::Free;
        events.push(Pending::new(
            "pipeline.unlocked",
            json!({ "stage": lock.stage, "lock_id": lock.lock_id, "completed": true }),
        ));
        let state = self.commit(&current, next, events).await?;
        obs::emit_unlocked(lock.pipeline_id.as_str(), &lock.stage);
        Ok(state)
    }

    /// Release the lock without a status change.
    pub async fn unlock(&self, lock: &StageLock) -> Result<PipelineState> {
        let current = self.state(&lock.pipeline_id).await?;
        ensure_holder(&current, lock)?;

        let mut next = current.next_revision();
        next.lock = LockToken::Free;
        let events = vec![Pending::new(
            "pipeline.unlocked",
            json!({ "stage": lock.stage, "lock_id": lock.lock_id, "completed": false }),
        )];
        let state = self.commit(&current, next, events).await?;
        obs::emit_unlocked(lock.pipeline_id.as_str(), &lock.stage);
        Ok(state)
    }

    // -- human gate ----------------------------------------------------------

    /// Close the gate pending manual sign-off of the current stage.
    pub async fn request_approval(
        &self,
        pipeline_id: &PipelineId,
        reason: &str,
    ) -> Result<PipelineState> {
        let current = self.state(pipeline_id).await?;
        ensure_not_terminal(&current)?;
        ensure_unlocked(&current)?;
        ensure_gate_open(&current)?;

        let mut next = current.next_revision();
        next.gate = HumanGate::PendingApproval {
            reason: reason.to_string(),
            requested_at: Utc::now(),
        };
        let events = vec![Pending::new("gate.requested", json!({ "reason": reason }))];
        let state = self.commit(&current, next, events).await?;
        obs::emit_gate("gate.requested", pipeline_id.as_str(), reason);
        Ok(state)
    }

    /// Human approval: apply `target` and reopen the gate in one write.
    ///
    /// `target` equal to the current status reopens the gate without a
    /// status change (resume after escalation or halt).
    pub async fn approve(
        &self,
        pipeline_id: &PipelineId,
        target: PipelineStatus,
        reviewer: &str,
    ) -> Result<PipelineState> {
        let current = self.state(pipeline_id).await?;
        ensure_gate_closed(&current)?;
        ensure_unlocked(&current)?;

        let mut next = current.next_revision();
        let mut events = vec![Pending::new(
            "gate.approved",
            json!({
                "reviewer": reviewer,
                "gate": current.gate.label(),
                "target": target.as_str(),
            }),
        )];
        if target != current.status {
            hop(&mut next, target, &mut events)?;
        }
        next.gate = HumanGate::Open;
        let state = self.commit(&current, next, events).await?;
        obs::emit_gate("gate.approved", pipeline_id.as_str(), reviewer);
        Ok(state)
    }

    /// Human rejection: escape to `failed` and reopen the gate.
    pub async fn reject(
        &self,
        pipeline_id: &PipelineId,
        reviewer: &str,
        reason: &str,
    ) -> Result<PipelineState> {
        let current = self.state(pipeline_id).await?;
        ensure_gate_closed(&current)?;
        ensure_unlocked(&current)?;

        let mut next = current.next_revision();
        let mut events = vec![Pending::new(
            "gate.rejected",
            json!({ "reviewer": reviewer, "reason": reason, "gate": current.gate.label() }),
        )];
        hop(&mut next, PipelineStatus::Failed, &mut events)?;
        next.gate = HumanGate::Open;
        let state = self.commit(&current, next, events).await?;
        obs::emit_gate("gate.rejected", pipeline_id.as_str(), reason);
        Ok(state)
    }

    /// Close the gate in `halted` mode. Overrides any pending gate; only a
    /// human approve or reject reopens it.
    pub async fn halt(&self, pipeline_id: &PipelineId, reason: &str) -> Result<PipelineState> {
        let current = self.state(pipeline_id).await?;

        let mut next = current.next_revision();
        next.gate = HumanGate::Halted {
            reason: reason.to_string(),
            halted_at: Utc::now(),
        };
        let events = vec![Pending::new(
            "pipeline.halted",
            json!({ "reason": reason, "previous_gate": current.gate.label() }),
        )];
        let state = self.commit(&current, next, events).await?;
        obs::emit_halted(pipeline_id.as_str(), reason);
        Ok(state)
    }

    // -- build units & decisions ---------------------------------------------

    /// Record the execution units of the approved build plan.
    pub async fn plan_units(
        &self,
        pipeline_id: &PipelineId,
        units: Vec<String>,
    ) -> Result<PipelineState> {
        let current = self.state(pipeline_id).await?;
        ensure_not_terminal(&current)?;
        if current.progress.completed > 0 {
            return Err(StateViolation::PlanLocked {
                completed: current.progress.completed,
            }
            .into());
        }

        let mut next = current.next_revision();
        let events = vec![Pending::new(
            "pipeline.units_planned",
            json!({ "units": units }),
        )];
        next.progress = ExecutionProgress::new(units);
        self.commit(&current, next, events).await
    }

    /// Execute an auditor decision through validated transitions.
    ///
    /// A decision taken while `building` first applies `building -> verifying`.
    /// Escalation only closes the gate. The decision must match the current
    /// attempt and unit, and is refused once applied.
    pub async fn apply_decision(&self, decision: &CompletionDecision) -> Result<PipelineState> {
        let current = self.state(&decision.pipeline_id).await?;
        ensure_unlocked(&current)?;
        ensure_gate_open(&current)?;
        if !matches!(
            current.status,
            PipelineStatus::Building | PipelineStatus::Verifying
        ) {
            return Err(StateViolation::NotAuditable {
                status: current.status,
            }
            .into());
        }
        ensure_decision_current(&current, decision)?;

        let mut next = current.next_revision();
        next.last_decision_id = Some(decision.decision_id.clone());
        let mut events = Vec::new();

        if decision.decision_type == DecisionType::EscalateToHuman {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "repair budget exhausted".to_string());
            events.push(Pending::new(
                "gate.escalated",
                json!({
                    "decision_id": decision.decision_id,
                    "reason": reason,
                    "attempt": decision.attempt,
                }),
            ));
            next.gate = HumanGate::Escalated {
                reason: reason.clone(),
                escalated_at: Utc::now(),
            };
            let state = self.commit(&current, next, events).await?;
            obs::emit_gate("gate.escalated", decision.pipeline_id.as_str(), &reason);
            return Ok(state);
        }

        if next.status == PipelineStatus::Building {
            hop(&mut next, PipelineStatus::Verifying, &mut events)?;
        }
        match decision.decision_type {
            DecisionType::ProceedToNextUnit => {
                next.progress.completed += 1;
                next.repair = RepairCounter::new(next.repair.budget);
                hop(&mut next, PipelineStatus::Building, &mut events)?;
            }
            DecisionType::RetryWithRepair => {
                next.repair.attempt += 1;
                hop(&mut next, PipelineStatus::Building, &mut events)?;
            }
            DecisionType::MarkCompleted => {
                if next.progress.current().is_some() {
                    next.progress.completed += 1;
                }
                hop(&mut next, PipelineStatus::Completed, &mut events)?;
            }
            DecisionType::MarkFailed => {
                hop(&mut next, PipelineStatus::VerificationFailed, &mut events)?;
            }
            DecisionType::EscalateToHuman => {}
        }
        for event in events.iter_mut() {
            event.payload["decision_id"] = json!(decision.decision_id);
        }
        self.commit(&current, next, events).await
    }
}
