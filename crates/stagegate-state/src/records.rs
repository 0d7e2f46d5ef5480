//! Persisted record shapes for Stagegate.
//!
//! Records:
//! - `PipelineState`: one per build request (status + lock token + human gate)
//! - `Artifact`: one per producer-stage output, hash-locked on approval
//! - `VerificationResult`: one per verification attempt, never mutated
//! - `CompletionDecision`: one per auditor invocation, never mutated
//! - `PipelineEvent`: append-only lifecycle log entry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage_traits::ContentDigest;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineId(pub String);

impl PipelineId {
    /// Generate a new random PipelineId
    pub fn new() -> Self {
        PipelineId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PipelineId {
    fn from(s: &str) -> Self {
        PipelineId(s.to_string())
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage status. The allowed edges live in the conductor's
/// transition table; this type only knows which states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Initialized,
    Documenting,
    ScreenDesign,
    Planning,
    Building,
    Verifying,
    Completed,
    VerificationFailed,
    Failed,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 9] = [
        PipelineStatus::Initialized,
        PipelineStatus::Documenting,
        PipelineStatus::ScreenDesign,
        PipelineStatus::Planning,
        PipelineStatus::Building,
        PipelineStatus::Verifying,
        PipelineStatus::Completed,
        PipelineStatus::VerificationFailed,
        PipelineStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Initialized => "initialized",
            PipelineStatus::Documenting => "documenting",
            PipelineStatus::ScreenDesign => "screen_design",
            PipelineStatus::Planning => "planning",
            PipelineStatus::Building => "building",
            PipelineStatus::Verifying => "verifying",
            PipelineStatus::Completed => "completed",
            PipelineStatus::VerificationFailed => "verification_failed",
            PipelineStatus::Failed => "failed",
        }
    }

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::VerificationFailed | PipelineStatus::Failed
        )
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown pipeline status: {s}"))
    }
}

/// Mutual-exclusion token: a stage run is in flight while `Held`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockToken {
    Free,
    Held {
        lock_id: Uuid,
        holder: String,
        acquired_at: DateTime<Utc>,
    },
}

impl LockToken {
    pub fn is_held(&self) -> bool {
        matches!(self, LockToken::Held { .. })
    }

    pub fn holder(&self) -> Option<&str> {
        match self {
            LockToken::Held { holder, .. } => Some(holder),
            LockToken::Free => None,
        }
    }
}

/// Human-gate token: automatic advancement is forbidden unless `Open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HumanGate {
    Open,
    /// A stage contract requires manual sign-off.
    PendingApproval {
        reason: String,
        requested_at: DateTime<Utc>,
    },
    /// Repair budget exhausted; the auditor asked for a human.
    Escalated {
        reason: String,
        escalated_at: DateTime<Utc>,
    },
    /// Integrity breach or operator halt, pending investigation.
    Halted {
        reason: String,
        halted_at: DateTime<Utc>,
    },
}

impl HumanGate {
    pub fn is_open(&self) -> bool {
        matches!(self, HumanGate::Open)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            HumanGate::Open => None,
            HumanGate::PendingApproval { reason, .. }
            | HumanGate::Escalated { reason, .. }
            | HumanGate::Halted { reason, .. } => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HumanGate::Open => "open",
            HumanGate::PendingApproval { .. } => "pending_approval",
            HumanGate::Escalated { .. } => "escalated",
            HumanGate::Halted { .. } => "halted",
        }
    }
}

/// Repair attempts within one verification cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairCounter {
    /// 1-based; the first verification of a cycle is attempt 1.
    pub attempt: u32,
    pub budget: u32,
}

impl RepairCounter {
    pub const DEFAULT_BUDGET: u32 = 3;

    pub fn new(budget: u32) -> Self {
        Self { attempt: 1, budget }
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.budget
    }
}

impl Default for RepairCounter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUDGET)
    }
}

/// Execution units of the build stage and how many have finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub units: Vec<String>,
    pub completed: usize,
}

impl ExecutionProgress {
    pub fn new(units: Vec<String>) -> Self {
        Self {
            units,
            completed: 0,
        }
    }

    /// The unit currently being built, if any.
    pub fn current(&self) -> Option<&str> {
        self.units.get(self.completed).map(String::as_str)
    }

    /// Units still waiting after the current one.
    pub fn pending_after_current(&self) -> usize {
        self.units.len().saturating_sub(self.completed + 1)
    }

    pub fn next_unit(&self) -> Option<&str> {
        self.units.get(self.completed + 1).map(String::as_str)
    }
}

/// One pipeline request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: PipelineId,
    pub status: PipelineStatus,
    pub lock: LockToken,
    pub gate: HumanGate,
    pub last_stage: Option<String>,
    pub repair: RepairCounter,
    pub progress: ExecutionProgress,
    /// Id of the last completion decision the conductor applied.
    #[serde(default)]
    pub last_decision_id: Option<String>,
    /// Workspace resource (relative to the workspace root) this pipeline builds into.
    pub workspace_ref: String,
    /// Revision used for compare-and-swap writes; bumped on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh state: `initialized`, unlocked, gate open.
    pub fn new(pipeline_id: PipelineId, workspace_ref: impl Into<String>, budget: u32) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id,
            status: PipelineStatus::Initialized,
            lock: LockToken::Free,
            gate: HumanGate::Open,
            last_stage: None,
            repair: RepairCounter::new(budget),
            progress: ExecutionProgress::default(),
            last_decision_id: None,
            workspace_ref: workspace_ref.into(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn locked(&self) -> bool {
        self.lock.is_held()
    }

    pub fn awaiting_human(&self) -> bool {
        !self.gate.is_open()
    }

    /// Copy for the next write: version bumped, `updated_at` refreshed.
    pub fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = Utc::now();
        next
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Kind of producer-stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Requirements,
    ScreenSpec,
    BuildPlan,
    Manifest,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 4] = [
        ArtifactType::Requirements,
        ArtifactType::ScreenSpec,
        ArtifactType::BuildPlan,
        ArtifactType::Manifest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Requirements => "requirements",
            ArtifactType::ScreenSpec => "screen_spec",
            ArtifactType::BuildPlan => "build_plan",
            ArtifactType::Manifest => "manifest",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown artifact type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Draft,
    Approved,
}

/// A producer-stage output ("contract").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub pipeline_id: PipelineId,
    pub artifact_type: ArtifactType,
    pub producing_stage: String,
    /// Starts at 1; a superseding artifact carries `version + 1`.
    pub version: u32,
    pub payload: serde_json::Value,
    /// `None` until the artifact is hash-locked on approval.
    pub content_hash: Option<ContentDigest>,
    /// Ordered hashes of the approved inputs this artifact was produced from.
    pub upstream_hashes: Vec<ContentDigest>,
    pub approval: ApprovalStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub supersedes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create a new draft (unhashed) artifact.
    pub fn draft(
        pipeline_id: PipelineId,
        artifact_type: ArtifactType,
        producing_stage: impl Into<String>,
        payload: serde_json::Value,
        upstream_hashes: Vec<ContentDigest>,
    ) -> Self {
        Self {
            artifact_id: Uuid::new_v4().to_string(),
            pipeline_id,
            artifact_type,
            producing_stage: producing_stage.into(),
            version: 1,
            payload,
            content_hash: None,
            upstream_hashes,
            approval: ApprovalStatus::Draft,
            approved_at: None,
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approval == ApprovalStatus::Approved
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Passed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Passed => "PASSED",
            StepStatus::Failed => "FAILED",
        }
    }
}

/// One atomic pass/fail check within an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStep {
    pub index: u32,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub status: StepStatus,
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub result_id: String,
    pub pipeline_id: PipelineId,
    pub attempt: u32,
    /// Execution unit that was current when the checks ran.
    #[serde(default)]
    pub execution_unit_id: Option<String>,
    pub steps: Vec<VerificationStep>,
    pub overall_status: StepStatus,
    pub result_hash: ContentDigest,
    pub executed_at: DateTime<Utc>,
}

impl VerificationResult {
    /// PASSED iff every step passed (vacuously for zero steps).
    pub fn overall_of(steps: &[VerificationStep]) -> StepStatus {
        if steps.iter().all(|s| s.status == StepStatus::Passed) {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        }
    }

    pub fn passed(&self) -> bool {
        self.overall_status == StepStatus::Passed
    }

    /// Non-empty diagnostic lines of the failed steps, in step order.
    pub fn failure_diagnostics(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .flat_map(|s| s.stderr.lines())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    ProceedToNextUnit,
    RetryWithRepair,
    EscalateToHuman,
    MarkCompleted,
    MarkFailed,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::ProceedToNextUnit => "proceed_to_next_unit",
            DecisionType::RetryWithRepair => "retry_with_repair",
            DecisionType::EscalateToHuman => "escalate_to_human",
            DecisionType::MarkCompleted => "mark_completed",
            DecisionType::MarkFailed => "mark_failed",
        }
    }
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the auditor read the failure diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClassification {
    Repairable,
    NonRepairable,
    /// No rule matched. Handled as repairable, reported separately.
    Unclassified,
}

impl FailureClassification {
    pub fn is_repairable(&self) -> bool {
        !matches!(self, FailureClassification::NonRepairable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClassification::Repairable => "repairable",
            FailureClassification::NonRepairable => "non_repairable",
            FailureClassification::Unclassified => "unclassified",
        }
    }
}

/// The auditor's single output per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionDecision {
    pub decision_id: String,
    pub pipeline_id: PipelineId,
    pub decision_type: DecisionType,
    pub reason: Option<String>,
    pub execution_unit_id: Option<String>,
    pub attempt: u32,
    pub classification: Option<FailureClassification>,
    /// `result_hash` of the verification result the decision was based on.
    pub verification_hash: ContentDigest,
    /// `result_id` of that result.
    #[serde(default)]
    pub verification_result_id: Option<String>,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A single entry of a pipeline's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Monotonic sequence number within the pipeline, starting at 1.
    pub seq: u64,
    pub pipeline_id: PipelineId,
    /// Event kind (e.g. "pipeline.transitioned", "audit.decided")
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
