use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Files no staging approval may ever write, plus everything under
/// `.git/`. Consulted by both the executor filter and the approval path.
pub const PROTECTED_PATHS: &[&str] = &[".env", "Cargo.toml", "Cargo.lock", ".gitignore"];

/// Whether a staging path targets a protected file.
pub fn is_protected_path(path: &str) -> bool {
    let normalized = path.trim_start_matches("./");
    PROTECTED_PATHS.contains(&normalized) || normalized.starts_with(".git/")
}

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, not yet started.
    Queued,
    /// Phases are being driven.
    Running,
    /// Waiting for a human decision on staged changes.
    StagingReview,
    /// All phases finished.
    Completed,
    /// Terminal failure; `error` carries the reason.
    Failed,
}

impl PipelineStatus {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Queued => "queued",
            PipelineStatus::Running => "running",
            PipelineStatus::StagingReview => "staging_review",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(PipelineStatus::Queued),
            "running" => Some(PipelineStatus::Running),
            "staging_review" => Some(PipelineStatus::StagingReview),
            "completed" => Some(PipelineStatus::Completed),
            "failed" => Some(PipelineStatus::Failed),
            _ => None,
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }
}

/// One of the five fixed pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Specification authored by the architect agent.
    Design,
    /// Code generation by the generator agent.
    Codegen,
    /// Quality gates run by the validator agent.
    Validation,
    /// Staging of validated files by the executor agent.
    Staging,
    /// Learning extraction by the evolution agent.
    Evolution,
}

impl Phase {
    /// All phases in fixed execution order.
    pub const ALL: [Phase; 5] = [
        Phase::Design,
        Phase::Codegen,
        Phase::Validation,
        Phase::Staging,
        Phase::Evolution,
    ];

    /// The agent identity bound to this phase.
    pub fn agent(self) -> &'static str {
        match self {
            Phase::Design => "architect",
            Phase::Codegen => "generator",
            Phase::Validation => "validator",
            Phase::Staging => "executor",
            Phase::Evolution => "evolution",
        }
    }

    /// The phase after this one, or `None` for the last.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Design => Some(Phase::Codegen),
            Phase::Codegen => Some(Phase::Validation),
            Phase::Validation => Some(Phase::Staging),
            Phase::Staging => Some(Phase::Evolution),
            Phase::Evolution => None,
        }
    }

    /// Stable text form used in store columns and task contexts.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Design => "design",
            Phase::Codegen => "codegen",
            Phase::Validation => "validation",
            Phase::Staging => "staging",
            Phase::Evolution => "evolution",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "design" => Some(Phase::Design),
            "codegen" => Some(Phase::Codegen),
            "validation" => Some(Phase::Validation),
            "staging" => Some(Phase::Staging),
            "evolution" => Some(Phase::Evolution),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase progress inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not started.
    Pending,
    /// The phase subtask has been created.
    Running,
    /// The phase subtask completed.
    Completed,
    /// The phase subtask failed.
    Failed,
}

/// State of one phase within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    /// Progress of this phase.
    pub status: PhaseStatus,
    /// The blackboard subtask bound to this phase, once started.
    pub task_id: Option<i64>,
    /// When the phase subtask was created.
    pub started_at: Option<DateTime<Utc>>,
    /// When the phase subtask reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// The phase subtask's result, once completed.
    pub result: Option<serde_json::Value>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Pending,
            task_id: None,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

/// Resource budget for one pipeline run.
///
/// `exceeded` is sticky: once set it stays set even if later checks would
/// technically pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    /// Token allowance for completion-service usage.
    pub max_tokens: u64,
    /// Wall-clock allowance in milliseconds, measured from pipeline start.
    pub max_time_ms: u64,
    /// Allowance of agent phase-start calls.
    pub max_calls: u32,
    /// Phase-start calls consumed so far.
    pub used_calls: u32,
    /// Sticky breach flag.
    pub exceeded: bool,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            max_time_ms: 600_000,
            max_calls: 100,
            used_calls: 0,
            exceeded: false,
        }
    }
}

impl Budget {
    /// Merge caller overrides into the default budget.
    pub fn with_overrides(overrides: &BudgetOverrides) -> Self {
        let mut budget = Budget::default();
        if let Some(v) = overrides.max_tokens {
            budget.max_tokens = v;
        }
        if let Some(v) = overrides.max_time_ms {
            budget.max_time_ms = v;
        }
        if let Some(v) = overrides.max_calls {
            budget.max_calls = v;
        }
        budget
    }
}

/// Caller-supplied budget overrides, usually parsed from request metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetOverrides {
    /// Override for [`Budget::max_tokens`].
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Override for [`Budget::max_time_ms`].
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    /// Override for [`Budget::max_calls`].
    #[serde(default)]
    pub max_calls: Option<u32>,
}

/// One decision in the pipeline's append-only runbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookEntry {
    /// Phase the decision belongs to.
    pub phase: Phase,
    /// Agent identity that the decision concerns.
    pub agent: String,
    /// Short description of the decision taken.
    pub decision: String,
    /// When the decision was recorded.
    pub timestamp: DateTime<Utc>,
    /// Structured details.
    pub details: serde_json::Value,
}

/// Snapshot of a staging approval recorded in the runbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Who approved.
    pub reviewer: String,
    /// Paths written successfully.
    pub applied: Vec<String>,
    /// Paths that failed to apply.
    pub errors: Vec<String>,
    /// Paths skipped (duplicates, filters).
    pub skipped: Vec<String>,
    /// When the approval happened.
    pub approved_at: DateTime<Utc>,
}

/// The complete human-readable narrative of one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Runbook {
    /// Ordered decision log.
    pub decisions: Vec<RunbookEntry>,
    /// Most recent validation snapshot.
    pub validation: Option<serde_json::Value>,
    /// Most recent approval snapshot.
    pub approval: Option<ApprovalRecord>,
    /// Deployment record slot.
    pub deployment: Option<serde_json::Value>,
}

impl Runbook {
    /// Append a decision entry.
    pub fn record(
        &mut self,
        phase: Phase,
        agent: impl Into<String>,
        decision: impl Into<String>,
        details: serde_json::Value,
    ) {
        self.decisions.push(RunbookEntry {
            phase,
            agent: agent.into(),
            decision: decision.into(),
            timestamp: Utc::now(),
            details,
        });
    }
}

/// One development request driven through the five phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Row id assigned by the store.
    pub id: i64,
    /// Opaque unique token for external correlation.
    pub correlation_id: Uuid,
    /// The natural-language development request.
    pub prompt: String,
    /// Current lifecycle state.
    pub status: PipelineStatus,
    /// The phase currently being driven.
    pub current_phase: Phase,
    /// Root main task on the blackboard, once started.
    pub main_task_id: Option<i64>,
    /// Per-phase progress.
    pub phases: BTreeMap<Phase, PhaseState>,
    /// Resource budget.
    pub budget: Budget,
    /// Append-only decision narrative.
    pub runbook: Runbook,
    /// Owning user.
    pub user_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when the pipeline starts running.
    pub started_at: Option<DateTime<Utc>>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Failure reason, set when `status == Failed`.
    pub error: Option<String>,
}

impl Pipeline {
    /// Seed all five phases as pending.
    pub fn seed_phases() -> BTreeMap<Phase, PhaseState> {
        Phase::ALL
            .iter()
            .map(|p| (*p, PhaseState::default()))
            .collect()
    }
}

/// Proposed file action for a staging change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingAction {
    /// The file does not exist yet.
    Create,
    /// The file exists and would be overwritten.
    Modify,
}

impl StagingAction {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            StagingAction::Create => "create",
            StagingAction::Modify => "modify",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(StagingAction::Create),
            "modify" => Some(StagingAction::Modify),
            _ => None,
        }
    }
}

/// Review state of a staging change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    /// Awaiting a human decision.
    Pending,
    /// Written to the live project (or superseded by a newer duplicate).
    Applied,
    /// Write refused or errored.
    Failed,
    /// Rejected by the reviewer.
    Rejected,
    /// Reverted to its original content.
    RolledBack,
}

impl StagingStatus {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            StagingStatus::Pending => "pending",
            StagingStatus::Applied => "applied",
            StagingStatus::Failed => "failed",
            StagingStatus::Rejected => "rejected",
            StagingStatus::RolledBack => "rolled_back",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StagingStatus::Pending),
            "applied" => Some(StagingStatus::Applied),
            "failed" => Some(StagingStatus::Failed),
            "rejected" => Some(StagingStatus::Rejected),
            "rolled_back" => Some(StagingStatus::RolledBack),
            _ => None,
        }
    }
}

/// One candidate file edit awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingChange {
    /// Row id assigned by the store. Higher id means newer.
    pub id: i64,
    /// Pipeline the change belongs to.
    pub pipeline_id: i64,
    /// Task that produced the underlying artifact.
    pub task_id: i64,
    /// Target path relative to the project root.
    pub file_path: String,
    /// Proposed content.
    pub content: String,
    /// Previous content; `None` for new files.
    pub original_content: Option<String>,
    /// Create or modify.
    pub action: StagingAction,
    /// Review state.
    pub status: StagingStatus,
    /// Reviewer identity, once reviewed.
    pub reviewed_by: Option<String>,
    /// When the review decision was taken.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// When the file was written.
    pub applied_at: Option<DateTime<Utc>>,
    /// When the file was reverted.
    pub rolled_back_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_paths() {
        assert!(is_protected_path(".env"));
        assert!(is_protected_path("./Cargo.toml"));
        assert!(is_protected_path(".git/config"));
        assert!(!is_protected_path("src/main.rs"));
        assert!(!is_protected_path("config/app.toml"));
    }

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::Design.next(), Some(Phase::Codegen));
        assert_eq!(Phase::Codegen.next(), Some(Phase::Validation));
        assert_eq!(Phase::Validation.next(), Some(Phase::Staging));
        assert_eq!(Phase::Staging.next(), Some(Phase::Evolution));
        assert_eq!(Phase::Evolution.next(), None);
    }

    #[test]
    fn test_phase_agents() {
        assert_eq!(Phase::Design.agent(), "architect");
        assert_eq!(Phase::Codegen.agent(), "generator");
        assert_eq!(Phase::Validation.agent(), "validator");
        assert_eq!(Phase::Staging.agent(), "executor");
        assert_eq!(Phase::Evolution.agent(), "evolution");
    }

    #[test]
    fn test_budget_defaults_and_overrides() {
        let budget = Budget::default();
        assert_eq!(budget.max_tokens, 100_000);
        assert_eq!(budget.max_time_ms, 600_000);
        assert_eq!(budget.max_calls, 100);
        assert!(!budget.exceeded);

        let overrides = BudgetOverrides {
            max_calls: Some(1),
            ..BudgetOverrides::default()
        };
        let merged = Budget::with_overrides(&overrides);
        assert_eq!(merged.max_calls, 1);
        assert_eq!(merged.max_tokens, 100_000);
    }

    #[test]
    fn test_seed_phases() {
        let phases = Pipeline::seed_phases();
        assert_eq!(phases.len(), 5);
        assert!(phases
            .values()
            .all(|p| p.status == PhaseStatus::Pending && p.task_id.is_none()));
    }

    #[test]
    fn test_runbook_record() {
        let mut runbook = Runbook::default();
        runbook.record(Phase::Design, "architect", "phase started", serde_json::json!({}));
        runbook.record(Phase::Codegen, "generator", "phase started", serde_json::json!({}));
        assert_eq!(runbook.decisions.len(), 2);
        assert_eq!(runbook.decisions[0].phase, Phase::Design);
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            PipelineStatus::Queued,
            PipelineStatus::Running,
            PipelineStatus::StagingReview,
            PipelineStatus::Completed,
            PipelineStatus::Failed,
        ] {
            assert_eq!(PipelineStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            StagingStatus::Pending,
            StagingStatus::Applied,
            StagingStatus::Failed,
            StagingStatus::Rejected,
            StagingStatus::RolledBack,
        ] {
            assert_eq!(StagingStatus::parse(status.as_str()), Some(status));
        }
    }
}
