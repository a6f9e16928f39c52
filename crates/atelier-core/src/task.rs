use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a task is a root request or a child unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// A root task. A main task is its own root.
    Main,
    /// A child task targeted at one agent capability.
    Sub,
}

impl TaskKind {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Main => "main",
            TaskKind::Sub => "sub",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" => Some(TaskKind::Main),
            "sub" => Some(TaskKind::Sub),
            _ => None,
        }
    }
}

/// Lifecycle state of a task on the blackboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a claimer.
    Pending,
    /// Claimed by exactly one agent.
    InProgress,
    /// Finished with a result.
    Completed,
    /// Finished with an error message.
    Failed,
}

impl TaskStatus {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work on the blackboard.
///
/// Subtasks point at their parent via `parent_id`; the ultimate root is
/// found by following `parent_id` until a `Main` task. Artifacts always
/// belong to that root regardless of which subtask created them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Row id assigned by the store.
    pub id: i64,
    /// Main or sub.
    pub kind: TaskKind,
    /// Parent task id; `None` for main tasks.
    pub parent_id: Option<i64>,
    /// Short human-readable title.
    pub title: String,
    /// Full description of the work.
    pub description: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Higher priority is polled first.
    pub priority: i64,
    /// Capability tag this task is targeted at, if any.
    pub assigned_agent: Option<String>,
    /// Task ids that must all be `Completed` before this task is claimable.
    pub dependencies: Vec<i64>,
    /// Opaque structured configuration (e.g. current phase tag).
    pub context: serde_json::Value,
    /// Opaque structured output, set on completion.
    pub result: Option<serde_json::Value>,
    /// Error message, set on failure.
    pub error_message: Option<String>,
    /// Owning user.
    pub user_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when the task is claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Number of retries recorded in the task context.
    pub fn retry_count(&self) -> u32 {
        self.context
            .get("retry_count")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// The phase tag stored in the task context, if any.
    pub fn phase_tag(&self) -> Option<&str> {
        self.context.get("phase").and_then(serde_json::Value::as_str)
    }
}

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Main or sub.
    pub kind: TaskKind,
    /// Parent task id; `None` for main tasks.
    pub parent_id: Option<i64>,
    /// Short human-readable title.
    pub title: String,
    /// Full description of the work.
    pub description: String,
    /// Higher priority is polled first.
    pub priority: i64,
    /// Capability tag this task is targeted at, if any.
    pub assigned_agent: Option<String>,
    /// Dependency task ids.
    pub dependencies: Vec<i64>,
    /// Opaque structured configuration.
    pub context: serde_json::Value,
    /// Owning user.
    pub user_id: String,
}

/// Kind of artifact produced by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A structured specification.
    Spec,
    /// Generated source code.
    Code,
    /// A generated test file.
    Test,
    /// Free-form documentation or context.
    Doc,
    /// A configuration file.
    Config,
    /// Research or validation findings.
    Analysis,
}

impl ArtifactKind {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Spec => "spec",
            ArtifactKind::Code => "code",
            ArtifactKind::Test => "test",
            ArtifactKind::Doc => "doc",
            ArtifactKind::Config => "config",
            ArtifactKind::Analysis => "analysis",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spec" => Some(ArtifactKind::Spec),
            "code" => Some(ArtifactKind::Code),
            "test" => Some(ArtifactKind::Test),
            "doc" => Some(ArtifactKind::Doc),
            "config" => Some(ArtifactKind::Config),
            "analysis" => Some(ArtifactKind::Analysis),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned output blob attached to a root main task.
///
/// Multiple artifacts may share a `name` (successive versions); the latest
/// is the most recent by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Row id assigned by the store.
    pub id: i64,
    /// Always the root main-task id; subtask artifacts are re-homed.
    pub task_id: i64,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Path-like identifier, unique per logical file within a task.
    pub name: String,
    /// Text content.
    pub content: String,
    /// Name of the agent that produced the artifact.
    pub created_by: String,
    /// Arbitrary metadata attached by the producer.
    pub metadata: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Append-only narration entry forming the debug timeline of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    /// Row id assigned by the store.
    pub id: i64,
    /// Task the entry narrates.
    pub task_id: i64,
    /// Agent that wrote the entry.
    pub agent_name: String,
    /// Machine-readable action tag.
    pub action: String,
    /// Free-text reasoning.
    pub thought: String,
    /// Free-text observation of the outcome.
    pub observation: String,
    /// Arbitrary metadata.
    pub metadata: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
