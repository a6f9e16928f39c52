use crate::llm::CompletionClient;
use atelier_blackboard::Blackboard;
use atelier_core::{Phase, Task, ToolExecutor};
use atelier_governance::{PolicyEngine, SkillRegistry};
use atelier_jobs::JobQueue;
use serde_json::json;
use std::sync::Arc;

/// Shared collaborators handed to every concrete agent.
#[derive(Clone)]
pub struct AgentContext {
    /// The shared task board.
    pub board: Blackboard,
    /// The completion service.
    pub llm: Arc<dyn CompletionClient>,
    /// The file/search/typecheck/git collaborator.
    pub tools: Arc<dyn ToolExecutor>,
    /// The fail-closed policy evaluator.
    pub policy: PolicyEngine,
    /// The skill registry.
    pub skills: SkillRegistry,
    /// The job queue, used here for agent throughput metrics.
    pub jobs: JobQueue,
}

/// Context for the next phase's subtask, carrying the pipeline marker
/// forward when the current task has one.
pub(crate) fn phase_context(task: &Task, phase: Phase) -> serde_json::Value {
    let mut context = json!({"phase": phase.as_str()});
    if let Some(pipeline_id) = task.context.get("pipeline_id") {
        context["pipeline_id"] = pipeline_id.clone();
    }
    context
}
