use crate::context::{phase_context, AgentContext};
use crate::runtime::WorkerAgent;
use async_trait::async_trait;
use atelier_core::{ArtifactKind, AtelierResult, Phase, Task};
use serde_json::json;
use tracing::info;

const SYSTEM: &str = "You are the architect agent of a development pipeline. \
    Given a development request and project context, produce a concise, \
    structured specification in markdown: overview, affected modules, new \
    files with responsibilities, and acceptance criteria.";

/// Design-phase agent: turns a development request into a specification
/// artifact and hands off to code generation.
pub struct ArchitectAgent {
    ctx: AgentContext,
}

impl ArchitectAgent {
    /// Wrap the shared collaborators.
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Gather a project-context summary from the tool collaborator.
    /// Tool failures degrade to an empty summary, not an error.
    async fn gather_context(&self, task: &Task) -> String {
        let search = self.ctx.tools.search_code(&task.title, 5).await;
        if !search.success {
            return String::new();
        }
        search
            .data
            .as_ref()
            .map(|data| format!("Relevant code search results:\n{data:#}"))
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkerAgent for ArchitectAgent {
    fn name(&self) -> &'static str {
        "architect"
    }

    fn can_handle(&self, task: &Task) -> bool {
        task.assigned_agent.as_deref() == Some("architect")
            || task.phase_tag() == Some(Phase::Design.as_str())
    }

    async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value> {
        let context_summary = self.gather_context(task).await;
        let prompt = format!(
            "Development request: {}\n\n{}\n\n{}",
            task.title, task.description, context_summary
        );
        let spec = self.ctx.llm.complete(SYSTEM, &prompt).await?;

        self.ctx.board.add_artifact(
            task.id,
            ArtifactKind::Spec,
            "docs/spec.md",
            &spec,
            self.name(),
            json!({"request": task.title}),
        )?;
        if !context_summary.is_empty() {
            self.ctx.board.add_artifact(
                task.id,
                ArtifactKind::Doc,
                "docs/design-context.md",
                &context_summary,
                self.name(),
                json!({}),
            )?;
        }
        self.ctx.board.add_log(
            task.id,
            self.name(),
            "specification_written",
            "produced a structured specification from the request",
            "spec artifact docs/spec.md",
            json!({}),
        )?;

        let root = self.ctx.board.resolve_root(task.id)?;
        let subtask = self.ctx.board.create_subtask(
            root.id,
            &format!("Generate code: {}", task.title),
            "Generate the files described by docs/spec.md",
            Phase::Codegen.agent(),
            vec![],
            phase_context(task, Phase::Codegen),
        )?;
        info!(task_id = task.id, codegen_task = subtask.id, "Design phase complete");

        Ok(json!({
            "phase": Phase::Design.as_str(),
            "spec_artifact": "docs/spec.md",
            "next_task_id": subtask.id,
        }))
    }
}
