use crate::context::AgentContext;
use crate::runtime::WorkerAgent;
use async_trait::async_trait;
use atelier_core::{ArtifactKind, AtelierError, AtelierResult, Task};
use serde_json::json;
use std::time::Instant;
use tracing::info;

const SYSTEM: &str = "You are the researcher agent. Produce a focused, \
    well-structured markdown report for the requested analysis.";

/// Ad-hoc research/analysis agent, unrelated to the five-phase pipeline.
/// Always checks governance policy before acting and records its own
/// throughput metrics.
pub struct ResearcherAgent {
    ctx: AgentContext,
}

impl ResearcherAgent {
    /// Wrap the shared collaborators.
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

fn research_prompt(research_type: &str, task: &Task) -> String {
    match research_type {
        "repo_analysis" => format!(
            "Analyze the repository for: {}\n\nDescribe structure, key modules, \
             conventions and risks.\n\n{}",
            task.title, task.description
        ),
        "solution_comparison" => format!(
            "Compare candidate solutions for: {}\n\nList options with trade-offs \
             and a recommendation.\n\n{}",
            task.title, task.description
        ),
        "feasibility" => format!(
            "Assess the feasibility of: {}\n\nCover effort, risks, unknowns and \
             a go/no-go recommendation.\n\n{}",
            task.title, task.description
        ),
        _ => format!("Research: {}\n\n{}", task.title, task.description),
    }
}

#[async_trait]
impl WorkerAgent for ResearcherAgent {
    fn name(&self) -> &'static str {
        "researcher"
    }

    fn can_handle(&self, task: &Task) -> bool {
        task.assigned_agent.as_deref() == Some("researcher")
            || task
                .context
                .get("task_type")
                .and_then(serde_json::Value::as_str)
                == Some("research")
    }

    async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value> {
        let started = Instant::now();

        let decision =
            self.ctx
                .policy
                .evaluate(self.name(), "research", &task.title, &task.context);
        if !decision.allowed {
            return Err(AtelierError::Governance(format!(
                "research blocked by policy: {}",
                decision.reason
            )));
        }

        let research_type = task
            .context
            .get("research_type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("general")
            .to_string();
        let prompt = research_prompt(&research_type, task);
        let findings = self.ctx.llm.complete(SYSTEM, &prompt).await?;

        let artifact_name = format!("docs/research/{research_type}.md");
        self.ctx.board.add_artifact(
            task.id,
            ArtifactKind::Analysis,
            &artifact_name,
            &findings,
            self.name(),
            json!({"research_type": research_type}),
        )?;

        let duration_ms = started.elapsed().as_millis() as u64;
        // Throughput metrics are observability only; a failed write must
        // not fail the research itself.
        if let Err(e) = self.ctx.jobs.record_agent_metrics(self.name(), 1, 0, duration_ms) {
            tracing::warn!(error = %e, "Metrics write failed");
        }

        info!(task_id = task.id, research_type = %research_type, "Research complete");
        Ok(json!({
            "research_type": research_type,
            "artifact": artifact_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{TaskKind, TaskStatus};
    use chrono::Utc;

    fn task(context: serde_json::Value) -> Task {
        Task {
            id: 1,
            kind: TaskKind::Sub,
            parent_id: Some(0),
            title: "t".into(),
            description: "d".into(),
            status: TaskStatus::Pending,
            priority: 5,
            assigned_agent: None,
            dependencies: vec![],
            context,
            result: None,
            error_message: None,
            user_id: "u".into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_variants() {
        let t = task(json!({}));
        assert!(research_prompt("repo_analysis", &t).contains("Analyze the repository"));
        assert!(research_prompt("solution_comparison", &t).contains("Compare candidate"));
        assert!(research_prompt("feasibility", &t).contains("feasibility"));
        assert!(research_prompt("general", &t).starts_with("Research:"));
    }
}
