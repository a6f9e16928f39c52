use crate::context::{phase_context, AgentContext};
use crate::gates::PASSING_SCORE;
use crate::runtime::WorkerAgent;
use crate::validator::REPORT_NAME;
use async_trait::async_trait;
use atelier_blackboard::{validate_content, validate_file_path};
use atelier_core::{
    is_protected_path, Artifact, ArtifactKind, AtelierError, AtelierResult, Phase, Task,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

/// Staging-phase agent. Re-validates the latest validation report,
/// filters proposed files against the protected list and the allowed
/// roots, and records the surviving set — the orchestrator later turns
/// the root task's code artifacts into staging-change rows. Never
/// writes the live file system itself.
pub struct ExecutorAgent {
    ctx: AgentContext,
}

impl ExecutorAgent {
    /// Wrap the shared collaborators.
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

fn latest_code_by_name(artifacts: Vec<Artifact>) -> Vec<Artifact> {
    let mut by_name: HashMap<String, Artifact> = HashMap::new();
    for artifact in artifacts {
        if artifact.kind != ArtifactKind::Code {
            continue;
        }
        match by_name.get(&artifact.name) {
            Some(existing) if existing.id >= artifact.id => {}
            _ => {
                by_name.insert(artifact.name.clone(), artifact);
            }
        }
    }
    let mut latest: Vec<Artifact> = by_name.into_values().collect();
    latest.sort_by_key(|a| a.id);
    latest
}

#[async_trait]
impl WorkerAgent for ExecutorAgent {
    fn name(&self) -> &'static str {
        "executor"
    }

    fn can_handle(&self, task: &Task) -> bool {
        task.assigned_agent.as_deref() == Some("executor")
            || task.phase_tag() == Some(Phase::Staging.as_str())
    }

    async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value> {
        let report = self
            .ctx
            .board
            .latest_artifact(task.id, ArtifactKind::Analysis, Some(REPORT_NAME))?
            .ok_or_else(|| AtelierError::Agent("no validation report found".into()))?;
        let report: Value = serde_json::from_str(&report.content)
            .map_err(|e| AtelierError::Agent(format!("unreadable validation report: {e}")))?;

        let valid = report.get("valid").and_then(Value::as_bool).unwrap_or(false);
        let score = report.get("score").and_then(Value::as_f64).unwrap_or(0.0);
        if !valid || score < PASSING_SCORE {
            return Err(AtelierError::Agent(format!(
                "validation gate not passed (valid={valid}, score={score:.1})"
            )));
        }

        let root = self.ctx.board.resolve_root(task.id)?;
        let code = latest_code_by_name(self.ctx.board.artifacts_for_task(root.id)?);

        let mut staged = Vec::new();
        let mut skipped = Vec::new();
        for artifact in &code {
            if is_protected_path(&artifact.name) {
                warn!(path = %artifact.name, "Protected file excluded from staging");
                skipped.push(json!({"path": artifact.name, "reason": "protected file"}));
                continue;
            }
            if let Err(violation) = validate_file_path(&artifact.name) {
                skipped.push(json!({"path": artifact.name, "reason": violation.to_string()}));
                continue;
            }
            if let Err(violation) = validate_content(&artifact.content) {
                skipped.push(json!({"path": artifact.name, "reason": violation.to_string()}));
                continue;
            }
            staged.push(artifact.name.clone());
        }

        self.ctx.board.add_log(
            task.id,
            self.name(),
            "files_staged",
            "filtered validated files for staging review",
            &format!("{} staged, {} skipped", staged.len(), skipped.len()),
            json!({"staged": staged, "skipped": skipped}),
        )?;

        let subtask = self.ctx.board.create_subtask(
            root.id,
            &format!("Evolve: {}", root.title),
            "Extract learnings from this run",
            Phase::Evolution.agent(),
            vec![],
            phase_context(task, Phase::Evolution),
        )?;
        info!(
            task_id = task.id,
            evolution_task = subtask.id,
            staged = staged.len(),
            "Staging phase complete"
        );

        Ok(json!({
            "phase": Phase::Staging.as_str(),
            "staged_files": staged,
            "skipped": skipped,
            "next_task_id": subtask.id,
        }))
    }
}
