use crate::context::{phase_context, AgentContext};
use crate::gates::{blend_score, lint_gate, security_gate, syntax_gate, GateReport, PASSING_SCORE};
use crate::llm::extract_json;
use crate::runtime::WorkerAgent;
use async_trait::async_trait;
use atelier_core::{Artifact, ArtifactKind, AtelierResult, Phase, Task};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

const SYSTEM: &str = "You are the validator agent of a development pipeline. \
    Review the given code for correctness, clarity and safety. Respond with \
    JSON only: {\"score\": 0-100, \"summary\": \"...\"}.";

/// Artifact name of the persisted validation report. The executor reads
/// this back before staging.
pub(crate) const REPORT_NAME: &str = "docs/validation-report.json";

/// Review score assumed when the completion service cannot be reached
/// or returns an unusable response.
const NEUTRAL_REVIEW_SCORE: f64 = 50.0;

/// Validation-phase agent: three deterministic gates blended with a
/// qualitative review into one score. Valid code hands off to staging;
/// invalid code stalls the pipeline until externally retried.
pub struct ValidatorAgent {
    ctx: AgentContext,
}

impl ValidatorAgent {
    /// Wrap the shared collaborators.
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Qualitative review score from the completion service, degrading
    /// to a neutral score on transport or format failure.
    async fn review_score(&self, artifacts: &[Artifact]) -> (f64, String) {
        let mut prompt = String::from("Review these files:\n");
        for artifact in artifacts {
            prompt.push_str(&format!("--- {} ---\n{}\n", artifact.name, artifact.content));
        }
        match self.ctx.llm.complete(SYSTEM, &prompt).await {
            Ok(raw) => match extract_json(&raw) {
                Some(value) => {
                    let score = value
                        .get("score")
                        .and_then(Value::as_f64)
                        .unwrap_or(NEUTRAL_REVIEW_SCORE)
                        .clamp(0.0, 100.0);
                    let summary = value
                        .get("summary")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    (score, summary)
                }
                None => (NEUTRAL_REVIEW_SCORE, "unparseable review response".into()),
            },
            Err(e) => {
                warn!(error = %e, "Review unavailable; using neutral score");
                (NEUTRAL_REVIEW_SCORE, format!("review unavailable: {e}"))
            }
        }
    }
}

fn gate_json(report: &GateReport) -> Value {
    json!({
        "name": report.name,
        "passed": report.passed,
        "score": report.score,
        "findings": report.findings,
    })
}

/// The newest version of each code artifact, by name.
fn latest_versions(artifacts: Vec<Artifact>) -> Vec<Artifact> {
    let mut by_name: HashMap<String, Artifact> = HashMap::new();
    for artifact in artifacts {
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
impl WorkerAgent for ValidatorAgent {
    fn name(&self) -> &'static str {
        "validator"
    }

    fn can_handle(&self, task: &Task) -> bool {
        task.assigned_agent.as_deref() == Some("validator")
            || task.phase_tag() == Some(Phase::Validation.as_str())
    }

    async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value> {
        let root = self.ctx.board.resolve_root(task.id)?;
        let code: Vec<Artifact> = self
            .ctx
            .board
            .artifacts_for_task(root.id)?
            .into_iter()
            .filter(|a| a.kind == ArtifactKind::Code)
            .collect();
        let code = latest_versions(code);

        if code.is_empty() {
            let report = json!({"valid": false, "score": 0.0, "reason": "no code artifacts"});
            self.ctx.board.add_artifact(
                task.id,
                ArtifactKind::Analysis,
                REPORT_NAME,
                &report.to_string(),
                self.name(),
                json!({}),
            )?;
            warn!(task_id = task.id, "Validation blocked: nothing to validate");
            return Ok(report);
        }

        let mut syntax = syntax_gate(&code);
        // Fold the external typecheck into the syntax gate.
        let typecheck = self.ctx.tools.typecheck().await;
        if !typecheck.success {
            syntax.passed = false;
            syntax.score = (syntax.score - 25.0).max(0.0);
            syntax.findings.push(format!(
                "typecheck failed: {}",
                typecheck.error.as_deref().unwrap_or("no diagnostics")
            ));
        }
        let lint = lint_gate(&code);
        let security = security_gate(&code);
        let (review, review_summary) = self.review_score(&code).await;

        let gates = [syntax, lint, security];
        let score = blend_score(review, &gates);
        let valid = score >= PASSING_SCORE;

        let report = json!({
            "valid": valid,
            "score": score,
            "review_score": review,
            "review_summary": review_summary,
            "gates": gates.iter().map(gate_json).collect::<Vec<_>>(),
            "files": code.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
        });
        self.ctx.board.add_artifact(
            task.id,
            ArtifactKind::Analysis,
            REPORT_NAME,
            &report.to_string(),
            self.name(),
            json!({}),
        )?;
        self.ctx.board.add_log(
            task.id,
            self.name(),
            "quality_gates_run",
            "blended deterministic gates with qualitative review",
            &format!("score {score:.1}, valid {valid}"),
            json!({"score": score}),
        )?;

        if valid {
            let subtask = self.ctx.board.create_subtask(
                root.id,
                &format!("Stage: {}", root.title),
                "Stage validated files for human review",
                Phase::Staging.agent(),
                vec![],
                phase_context(task, Phase::Staging),
            )?;
            info!(task_id = task.id, staging_task = subtask.id, score, "Validation passed");
        } else {
            // The pipeline stalls here until externally retried; no next
            // subtask is created.
            self.ctx.board.add_log(
                task.id,
                self.name(),
                "validation_blocked",
                "score below threshold; staging subtask not created",
                &format!("score {score:.1} < {PASSING_SCORE}"),
                json!({}),
            )?;
            warn!(task_id = task.id, score, "Validation blocked");
        }

        Ok(report)
    }
}
