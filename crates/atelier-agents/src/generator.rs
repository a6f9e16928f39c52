use crate::context::{phase_context, AgentContext};
use crate::llm::extract_json;
use crate::runtime::WorkerAgent;
use async_trait::async_trait;
use atelier_core::{ArtifactKind, AtelierResult, Phase, Task};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

const SYSTEM: &str = "You are the code generator agent of a development \
    pipeline. Given a specification and reference excerpts, respond with \
    JSON only: {\"files\": [{\"path\": \"...\", \"content\": \"...\", \
    \"type\": \"code|test|config\", \"action\": \"create|modify\"}]}.";

/// Reference files read per run. Excerpts keep prompts bounded.
const MAX_REFERENCES: usize = 2;
const EXCERPT_LINES: usize = 40;

#[derive(Debug, Deserialize)]
struct GeneratedFile {
    path: String,
    content: String,
    #[serde(default, rename = "type")]
    file_type: String,
    #[serde(default)]
    action: String,
}

#[derive(Debug, Deserialize)]
struct GeneratedFileSet {
    files: Vec<GeneratedFile>,
}

/// Codegen-phase agent: turns the latest specification into `code`
/// artifacts and hands off to validation.
pub struct GeneratorAgent {
    ctx: AgentContext,
}

impl GeneratorAgent {
    /// Wrap the shared collaborators.
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Read a small number of reference-file excerpts for the prompt.
    /// Tool failures degrade to no references.
    async fn gather_references(&self, query: &str) -> String {
        let search = self.ctx.tools.search_code(query, MAX_REFERENCES).await;
        let Some(results) = search.data.as_ref().and_then(|d| d.as_array()) else {
            return String::new();
        };
        let mut excerpts = String::new();
        for result in results.iter().take(MAX_REFERENCES) {
            let Some(path) = result.get("path").and_then(|p| p.as_str()) else {
                continue;
            };
            let outcome = self.ctx.tools.read_file(path).await;
            if let Some(content) = outcome.text() {
                let excerpt: Vec<&str> = content.lines().take(EXCERPT_LINES).collect();
                excerpts.push_str(&format!("--- {path} ---\n{}\n", excerpt.join("\n")));
            }
        }
        excerpts
    }
}

#[async_trait]
impl WorkerAgent for GeneratorAgent {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn can_handle(&self, task: &Task) -> bool {
        task.assigned_agent.as_deref() == Some("generator")
            || task.phase_tag() == Some(Phase::Codegen.as_str())
    }

    async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value> {
        let spec = self
            .ctx
            .board
            .latest_artifact(task.id, ArtifactKind::Spec, None)?;
        let doc = self
            .ctx
            .board
            .latest_artifact(task.id, ArtifactKind::Doc, None)?;
        let spec_text = spec
            .as_ref()
            .map_or(task.description.as_str(), |a| a.content.as_str());
        let references = self.gather_references(&task.title).await;

        let prompt = format!(
            "Specification:\n{spec_text}\n\nContext:\n{}\n\nReference excerpts:\n{references}",
            doc.as_ref().map_or("", |a| a.content.as_str()),
        );
        let raw = self.ctx.llm.complete(SYSTEM, &prompt).await?;

        let parsed = extract_json(&raw)
            .and_then(|value| serde_json::from_value::<GeneratedFileSet>(value).ok());
        let (file_count, fallback) = match parsed {
            Some(set) if !set.files.is_empty() => {
                let count = set.files.len();
                for file in set.files {
                    self.ctx.board.add_artifact(
                        task.id,
                        ArtifactKind::Code,
                        &file.path,
                        &file.content,
                        self.name(),
                        json!({"action": file.action, "file_type": file.file_type}),
                    )?;
                }
                (count, false)
            }
            _ => {
                // Unparseable response: keep the raw output as a single
                // module file so validation still has something to gate.
                warn!(task_id = task.id, "File list unparseable; emitting fallback module");
                self.ctx.board.add_artifact(
                    task.id,
                    ArtifactKind::Code,
                    "src/generated.rs",
                    &raw,
                    self.name(),
                    json!({"action": "create", "fallback": true}),
                )?;
                (1, true)
            }
        };

        self.ctx.board.add_log(
            task.id,
            self.name(),
            "code_generated",
            "generated file set from specification",
            &format!("{file_count} code artifacts"),
            json!({"fallback": fallback}),
        )?;

        let root = self.ctx.board.resolve_root(task.id)?;
        let subtask = self.ctx.board.create_subtask(
            root.id,
            &format!("Validate: {}", task.title),
            "Run quality gates over the generated code artifacts",
            Phase::Validation.agent(),
            vec![],
            phase_context(task, Phase::Validation),
        )?;
        info!(task_id = task.id, validation_task = subtask.id, files = file_count, "Codegen phase complete");

        Ok(json!({
            "phase": Phase::Codegen.as_str(),
            "files": file_count,
            "fallback": fallback,
            "next_task_id": subtask.id,
        }))
    }
}
