use crate::context::AgentContext;
use crate::runtime::WorkerAgent;
use async_trait::async_trait;
use atelier_blackboard::Blackboard;
use atelier_core::{
    ArtifactKind, AtelierResult, AuditDecision, NewAuditEntry, Phase, Task,
};
use atelier_governance::{AuditRecorder, SkillRegistry};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SYSTEM: &str = "You are the evolution agent of a development pipeline. \
    Summarize what this run produced into learnings, recurring patterns and \
    concrete improvements, as short markdown sections.";

/// Audit entries scanned per cycle.
const AUDIT_SCAN_LIMIT: usize = 200;

/// Repetitions of one audited action before it becomes a skill.
const SKILL_THRESHOLD: usize = 3;

/// Skills auto-created per cycle at most.
const SKILLS_PER_CYCLE: usize = 3;

/// Denials before an agent is flagged.
const DENIAL_THRESHOLD: usize = 3;

/// Cycle interval, deliberately long and decoupled from any one task.
const CYCLE_INTERVAL: Duration = Duration::from_secs(300);

/// Evolution-phase agent: distills one run's artifacts and logs into a
/// learnings document.
pub struct EvolutionAgent {
    ctx: AgentContext,
}

impl EvolutionAgent {
    /// Wrap the shared collaborators.
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl WorkerAgent for EvolutionAgent {
    fn name(&self) -> &'static str {
        "evolution"
    }

    fn can_handle(&self, task: &Task) -> bool {
        task.assigned_agent.as_deref() == Some("evolution")
            || task.phase_tag() == Some(Phase::Evolution.as_str())
    }

    async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value> {
        let root = self.ctx.board.resolve_root(task.id)?;
        let details = self
            .ctx
            .board
            .task_with_details(root.id)?
            .ok_or_else(|| atelier_core::AtelierError::Agent("root task vanished".into()))?;

        let mut prompt = format!("Run: {}\n\nArtifacts:\n", root.title);
        for artifact in &details.artifacts {
            prompt.push_str(&format!("- {} ({})\n", artifact.name, artifact.kind));
        }
        prompt.push_str("\nTimeline:\n");
        for log in &details.logs {
            prompt.push_str(&format!("- [{}] {}: {}\n", log.agent_name, log.action, log.observation));
        }

        let learnings = self.ctx.llm.complete(SYSTEM, &prompt).await?;
        self.ctx.board.add_artifact(
            task.id,
            ArtifactKind::Doc,
            "docs/learnings.md",
            &learnings,
            self.name(),
            json!({"artifact_count": details.artifacts.len()}),
        )?;
        info!(task_id = task.id, "Evolution phase complete");

        Ok(json!({
            "phase": Phase::Evolution.as_str(),
            "learnings_artifact": "docs/learnings.md",
        }))
    }
}

/// The long-interval evolution cycle, decoupled from any single task.
///
/// Scans recent audit entries: an action repeated [`SKILL_THRESHOLD`]
/// times becomes a governance skill (capped per cycle, de-duplicated by
/// a stable source key), and agents with repeated denials are flagged.
pub struct EvolutionCycle {
    board: Blackboard,
    skills: SkillRegistry,
    audit: AuditRecorder,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvolutionCycle {
    /// Create a cycle with the default 5-minute interval.
    pub fn new(board: Blackboard, skills: SkillRegistry, audit: AuditRecorder) -> Self {
        Self {
            board,
            skills,
            audit,
            interval: CYCLE_INTERVAL,
            handle: Mutex::new(None),
        }
    }

    /// Override the interval (tests use short ones).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One scan pass. Public so tests and the CLI can drive it
    /// directly.
    pub fn run_cycle(&self) -> AtelierResult<serde_json::Value> {
        let entries = self.board.db().recent_audit_entries(AUDIT_SCAN_LIMIT)?;

        let mut action_counts: HashMap<(String, String), usize> = HashMap::new();
        let mut denial_counts: HashMap<String, usize> = HashMap::new();
        for entry in &entries {
            *action_counts
                .entry((entry.agent_name.clone(), entry.action.clone()))
                .or_default() += 1;
            if entry.decision == AuditDecision::Denied {
                *denial_counts.entry(entry.agent_name.clone()).or_default() += 1;
            }
        }

        // Deterministic scan order so the per-cycle cap is stable.
        let mut repeated: Vec<_> = action_counts
            .into_iter()
            .filter(|(_, count)| *count >= SKILL_THRESHOLD)
            .collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut created = Vec::new();
        for ((agent, action), count) in repeated {
            if created.len() >= SKILLS_PER_CYCLE {
                break;
            }
            let source_key = format!("audit:{agent}:{action}");
            let name = format!("auto-{action}");
            let description =
                format!("Distilled from {count} repetitions of '{action}' by {agent}");
            if self
                .skills
                .create_skill(&name, &description, &source_key)?
                .is_some()
            {
                created.push(name);
            }
        }

        let mut flagged = Vec::new();
        for (agent, denials) in denial_counts {
            if denials >= DENIAL_THRESHOLD {
                warn!(agent = %agent, denials, "Agent flagged for repeated policy denials");
                self.audit.record(NewAuditEntry::new(
                    "evolution",
                    "flag_agent",
                    &agent,
                    AuditDecision::Executed,
                    format!("{denials} policy denials in the last {AUDIT_SCAN_LIMIT} audit entries"),
                ));
                flagged.push(agent);
            }
        }
        flagged.sort();

        Ok(json!({"skills_created": created, "agents_flagged": flagged}))
    }

    /// Start the background cycle. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            return;
        }
        info!("Evolution cycle started");
        let cycle = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cycle.interval);
            loop {
                ticker.tick().await;
                if let Err(e) = cycle.run_cycle() {
                    warn!(error = %e, "Evolution cycle failed");
                }
            }
        }));
    }

    /// Stop the background cycle. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Evolution cycle stopped");
        }
    }
}

impl Drop for EvolutionCycle {
    fn drop(&mut self) {
        self.stop();
    }
}
