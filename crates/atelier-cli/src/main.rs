//! The `atelier` binary: wires the store, blackboard, governance, job
//! queue, agents and pipeline orchestrator together behind a small CLI.

mod config;
mod tools;

use atelier_agents::{
    AgentContext, AgentRuntime, ArchitectAgent, EvolutionAgent, EvolutionCycle, ExecutorAgent,
    GeneratorAgent, HttpCompletionClient, ResearcherAgent, ValidatorAgent,
};
use atelier_blackboard::Blackboard;
use atelier_core::{
    AtelierError, AtelierResult, BudgetOverrides, EventBus, NewJob, PolicyConditions, PolicyEffect,
    PolicyScope,
};
use atelier_governance::{run_self_test, seed_default_policies, AuditRecorder, PolicyEngine, SkillRegistry};
use atelier_jobs::{JobProcessor, JobQueue};
use atelier_pipeline::PipelineOrchestrator;
use atelier_store::{Db, NewPolicyRule};
use clap::{Parser, Subcommand};
use config::AtelierConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tools::LocalTools;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "atelier", about = "Atelier — autonomous development pipeline")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "atelier.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run agents, job processor and pipeline monitors until Ctrl-C
    Serve,
    /// Manage pipelines
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },
    /// Manage blackboard tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Manage queued jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Manage governance policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Print board and queue statistics
    Stats,
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Create and start a pipeline for a development request
    Create {
        /// The natural-language request
        prompt: String,
        /// Override the call budget
        #[arg(long)]
        max_calls: Option<u32>,
        /// Override the wall-clock budget in milliseconds
        #[arg(long)]
        max_time_ms: Option<u64>,
        /// Override the token budget
        #[arg(long)]
        max_tokens: Option<u64>,
        /// Requesting user id
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Show a pipeline's status, error and runbook
    Status {
        /// Pipeline id
        id: i64,
    },
    /// Approve pending staging changes
    Approve {
        /// Pipeline id
        id: i64,
        /// Reviewer identity
        #[arg(long)]
        reviewer: String,
        /// Restrict approval to these paths (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Reject all pending staging changes
    Reject {
        /// Pipeline id
        id: i64,
        /// Reviewer identity
        #[arg(long)]
        reviewer: String,
    },
    /// Roll applied changes back to their original content
    Rollback {
        /// Pipeline id
        id: i64,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a main task outside any pipeline
    Create {
        /// Task title
        title: String,
        /// Task description
        #[arg(long, default_value = "")]
        description: String,
        /// Requesting user id
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Re-queue a failed task
    Retry {
        /// Task id
        id: i64,
        /// Reason recorded in the task context
        #[arg(long, default_value = "manual retry")]
        reason: String,
    },
    /// Show a task with its subtasks, artifacts and logs
    Show {
        /// Task id
        id: i64,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Enqueue a job
    Enqueue {
        /// Handler dispatch key
        job_type: String,
        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
    },
    /// Manually retry a failed job
    Retry {
        /// Job id
        id: i64,
    },
    /// Cancel a job
    Cancel {
        /// Job id
        id: i64,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Install the baseline rule set
    Seed,
    /// Add a rule
    Add {
        /// Rule name
        name: String,
        /// Scope: tool, contract or agent
        #[arg(long)]
        scope: String,
        /// Target name or substring (`*` matches any)
        #[arg(long)]
        target: String,
        /// Effect: allow or deny
        #[arg(long)]
        effect: String,
        /// Lower priority evaluates first
        #[arg(long, default_value_t = 100)]
        priority: i64,
        /// Path substring blocklist (repeatable)
        #[arg(long = "blocked-path")]
        blocked_paths: Vec<String>,
        /// Command substring blocklist (repeatable)
        #[arg(long = "blocked-command")]
        blocked_commands: Vec<String>,
        /// Agent allowlist (repeatable)
        #[arg(long = "allow-agent")]
        allowed_agents: Vec<String>,
        /// Minimum context score for the rule to match
        #[arg(long)]
        min_score: Option<f64>,
        /// Require a separate human approval step
        #[arg(long)]
        require_human_approval: bool,
    },
    /// List all rules
    List,
    /// Run the fixed evaluator regression suite
    Selftest,
}

struct App {
    db: Db,
    board: Blackboard,
    jobs: JobQueue,
    policy: PolicyEngine,
    orchestrator: Arc<PipelineOrchestrator>,
    ctx: AgentContext,
}

impl App {
    fn build(config: &AtelierConfig) -> AtelierResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = Db::open(config.db_path())?;
        let events = EventBus::default();
        let board = Blackboard::new(db.clone(), events.clone());
        let policy = PolicyEngine::new(db.clone());
        let skills = SkillRegistry::new(db.clone());
        let jobs = JobQueue::new(db.clone());
        let tools = Arc::new(LocalTools::new(
            &config.project_root,
            &config.typecheck_command,
        ));
        let llm = Arc::new(HttpCompletionClient::new(config.model.clone())?);
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            db.clone(),
            board.clone(),
            tools.clone(),
            AuditRecorder::new(db.clone()),
            events,
        ));
        let ctx = AgentContext {
            board: board.clone(),
            llm,
            tools,
            policy: policy.clone(),
            skills,
            jobs: jobs.clone(),
        };
        Ok(Self {
            db,
            board,
            jobs,
            policy,
            orchestrator,
            ctx,
        })
    }

    async fn serve(&self) -> AtelierResult<()> {
        let mut runtime = AgentRuntime::new(self.board.clone());
        runtime.register(Arc::new(ArchitectAgent::new(self.ctx.clone())));
        runtime.register(Arc::new(GeneratorAgent::new(self.ctx.clone())));
        runtime.register(Arc::new(ValidatorAgent::new(self.ctx.clone())));
        runtime.register(Arc::new(ExecutorAgent::new(self.ctx.clone())));
        runtime.register(Arc::new(EvolutionAgent::new(self.ctx.clone())));
        runtime.register(Arc::new(ResearcherAgent::new(self.ctx.clone())));
        let runtime = Arc::new(runtime);
        runtime.start();

        let processor = Arc::new(JobProcessor::new(self.jobs.clone(), "atelier-serve"));
        processor.start();

        let cycle = Arc::new(EvolutionCycle::new(
            self.board.clone(),
            self.ctx.skills.clone(),
            AuditRecorder::new(self.db.clone()),
        ));
        cycle.start();

        // Resume monitors for pipelines that were mid-flight when the
        // previous process exited.
        for pipeline in self.orchestrator.recent_pipelines(50)? {
            if !pipeline.status.is_terminal() && pipeline.main_task_id.is_some() {
                self.orchestrator.spawn_monitor(pipeline.id);
            }
        }

        info!(agents = ?runtime.agent_names(), "Atelier serving; Ctrl-C to stop");
        tokio::signal::ctrl_c().await.map_err(AtelierError::Io)?;

        runtime.stop();
        processor.stop();
        cycle.stop();
        info!("Shut down");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> AtelierResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AtelierConfig::load(&cli.config)?;
    let app = App::build(&config)?;

    match cli.command {
        Commands::Serve => app.serve().await?,
        Commands::Pipeline { action } => match action {
            PipelineAction::Create {
                prompt,
                max_calls,
                max_time_ms,
                max_tokens,
                user,
            } => {
                let overrides = BudgetOverrides {
                    max_calls,
                    max_time_ms,
                    max_tokens,
                };
                let pipeline = app.orchestrator.create_pipeline(&prompt, &user, &overrides)?;
                let pipeline = app.orchestrator.start_pipeline(pipeline.id)?;
                println!(
                    "pipeline {} started (correlation {})",
                    pipeline.id, pipeline.correlation_id
                );
            }
            PipelineAction::Status { id } => {
                let pipeline = app
                    .orchestrator
                    .get_pipeline(id)?
                    .ok_or_else(|| AtelierError::Pipeline(format!("pipeline {id} not found")))?;
                println!("{}", serde_json::to_string_pretty(&pipeline)?);
            }
            PipelineAction::Approve { id, reviewer, files } => {
                let selected = if files.is_empty() { None } else { Some(files.as_slice()) };
                let outcome = app
                    .orchestrator
                    .approve_staging_changes(id, &reviewer, selected)
                    .await?;
                println!(
                    "applied: {:?}\nerrors: {:?}\nskipped: {:?}",
                    outcome.applied, outcome.errors, outcome.skipped
                );
            }
            PipelineAction::Reject { id, reviewer } => {
                app.orchestrator.reject_staging_changes(id, &reviewer)?;
                println!("pipeline {id} rejected");
            }
            PipelineAction::Rollback { id } => {
                let outcome = app.orchestrator.rollback_pipeline(id).await?;
                println!(
                    "restored: {:?}\nerrors: {:?}",
                    outcome.restored, outcome.errors
                );
            }
        },
        Commands::Task { action } => match action {
            TaskAction::Create {
                title,
                description,
                user,
            } => {
                let task = app
                    .board
                    .create_main_task(&title, &description, &user, serde_json::Value::Null)?;
                println!("task {} created", task.id);
            }
            TaskAction::Retry { id, reason } => match app.board.retry_task(id, &reason)? {
                Some(task) => println!("task {} re-queued (retry {})", task.id, task.retry_count()),
                None => println!("task {id} not retryable (not failed, or retry budget spent)"),
            },
            TaskAction::Show { id } => {
                let details = app
                    .board
                    .task_with_details(id)?
                    .ok_or_else(|| AtelierError::Blackboard(format!("task {id} not found")))?;
                println!("{}", serde_json::to_string_pretty(&details.task)?);
                println!(
                    "subtasks: {}, artifacts: {}, logs: {}",
                    details.subtasks.len(),
                    details.artifacts.len(),
                    details.logs.len()
                );
            }
        },
        Commands::Job { action } => match action {
            JobAction::Enqueue { job_type, payload } => {
                let payload: serde_json::Value = serde_json::from_str(&payload)?;
                let job = app.jobs.enqueue(NewJob::new(job_type, payload))?;
                println!("job {} enqueued", job.id);
            }
            JobAction::Retry { id } => {
                let job = app.jobs.retry_job(id)?;
                println!("job {} is now {}", job.id, job.status);
            }
            JobAction::Cancel { id } => {
                if app.jobs.cancel_job(id)? {
                    println!("job {id} cancelled");
                } else {
                    println!("job {id} already terminal");
                }
            }
        },
        Commands::Policy { action } => match action {
            PolicyAction::Seed => {
                seed_default_policies(&app.db)?;
                println!("baseline policies installed");
            }
            PolicyAction::Add {
                name,
                scope,
                target,
                effect,
                priority,
                blocked_paths,
                blocked_commands,
                allowed_agents,
                min_score,
                require_human_approval,
            } => {
                let scope = PolicyScope::parse(&scope)
                    .ok_or_else(|| AtelierError::Config(format!("unknown scope: {scope}")))?;
                let effect = PolicyEffect::parse(&effect)
                    .ok_or_else(|| AtelierError::Config(format!("unknown effect: {effect}")))?;
                let rule = app.db.insert_policy(&NewPolicyRule {
                    name,
                    scope,
                    target,
                    effect,
                    conditions: PolicyConditions {
                        blocked_paths,
                        blocked_commands,
                        allowed_agents,
                        min_score,
                        require_human_approval,
                    },
                    priority,
                })?;
                println!("policy {} added", rule.id);
            }
            PolicyAction::List => {
                for rule in app.db.list_policies()? {
                    println!(
                        "#{} [{}] {} {} {} (priority {}, active {})",
                        rule.id,
                        rule.scope.as_str(),
                        rule.effect.as_str(),
                        rule.name,
                        rule.target,
                        rule.priority,
                        rule.is_active
                    );
                }
            }
            PolicyAction::Selftest => {
                let outcomes = run_self_test(&app.policy);
                let mut failed = 0;
                for outcome in &outcomes {
                    let mark = if outcome.passed { "ok " } else { "FAIL" };
                    println!(
                        "{mark} {} (allowed={}, expected={})",
                        outcome.label, outcome.allowed, outcome.expect_allowed
                    );
                    if !outcome.passed {
                        failed += 1;
                    }
                }
                if failed > 0 {
                    return Err(AtelierError::Governance(format!(
                        "{failed}/{} self-test cases failed",
                        outcomes.len()
                    )));
                }
            }
        },
        Commands::Stats => {
            let stats = app.board.stats()?;
            println!(
                "tasks: {} pending, {} in progress, {} completed, {} failed",
                stats.tasks.pending,
                stats.tasks.in_progress,
                stats.tasks.completed,
                stats.tasks.failed
            );
            if let Some(age) = stats.tasks.oldest_claim_age_ms {
                println!("oldest unfinished claim: {age}ms ago");
            }
            println!("artifacts: {}, logs: {}", stats.artifacts, stats.logs);
            for (status, count) in app.jobs.status_counts()? {
                println!("jobs {status}: {count}");
            }
        }
    }
    Ok(())
}
