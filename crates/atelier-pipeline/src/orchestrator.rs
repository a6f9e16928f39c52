use atelier_blackboard::Blackboard;
use atelier_core::{
    AtelierError, AtelierResult, Budget, BudgetOverrides, EventBus, Phase, PhaseStatus, Pipeline,
    PipelineStatus, Runbook, StagingAction, SystemEvent, TaskStatus, ToolExecutor,
};
use atelier_governance::AuditRecorder;
use atelier_store::{Db, NewStagingChange};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Default per-pipeline monitor interval.
const MONITOR_INTERVAL: Duration = Duration::from_secs(3);

/// The five-phase workflow state machine, budget tracker and
/// staging/approval/rollback protocol.
///
/// One supervised monitor task per active pipeline, tracked in a
/// concurrency-safe map keyed by pipeline id with start-once /
/// stop-idempotent semantics.
pub struct PipelineOrchestrator {
    pub(crate) db: Db,
    pub(crate) board: Blackboard,
    pub(crate) tools: Arc<dyn ToolExecutor>,
    pub(crate) audit: AuditRecorder,
    pub(crate) events: EventBus,
    monitor_interval: Duration,
    monitors: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl PipelineOrchestrator {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        db: Db,
        board: Blackboard,
        tools: Arc<dyn ToolExecutor>,
        audit: AuditRecorder,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            board,
            tools,
            audit,
            events,
            monitor_interval: MONITOR_INTERVAL,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Override the monitor interval (tests use long ones and tick by
    /// hand).
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Create a pipeline: correlation id, five pending phases, default
    /// budget merged with caller overrides, empty runbook.
    pub fn create_pipeline(
        &self,
        prompt: &str,
        user_id: &str,
        overrides: &BudgetOverrides,
    ) -> AtelierResult<Pipeline> {
        let now = Utc::now();
        let pipeline = self.db.insert_pipeline(&Pipeline {
            id: 0,
            correlation_id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            status: PipelineStatus::Queued,
            current_phase: Phase::Design,
            main_task_id: None,
            phases: Pipeline::seed_phases(),
            budget: Budget::with_overrides(overrides),
            runbook: Runbook::default(),
            user_id: user_id.to_string(),
            created_at: now,
            started_at: None,
            updated_at: now,
            error: None,
        })?;
        info!(pipeline_id = pipeline.id, correlation_id = %pipeline.correlation_id, "Pipeline created");
        self.events.emit(SystemEvent::PipelineCreated {
            pipeline_id: pipeline.id,
        });
        Ok(pipeline)
    }

    /// Start a queued pipeline: create its root task, start phase 1 and
    /// spawn the polling monitor.
    pub fn start_pipeline(self: &Arc<Self>, id: i64) -> AtelierResult<Pipeline> {
        let mut pipeline = self.db.require_pipeline(id)?;
        if pipeline.status != PipelineStatus::Queued {
            return Err(AtelierError::Pipeline(format!(
                "pipeline {id} is {} and cannot be started",
                pipeline.status.as_str()
            )));
        }

        let main = self.board.create_main_task(
            &format!("Pipeline: {}", pipeline.prompt),
            &pipeline.prompt,
            &pipeline.user_id,
            json!({"pipeline_id": id}),
        )?;
        pipeline.main_task_id = Some(main.id);
        pipeline.status = PipelineStatus::Running;
        pipeline.started_at = Some(Utc::now());

        self.start_phase(&mut pipeline, Phase::Design)?;
        self.db.update_pipeline(&pipeline)?;
        self.events
            .emit(SystemEvent::PipelineStarted { pipeline_id: id });

        if !pipeline.status.is_terminal() {
            self.spawn_monitor(id);
        }
        info!(pipeline_id = id, main_task_id = main.id, "Pipeline started");
        self.db.require_pipeline(id)
    }

    /// Fetch a pipeline. The status snapshot consumers poll when event
    /// delivery lags.
    pub fn get_pipeline(&self, id: i64) -> AtelierResult<Option<Pipeline>> {
        self.db.get_pipeline(id)
    }

    /// Most recently created pipelines.
    pub fn recent_pipelines(&self, limit: usize) -> AtelierResult<Vec<Pipeline>> {
        self.db.recent_pipelines(limit)
    }

    /// Start one phase: budget check first, then bind or create the
    /// phase subtask. Mutates `pipeline` in memory; callers persist.
    pub(crate) fn start_phase(&self, pipeline: &mut Pipeline, phase: Phase) -> AtelierResult<()> {
        if let Some(reason) = self.check_budget(pipeline) {
            return self.fail_pipeline(pipeline, &reason);
        }
        pipeline.budget.used_calls += 1;

        let main_id = pipeline
            .main_task_id
            .ok_or_else(|| AtelierError::Pipeline("pipeline has no root task".into()))?;

        // An agent may already have chained this phase's subtask; bind
        // to it instead of creating a duplicate.
        let existing = self
            .db
            .children_of(main_id)?
            .into_iter()
            .find(|t| t.phase_tag() == Some(phase.as_str()));
        let task_id = match existing {
            Some(task) => task.id,
            None => {
                self.board
                    .create_subtask(
                        main_id,
                        &format!("{}: {}", phase, pipeline.prompt),
                        &pipeline.prompt,
                        phase.agent(),
                        vec![],
                        json!({"phase": phase.as_str(), "pipeline_id": pipeline.id}),
                    )?
                    .id
            }
        };

        pipeline.current_phase = phase;
        if let Some(state) = pipeline.phases.get_mut(&phase) {
            state.status = PhaseStatus::Running;
            state.task_id = Some(task_id);
            state.started_at = Some(Utc::now());
        }
        pipeline.runbook.record(
            phase,
            phase.agent(),
            "phase started",
            json!({"task_id": task_id, "call": pipeline.budget.used_calls}),
        );
        info!(pipeline_id = pipeline.id, phase = %phase, task_id, "Phase started");
        self.events.emit(SystemEvent::PhaseStarted {
            pipeline_id: pipeline.id,
            phase,
        });
        Ok(())
    }

    /// Budget check run before every phase start and on every monitor
    /// tick. Returns the breach reason, having set the sticky flag.
    fn check_budget(&self, pipeline: &mut Pipeline) -> Option<String> {
        if pipeline.budget.exceeded {
            // Sticky: once exceeded, always exceeded.
            return Some("budget already exceeded".to_string());
        }
        let started = pipeline.started_at.unwrap_or(pipeline.created_at);
        let elapsed_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        if elapsed_ms > pipeline.budget.max_time_ms {
            pipeline.budget.exceeded = true;
            return Some(format!(
                "time budget exceeded: {elapsed_ms}ms elapsed, limit {}ms",
                pipeline.budget.max_time_ms
            ));
        }
        if pipeline.budget.used_calls >= pipeline.budget.max_calls {
            pipeline.budget.exceeded = true;
            return Some(format!(
                "call budget exceeded: {} calls used, limit {}",
                pipeline.budget.used_calls, pipeline.budget.max_calls
            ));
        }
        None
    }

    /// Fail the pipeline with a reason and stop its monitor. Persists.
    pub(crate) fn fail_pipeline(&self, pipeline: &mut Pipeline, reason: &str) -> AtelierResult<()> {
        warn!(pipeline_id = pipeline.id, reason = %reason, "Pipeline failed");
        pipeline.status = PipelineStatus::Failed;
        pipeline.error = Some(reason.to_string());
        pipeline.runbook.record(
            pipeline.current_phase,
            "orchestrator",
            "pipeline failed",
            json!({"reason": reason}),
        );
        self.db.update_pipeline(pipeline)?;
        self.events.emit(SystemEvent::PipelineFailed {
            pipeline_id: pipeline.id,
            error: reason.to_string(),
        });
        self.stop_monitor(pipeline.id);
        Ok(())
    }

    /// One monitor pass. Returns `true` when the monitor should stop.
    /// Public so tests and single-shot callers can drive pipelines
    /// without the background task.
    pub async fn tick(&self, id: i64) -> AtelierResult<bool> {
        let mut pipeline = self.db.require_pipeline(id)?;
        if pipeline.status.is_terminal() {
            return Ok(true);
        }
        if let Some(reason) = self.check_budget(&mut pipeline) {
            self.fail_pipeline(&mut pipeline, &reason)?;
            return Ok(true);
        }

        let phase = pipeline.current_phase;
        let Some(task_id) = pipeline.phases.get(&phase).and_then(|s| s.task_id) else {
            // Nothing bound yet (e.g. a stalled chain); keep watching.
            return Ok(false);
        };
        let Some(task) = self.board.get_task(task_id)? else {
            self.fail_pipeline(&mut pipeline, &format!("phase task {task_id} vanished"))?;
            return Ok(true);
        };

        match task.status {
            TaskStatus::Failed => {
                let reason = task
                    .error_message
                    .unwrap_or_else(|| format!("phase task {task_id} failed"));
                self.fail_pipeline(&mut pipeline, &reason)?;
                Ok(true)
            }
            TaskStatus::Completed => {
                // Latch on the phase's recorded completion so one task
                // completion is processed exactly once, while a
                // re-completed (retried) task is picked up again.
                let already = pipeline.phases.get(&phase).and_then(|s| s.completed_at);
                let fresh = match (already, task.completed_at) {
                    (None, _) => true,
                    (Some(seen), Some(done)) => done > seen,
                    (Some(_), None) => false,
                };
                if !fresh {
                    return Ok(false);
                }
                self.on_phase_completed(&mut pipeline, phase, task.result.clone())
                    .await
            }
            TaskStatus::Pending | TaskStatus::InProgress => Ok(false),
        }
    }

    async fn on_phase_completed(
        &self,
        pipeline: &mut Pipeline,
        phase: Phase,
        result: Option<serde_json::Value>,
    ) -> AtelierResult<bool> {
        if let Some(state) = pipeline.phases.get_mut(&phase) {
            state.status = PhaseStatus::Completed;
            state.completed_at = Some(Utc::now());
            state.result = result.clone();
        }
        pipeline.runbook.record(
            phase,
            phase.agent(),
            "phase completed",
            result.clone().unwrap_or(serde_json::Value::Null),
        );
        self.events.emit(SystemEvent::PhaseCompleted {
            pipeline_id: pipeline.id,
            phase,
        });

        if phase == Phase::Validation {
            pipeline.runbook.validation = result.clone();
            let valid = result
                .as_ref()
                .and_then(|r| r.get("valid"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if !valid {
                // Normal terminal outcome of the validation phase: halt
                // advancement until the validation task is retried.
                pipeline.runbook.record(
                    phase,
                    phase.agent(),
                    "validation rejected; pipeline stalled",
                    json!({}),
                );
                warn!(pipeline_id = pipeline.id, "Validation rejected; awaiting retry");
                self.db.update_pipeline(pipeline)?;
                return Ok(false);
            }
        }

        if phase == Phase::Staging {
            let produced = self.produce_staging_changes(pipeline).await?;
            if produced > 0 {
                pipeline.status = PipelineStatus::StagingReview;
                pipeline.runbook.record(
                    phase,
                    "orchestrator",
                    "staging ready for review",
                    json!({"pending_changes": produced}),
                );
                self.db.update_pipeline(pipeline)?;
                self.events.emit(SystemEvent::StagingReady {
                    pipeline_id: pipeline.id,
                    change_count: produced,
                });
                info!(pipeline_id = pipeline.id, produced, "Staging review requested");
                return Ok(false);
            }
            // Nothing to review: skip straight to evolution.
            self.start_phase(pipeline, Phase::Evolution)?;
            self.db.update_pipeline(pipeline)?;
            return Ok(pipeline.status.is_terminal());
        }

        match phase.next() {
            Some(next) => {
                self.start_phase(pipeline, next)?;
                self.db.update_pipeline(pipeline)?;
                Ok(pipeline.status.is_terminal())
            }
            None => {
                pipeline.status = PipelineStatus::Completed;
                pipeline
                    .runbook
                    .record(phase, "orchestrator", "pipeline completed", json!({}));
                self.db.update_pipeline(pipeline)?;
                self.events.emit(SystemEvent::PipelineCompleted {
                    pipeline_id: pipeline.id,
                });
                info!(pipeline_id = pipeline.id, "Pipeline completed");
                Ok(true)
            }
        }
    }

    /// Turn every code artifact of the root task into one pending
    /// staging change, reading any pre-existing file content for the
    /// rollback baseline. Returns the number of changes produced.
    async fn produce_staging_changes(&self, pipeline: &mut Pipeline) -> AtelierResult<usize> {
        let Some(main_id) = pipeline.main_task_id else {
            return Ok(0);
        };
        let staging_task_id = pipeline
            .phases
            .get(&Phase::Staging)
            .and_then(|s| s.task_id)
            .unwrap_or(main_id);

        let code: Vec<_> = self
            .board
            .artifacts_for_task(main_id)?
            .into_iter()
            .filter(|a| a.kind == atelier_core::ArtifactKind::Code)
            .collect();

        let mut produced = 0;
        for artifact in &code {
            let read = self.tools.read_file(&artifact.name).await;
            let original = if read.success {
                read.text().map(str::to_string)
            } else {
                None
            };
            let action = if original.is_some() {
                StagingAction::Modify
            } else {
                StagingAction::Create
            };
            self.db.insert_staging_change(&NewStagingChange {
                pipeline_id: pipeline.id,
                task_id: staging_task_id,
                file_path: artifact.name.clone(),
                content: artifact.content.clone(),
                original_content: original,
                action,
            })?;
            produced += 1;
        }
        Ok(produced)
    }

    /// Spawn the per-pipeline monitor task. Start-once: a second call
    /// for the same pipeline id is a no-op.
    pub fn spawn_monitor(self: &Arc<Self>, id: i64) {
        let mut monitors = self.monitors.lock();
        if monitors.contains_key(&id) {
            return;
        }
        let orchestrator = Arc::clone(self);
        monitors.insert(
            id,
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(orchestrator.monitor_interval);
                loop {
                    ticker.tick().await;
                    match orchestrator.tick(id).await {
                        Ok(true) => {
                            orchestrator.monitors.lock().remove(&id);
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(pipeline_id = id, error = %e, "Monitor tick failed");
                        }
                    }
                }
            }),
        );
    }

    /// Stop a pipeline's monitor. Idempotent: stopping a monitor that
    /// is not running is a no-op.
    pub fn stop_monitor(&self, id: i64) {
        if let Some(handle) = self.monitors.lock().remove(&id) {
            handle.abort();
        }
    }

    /// Number of live monitors (observability).
    pub fn active_monitor_count(&self) -> usize {
        self.monitors.lock().len()
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        for (_, handle) in self.monitors.lock().drain() {
            handle.abort();
        }
    }
}
