//! Pipeline lifecycle: budget enforcement, staging review, approval
//! idempotence, duplicate-path resolution and rollback round-trips.
//!
//! Tests run on the single-threaded tokio runtime and stop the
//! background monitor right after start, driving ticks by hand for
//! determinism.

use async_trait::async_trait;
use atelier_blackboard::Blackboard;
use atelier_core::{
    ArtifactKind, BudgetOverrides, EventBus, Phase, Pipeline, PipelineStatus, StagingStatus,
    ToolExecutor, ToolOutcome,
};
use atelier_governance::AuditRecorder;
use atelier_pipeline::PipelineOrchestrator;
use atelier_store::Db;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Tool collaborator that records writes and commits against an
/// in-memory file map.
#[derive(Default)]
struct RecordingTools {
    files: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    commits: Mutex<Vec<Vec<String>>>,
}

impl RecordingTools {
    fn with_file(self, path: &str, content: &str) -> Self {
        self.files.lock().insert(path.into(), content.into());
        self
    }
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    async fn read_file(&self, path: &str) -> ToolOutcome {
        match self.files.lock().get(path) {
            Some(content) => ToolOutcome::ok(json!(content)),
            None => ToolOutcome::err("file not found"),
        }
    }
    async fn write_file(&self, path: &str, content: &str, _create_dirs: bool) -> ToolOutcome {
        self.writes.lock().push((path.into(), content.into()));
        self.files.lock().insert(path.into(), content.into());
        ToolOutcome::ok(json!(true))
    }
    async fn search_code(&self, _query: &str, _max_results: usize) -> ToolOutcome {
        ToolOutcome::ok(json!([]))
    }
    async fn typecheck(&self) -> ToolOutcome {
        ToolOutcome::ok(json!({"diagnostics": []}))
    }
    async fn git_local_commit(&self, _message: &str, files: &[String]) -> ToolOutcome {
        self.commits.lock().push(files.to_vec());
        ToolOutcome::ok(json!({"commit": "deadbeef"}))
    }
}

struct Harness {
    db: Db,
    board: Blackboard,
    tools: Arc<RecordingTools>,
    orchestrator: Arc<PipelineOrchestrator>,
}

fn harness(tools: RecordingTools) -> Harness {
    let db = Db::open_in_memory().unwrap();
    let board = Blackboard::new(db.clone(), EventBus::default());
    let tools = Arc::new(tools);
    let orchestrator = Arc::new(
        PipelineOrchestrator::new(
            db.clone(),
            board.clone(),
            tools.clone(),
            AuditRecorder::new(db.clone()),
            EventBus::default(),
        )
        .with_monitor_interval(Duration::from_secs(3600)),
    );
    Harness {
        db,
        board,
        tools,
        orchestrator,
    }
}

impl Harness {
    fn started_pipeline(&self, overrides: BudgetOverrides) -> Pipeline {
        let pipeline = self
            .orchestrator
            .create_pipeline("Add export button", "u1", &overrides)
            .unwrap();
        let pipeline = self.orchestrator.start_pipeline(pipeline.id).unwrap();
        // Drive ticks manually for determinism.
        self.orchestrator.stop_monitor(pipeline.id);
        pipeline
    }

    fn phase_task_id(&self, pipeline_id: i64, phase: Phase) -> i64 {
        let pipeline = self.db.require_pipeline(pipeline_id).unwrap();
        pipeline.phases[&phase].task_id.expect("phase task bound")
    }

    /// Complete the bound task for a phase and run one monitor tick.
    async fn finish_phase(&self, pipeline_id: i64, phase: Phase, result: serde_json::Value) {
        let task_id = self.phase_task_id(pipeline_id, phase);
        self.board.claim_task(task_id, phase.agent()).unwrap();
        self.board.complete_task(task_id, phase.agent(), result).unwrap();
        self.orchestrator.tick(pipeline_id).await.unwrap();
    }

    /// Drive a started pipeline through design/codegen/validation and
    /// complete the staging phase, leaving it in staging review (when
    /// code artifacts exist).
    async fn drive_to_staging_review(&self, pipeline_id: i64) {
        self.finish_phase(pipeline_id, Phase::Design, json!({})).await;
        self.finish_phase(pipeline_id, Phase::Codegen, json!({})).await;
        self.finish_phase(
            pipeline_id,
            Phase::Validation,
            json!({"valid": true, "score": 80.0}),
        )
        .await;
        self.finish_phase(pipeline_id, Phase::Staging, json!({"staged_files": []}))
            .await;
    }
}

#[tokio::test]
async fn call_budget_fails_pipeline_before_second_phase() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides {
        max_calls: Some(1),
        ..BudgetOverrides::default()
    });

    // Phase 1 consumed the only allowed call.
    let design_task = h.phase_task_id(pipeline.id, Phase::Design);
    h.board.claim_task(design_task, "architect").unwrap();
    h.board
        .complete_task(design_task, "architect", json!({}))
        .unwrap();
    let stopped = h.orchestrator.tick(pipeline.id).await.unwrap();
    assert!(stopped);

    let pipeline = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Failed);
    assert!(pipeline.error.unwrap().contains("call budget exceeded"));
    assert!(pipeline.budget.exceeded);
    // No task was created for phase 2.
    assert!(pipeline.phases[&Phase::Codegen].task_id.is_none());
    let children = h.db.children_of(pipeline.main_task_id.unwrap()).unwrap();
    assert!(children
        .iter()
        .all(|t| t.assigned_agent.as_deref() != Some("generator")));
}

#[tokio::test]
async fn budget_exceeded_is_sticky() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides {
        max_calls: Some(1),
        ..BudgetOverrides::default()
    });
    h.finish_phase(pipeline.id, Phase::Design, json!({})).await;

    let failed = h.db.require_pipeline(pipeline.id).unwrap();
    assert!(failed.budget.exceeded);

    // Further ticks observe the terminal state; exceeded never clears.
    assert!(h.orchestrator.tick(pipeline.id).await.unwrap());
    let still = h.db.require_pipeline(pipeline.id).unwrap();
    assert!(still.budget.exceeded);
    assert_eq!(still.status, PipelineStatus::Failed);
}

#[tokio::test]
async fn time_budget_breach_fails_on_tick() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides {
        max_time_ms: Some(0),
        ..BudgetOverrides::default()
    });

    // Any elapsed wall-clock now exceeds the zero allowance.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let stopped = h.orchestrator.tick(pipeline.id).await.unwrap();
    assert!(stopped);
    let pipeline = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Failed);
    assert!(pipeline.error.unwrap().contains("time budget exceeded"));
}

#[tokio::test]
async fn failed_phase_task_fails_pipeline() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let design_task = h.phase_task_id(pipeline.id, Phase::Design);
    h.board.claim_task(design_task, "architect").unwrap();
    h.board
        .fail_task(design_task, "architect", "completion service down")
        .unwrap();

    assert!(h.orchestrator.tick(pipeline.id).await.unwrap());
    let pipeline = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Failed);
    assert!(pipeline.error.unwrap().contains("completion service down"));
}

#[tokio::test]
async fn invalid_validation_stalls_without_next_phase() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    h.finish_phase(pipeline.id, Phase::Design, json!({})).await;
    h.finish_phase(pipeline.id, Phase::Codegen, json!({})).await;
    h.finish_phase(
        pipeline.id,
        Phase::Validation,
        json!({"valid": false, "score": 35.0}),
    )
    .await;

    let pipeline = h.db.require_pipeline(pipeline.id).unwrap();
    // Still running, still at validation, staging never started.
    assert_eq!(pipeline.status, PipelineStatus::Running);
    assert_eq!(pipeline.current_phase, Phase::Validation);
    assert!(pipeline.phases[&Phase::Staging].task_id.is_none());
    assert_eq!(pipeline.runbook.validation, Some(json!({"valid": false, "score": 35.0})));
}

#[tokio::test]
async fn staging_with_no_artifacts_skips_to_evolution() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    h.drive_to_staging_review(pipeline.id).await;

    let pipeline = h.db.require_pipeline(pipeline.id).unwrap();
    // No code artifacts were produced, so review is skipped entirely.
    assert_eq!(pipeline.status, PipelineStatus::Running);
    assert_eq!(pipeline.current_phase, Phase::Evolution);

    h.finish_phase(pipeline.id, Phase::Evolution, json!({})).await;
    let pipeline = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn staging_review_approve_apply_and_advance() {
    let tools = RecordingTools::default().with_file("src/export.rs", "old content");
    let h = harness(tools);
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();

    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/export.rs", "new content", "generator", json!({}))
        .unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/new_file.rs", "fresh", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;

    let pipeline_row = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline_row.status, PipelineStatus::StagingReview);
    let changes = h.db.staging_changes_for_pipeline(pipeline.id).unwrap();
    assert_eq!(changes.len(), 2);
    // Pre-existing file is a modify with its original captured.
    let modify = changes.iter().find(|c| c.file_path == "src/export.rs").unwrap();
    assert_eq!(modify.action, atelier_core::StagingAction::Modify);
    assert_eq!(modify.original_content.as_deref(), Some("old content"));
    let create = changes.iter().find(|c| c.file_path == "src/new_file.rs").unwrap();
    assert_eq!(create.action, atelier_core::StagingAction::Create);
    assert!(create.original_content.is_none());

    let outcome = h
        .orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", None)
        .await
        .unwrap();
    assert_eq!(outcome.applied.len(), 2);
    assert!(outcome.errors.is_empty());

    // One commit covered all applied files.
    assert_eq!(h.tools.commits.lock().len(), 1);
    assert_eq!(h.tools.commits.lock()[0].len(), 2);

    // The pipeline advanced out of review into evolution.
    let pipeline_row = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline_row.status, PipelineStatus::Running);
    assert_eq!(pipeline_row.current_phase, Phase::Evolution);
    assert!(pipeline_row.runbook.approval.is_some());
}

#[tokio::test]
async fn approve_twice_does_not_reapply() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/a.rs", "content", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;

    let first = h
        .orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", None)
        .await
        .unwrap();
    assert_eq!(first.applied, vec!["src/a.rs".to_string()]);
    let writes_after_first = h.tools.writes.lock().len();
    let commits_after_first = h.tools.commits.lock().len();

    // Second approval finds zero pending changes: nothing re-applied,
    // nothing re-committed.
    let second = h
        .orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", None)
        .await
        .unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(h.tools.writes.lock().len(), writes_after_first);
    assert_eq!(h.tools.commits.lock().len(), commits_after_first);
}

#[tokio::test]
async fn duplicate_paths_newest_wins_older_applied_without_write() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();
    // Two successive versions of the same logical file.
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/dup.rs", "version one", "generator", json!({}))
        .unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/dup.rs", "version two", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;

    let changes = h.db.staging_changes_for_pipeline(pipeline.id).unwrap();
    assert_eq!(changes.len(), 2);

    let outcome = h
        .orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", None)
        .await
        .unwrap();
    assert_eq!(outcome.applied, vec!["src/dup.rs".to_string()]);
    assert_eq!(outcome.skipped.len(), 1);

    // Exactly one write, carrying the newest content.
    let writes = h.tools.writes.lock();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, "version two");
    drop(writes);

    // Both rows are applied; the older one without a write.
    let changes = h.db.staging_changes_for_pipeline(pipeline.id).unwrap();
    assert!(changes.iter().all(|c| c.status == StagingStatus::Applied));
}

#[tokio::test]
async fn protected_files_fail_and_propagate_to_duplicates() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "Cargo.toml", "[package] v1", "generator", json!({}))
        .unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "Cargo.toml", "[package] v2", "generator", json!({}))
        .unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/ok.rs", "fine", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;

    let outcome = h
        .orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", None)
        .await
        .unwrap();
    assert_eq!(outcome.applied, vec!["src/ok.rs".to_string()]);
    assert_eq!(outcome.errors, vec!["Cargo.toml".to_string()]);

    // The protected file was never written; every duplicate failed.
    let writes = h.tools.writes.lock();
    assert!(writes.iter().all(|(path, _)| path != "Cargo.toml"));
    drop(writes);
    let changes = h.db.staging_changes_for_pipeline(pipeline.id).unwrap();
    for change in changes.iter().filter(|c| c.file_path == "Cargo.toml") {
        assert_eq!(change.status, StagingStatus::Failed);
    }
}

#[tokio::test]
async fn selected_files_filter_limits_approval() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/a.rs", "a", "generator", json!({}))
        .unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/b.rs", "b", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;

    let selected = vec!["src/a.rs".to_string()];
    let outcome = h
        .orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", Some(&selected))
        .await
        .unwrap();
    assert_eq!(outcome.applied, vec!["src/a.rs".to_string()]);

    // The unselected change is still pending and the pipeline stays in
    // review.
    let pending = h
        .db
        .staging_changes_with_status(pipeline.id, StagingStatus::Pending)
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].file_path, "src/b.rs");
    let pipeline_row = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline_row.status, PipelineStatus::StagingReview);
}

#[tokio::test]
async fn rollback_restores_original_content() {
    let tools = RecordingTools::default().with_file("src/export.rs", "original c0");
    let h = harness(tools);
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/export.rs", "changed c1", "generator", json!({}))
        .unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/brand_new.rs", "new file", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;
    h.orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", None)
        .await
        .unwrap();
    assert_eq!(h.tools.files.lock()["src/export.rs"], "changed c1");

    let outcome = h.orchestrator.rollback_pipeline(pipeline.id).await.unwrap();
    assert_eq!(outcome.restored.len(), 2);
    assert!(outcome.errors.is_empty());

    // The modified file is back to exactly its original content; the
    // created file counted as reverted without a restore write.
    assert_eq!(h.tools.files.lock()["src/export.rs"], "original c0");
    let changes = h.db.staging_changes_for_pipeline(pipeline.id).unwrap();
    assert!(changes.iter().all(|c| c.status == StagingStatus::RolledBack));

    let pipeline_row = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline_row.status, PipelineStatus::Failed);
    assert!(pipeline_row.error.unwrap().contains("rolled back"));
}

#[tokio::test]
async fn reject_marks_pending_and_fails_pipeline() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/a.rs", "a", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;

    h.orchestrator
        .reject_staging_changes(pipeline.id, "reviewer")
        .unwrap();

    let changes = h.db.staging_changes_for_pipeline(pipeline.id).unwrap();
    assert!(changes.iter().all(|c| c.status == StagingStatus::Rejected));
    let pipeline_row = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline_row.status, PipelineStatus::Failed);
    assert!(pipeline_row.error.unwrap().contains("rejected"));
    // Nothing was ever written.
    assert!(h.tools.writes.lock().is_empty());
}

#[tokio::test]
async fn monitor_start_once_and_stop_idempotent() {
    let h = harness(RecordingTools::default());
    let pipeline = h
        .orchestrator
        .create_pipeline("x", "u1", &BudgetOverrides::default())
        .unwrap();
    let pipeline = h.orchestrator.start_pipeline(pipeline.id).unwrap();

    assert_eq!(h.orchestrator.active_monitor_count(), 1);
    // Start-once: a second spawn for the same id is a no-op.
    h.orchestrator.spawn_monitor(pipeline.id);
    assert_eq!(h.orchestrator.active_monitor_count(), 1);

    h.orchestrator.stop_monitor(pipeline.id);
    h.orchestrator.stop_monitor(pipeline.id);
    assert_eq!(h.orchestrator.active_monitor_count(), 0);
}

#[tokio::test]
async fn full_run_reconstructable_from_runbook() {
    let h = harness(RecordingTools::default());
    let pipeline = h.started_pipeline(BudgetOverrides::default());
    let main_id = h.db.require_pipeline(pipeline.id).unwrap().main_task_id.unwrap();
    h.board
        .add_artifact(main_id, ArtifactKind::Code, "src/a.rs", "a", "generator", json!({}))
        .unwrap();
    h.drive_to_staging_review(pipeline.id).await;
    h.orchestrator
        .approve_staging_changes(pipeline.id, "reviewer", None)
        .await
        .unwrap();
    h.finish_phase(pipeline.id, Phase::Evolution, json!({})).await;

    let pipeline_row = h.db.require_pipeline(pipeline.id).unwrap();
    assert_eq!(pipeline_row.status, PipelineStatus::Completed);

    // The runbook alone narrates the whole run: every phase start and
    // completion, the validation snapshot and the approval.
    let runbook = pipeline_row.runbook;
    for phase in Phase::ALL {
        assert!(
            runbook
                .decisions
                .iter()
                .any(|d| d.phase == phase && d.decision == "phase started"),
            "missing start entry for {phase}"
        );
    }
    assert!(runbook.validation.is_some());
    let approval = runbook.approval.unwrap();
    assert_eq!(approval.reviewer, "reviewer");
    assert_eq!(approval.applied, vec!["src/a.rs".to_string()]);
}
