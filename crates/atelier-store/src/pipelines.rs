use crate::db::{bad_column, from_ms, opt_from_ms, to_ms, Db};
use atelier_core::{
    AtelierError, AtelierResult, Pipeline, PipelineStatus, Phase, StagingAction, StagingChange,
    StagingStatus,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

const PIPELINE_COLUMNS: &str = "id, correlation_id, prompt, status, current_phase, \
     main_task_id, phases, budget, runbook, user_id, created_at, started_at, updated_at, error";

fn map_pipeline(row: &Row<'_>) -> rusqlite::Result<Pipeline> {
    let correlation_raw: String = row.get(1)?;
    let status_raw: String = row.get(3)?;
    let phase_raw: String = row.get(4)?;
    let phases_raw: String = row.get(6)?;
    let budget_raw: String = row.get(7)?;
    let runbook_raw: String = row.get(8)?;
    Ok(Pipeline {
        id: row.get(0)?,
        correlation_id: Uuid::parse_str(&correlation_raw)
            .map_err(|_| bad_column("correlation_id", &correlation_raw))?,
        prompt: row.get(2)?,
        status: PipelineStatus::parse(&status_raw)
            .ok_or_else(|| bad_column("status", &status_raw))?,
        current_phase: Phase::parse(&phase_raw)
            .ok_or_else(|| bad_column("current_phase", &phase_raw))?,
        main_task_id: row.get(5)?,
        phases: serde_json::from_str(&phases_raw)
            .map_err(|_| bad_column("phases", &phases_raw))?,
        budget: serde_json::from_str(&budget_raw)
            .map_err(|_| bad_column("budget", &budget_raw))?,
        runbook: serde_json::from_str(&runbook_raw)
            .map_err(|_| bad_column("runbook", &runbook_raw))?,
        user_id: row.get(9)?,
        created_at: from_ms(row.get(10)?),
        started_at: opt_from_ms(row.get(11)?),
        updated_at: from_ms(row.get(12)?),
        error: row.get(13)?,
    })
}

const STAGING_COLUMNS: &str = "id, pipeline_id, task_id, file_path, content, \
     original_content, action, status, reviewed_by, reviewed_at, applied_at, \
     rolled_back_at, created_at";

fn map_staging(row: &Row<'_>) -> rusqlite::Result<StagingChange> {
    let action_raw: String = row.get(6)?;
    let status_raw: String = row.get(7)?;
    Ok(StagingChange {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        task_id: row.get(2)?,
        file_path: row.get(3)?,
        content: row.get(4)?,
        original_content: row.get(5)?,
        action: StagingAction::parse(&action_raw)
            .ok_or_else(|| bad_column("action", &action_raw))?,
        status: StagingStatus::parse(&status_raw)
            .ok_or_else(|| bad_column("status", &status_raw))?,
        reviewed_by: row.get(8)?,
        reviewed_at: opt_from_ms(row.get(9)?),
        applied_at: opt_from_ms(row.get(10)?),
        rolled_back_at: opt_from_ms(row.get(11)?),
        created_at: from_ms(row.get(12)?),
    })
}

/// Parameters for inserting a staging change row.
#[derive(Debug, Clone)]
pub struct NewStagingChange {
    /// Pipeline the change belongs to.
    pub pipeline_id: i64,
    /// Task that produced the underlying artifact.
    pub task_id: i64,
    /// Target path relative to the project root.
    pub file_path: String,
    /// Proposed content.
    pub content: String,
    /// Previous content; `None` for new files.
    pub original_content: Option<String>,
    /// Create or modify.
    pub action: StagingAction,
}

impl Db {
    /// Insert a pipeline row and return it with its assigned id.
    pub fn insert_pipeline(&self, pipeline: &Pipeline) -> AtelierResult<Pipeline> {
        let now = to_ms(Utc::now());
        let phases = serde_json::to_string(&pipeline.phases)?;
        let budget = serde_json::to_string(&pipeline.budget)?;
        let runbook = serde_json::to_string(&pipeline.runbook)?;
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO pipelines (correlation_id, prompt, status, current_phase, \
                 main_task_id, phases, budget, runbook, user_id, created_at, updated_at, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
                params![
                    pipeline.correlation_id.to_string(),
                    pipeline.prompt,
                    pipeline.status.as_str(),
                    pipeline.current_phase.as_str(),
                    pipeline.main_task_id,
                    phases,
                    budget,
                    runbook,
                    pipeline.user_id,
                    now,
                    pipeline.error,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.require_pipeline(id)
    }

    /// Fetch a pipeline by id.
    pub fn get_pipeline(&self, id: i64) -> AtelierResult<Option<Pipeline>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = ?1"),
                params![id],
                map_pipeline,
            )
            .optional()
        })
    }

    /// Fetch a pipeline that must exist.
    pub fn require_pipeline(&self, id: i64) -> AtelierResult<Pipeline> {
        self.get_pipeline(id)?
            .ok_or_else(|| AtelierError::Store(format!("pipeline {id} not found")))
    }

    /// Persist the full mutable state of a pipeline.
    pub fn update_pipeline(&self, pipeline: &Pipeline) -> AtelierResult<()> {
        let now = to_ms(Utc::now());
        let phases = serde_json::to_string(&pipeline.phases)?;
        let budget = serde_json::to_string(&pipeline.budget)?;
        let runbook = serde_json::to_string(&pipeline.runbook)?;
        self.with(|conn| {
            conn.execute(
                "UPDATE pipelines SET status = ?2, current_phase = ?3, main_task_id = ?4, \
                 phases = ?5, budget = ?6, runbook = ?7, started_at = ?8, updated_at = ?9, \
                 error = ?10 WHERE id = ?1",
                params![
                    pipeline.id,
                    pipeline.status.as_str(),
                    pipeline.current_phase.as_str(),
                    pipeline.main_task_id,
                    phases,
                    budget,
                    runbook,
                    pipeline.started_at.map(to_ms),
                    now,
                    pipeline.error,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recently created pipelines.
    pub fn recent_pipelines(&self, limit: usize) -> AtelierResult<Vec<Pipeline>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PIPELINE_COLUMNS} FROM pipelines ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], map_pipeline)?;
            rows.collect()
        })
    }

    /// Insert a staging change as `pending`.
    pub fn insert_staging_change(&self, new: &NewStagingChange) -> AtelierResult<StagingChange> {
        let now = to_ms(Utc::now());
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO staging_changes (pipeline_id, task_id, file_path, content, \
                 original_content, action, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                params![
                    new.pipeline_id,
                    new.task_id,
                    new.file_path,
                    new.content,
                    new.original_content,
                    new.action.as_str(),
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {STAGING_COLUMNS} FROM staging_changes WHERE id = ?1"),
                params![id],
                map_staging,
            )
        })
    }

    /// All staging changes for a pipeline, oldest first.
    pub fn staging_changes_for_pipeline(
        &self,
        pipeline_id: i64,
    ) -> AtelierResult<Vec<StagingChange>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STAGING_COLUMNS} FROM staging_changes \
                 WHERE pipeline_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![pipeline_id], map_staging)?;
            rows.collect()
        })
    }

    /// Staging changes for a pipeline in a given state, oldest first.
    pub fn staging_changes_with_status(
        &self,
        pipeline_id: i64,
        status: StagingStatus,
    ) -> AtelierResult<Vec<StagingChange>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STAGING_COLUMNS} FROM staging_changes \
                 WHERE pipeline_id = ?1 AND status = ?2 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![pipeline_id, status.as_str()], map_staging)?;
            rows.collect()
        })
    }

    /// Transition a staging change, recording the reviewer and the
    /// status-specific timestamp.
    pub fn set_staging_status(
        &self,
        id: i64,
        status: StagingStatus,
        reviewed_by: Option<&str>,
    ) -> AtelierResult<()> {
        let now = to_ms(Utc::now());
        let applied_at = (status == StagingStatus::Applied).then_some(now);
        let rolled_back_at = (status == StagingStatus::RolledBack).then_some(now);
        self.with(|conn| {
            conn.execute(
                "UPDATE staging_changes SET status = ?2, \
                 reviewed_by = COALESCE(?3, reviewed_by), \
                 reviewed_at = CASE WHEN ?3 IS NULL THEN reviewed_at ELSE ?4 END, \
                 applied_at = COALESCE(?5, applied_at), \
                 rolled_back_at = COALESCE(?6, rolled_back_at) \
                 WHERE id = ?1",
                params![id, status.as_str(), reviewed_by, now, applied_at, rolled_back_at],
            )?;
            Ok(())
        })
    }
}
