use crate::orchestrator::PipelineOrchestrator;
use atelier_core::{
    is_protected_path, ApprovalRecord, AtelierResult, AuditDecision, NewAuditEntry, Phase,
    PipelineStatus, StagingChange, StagingStatus, SystemEvent,
};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Result of one staging approval pass.
#[derive(Debug, Clone, Default)]
pub struct ApproveOutcome {
    /// Paths written and committed.
    pub applied: Vec<String>,
    /// Paths that failed (protected files, write errors).
    pub errors: Vec<String>,
    /// Paths skipped: superseded duplicates or filtered out.
    pub skipped: Vec<String>,
}

/// Result of one rollback pass.
#[derive(Debug, Clone, Default)]
pub struct RollbackOutcome {
    /// Paths restored to their original content.
    pub restored: Vec<String>,
    /// Paths whose restore write failed.
    pub errors: Vec<String>,
}

/// Group pending changes by path, newest (highest id) first within each
/// group.
fn group_by_path(changes: Vec<StagingChange>) -> BTreeMap<String, Vec<StagingChange>> {
    let mut groups: BTreeMap<String, Vec<StagingChange>> = BTreeMap::new();
    for change in changes {
        groups.entry(change.file_path.clone()).or_default().push(change);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|c| std::cmp::Reverse(c.id));
    }
    groups
}

impl PipelineOrchestrator {
    /// Approve pending staging changes, optionally filtered to
    /// `selected_files`. Duplicate paths resolve newest-wins; protected
    /// files always fail; one commit covers everything applied. With no
    /// pending changes left, the pipeline advances out of review.
    pub async fn approve_staging_changes(
        &self,
        pipeline_id: i64,
        reviewer: &str,
        selected_files: Option<&[String]>,
    ) -> AtelierResult<ApproveOutcome> {
        let mut pipeline = self.db.require_pipeline(pipeline_id)?;
        let pending = self
            .db
            .staging_changes_with_status(pipeline_id, StagingStatus::Pending)?;
        let filtered: Vec<StagingChange> = pending
            .into_iter()
            .filter(|c| {
                selected_files.map_or(true, |selected| selected.contains(&c.file_path))
            })
            .collect();

        let mut outcome = ApproveOutcome::default();
        for (path, group) in group_by_path(filtered) {
            let mut group = group.into_iter();
            let Some(winner) = group.next() else { continue };
            let duplicates: Vec<StagingChange> = group.collect();

            // Older duplicates are superseded: applied without a write.
            for duplicate in &duplicates {
                self.db
                    .set_staging_status(duplicate.id, StagingStatus::Applied, Some(reviewer))?;
                outcome.skipped.push(format!("{path}#{}", duplicate.id));
            }

            if is_protected_path(&path) {
                warn!(path = %path, "Protected file refused at approval");
                self.db
                    .set_staging_status(winner.id, StagingStatus::Failed, Some(reviewer))?;
                // The same outcome propagates to the path-duplicates.
                for duplicate in &duplicates {
                    self.db
                        .set_staging_status(duplicate.id, StagingStatus::Failed, Some(reviewer))?;
                }
                outcome.errors.push(path);
                continue;
            }

            let write = self
                .tools
                .write_file(&path, &winner.content, true)
                .await;
            if write.success {
                self.db
                    .set_staging_status(winner.id, StagingStatus::Applied, Some(reviewer))?;
                outcome.applied.push(path);
            } else {
                warn!(
                    path = %path,
                    error = write.error.as_deref().unwrap_or("unknown"),
                    "Staged write failed"
                );
                self.db
                    .set_staging_status(winner.id, StagingStatus::Failed, Some(reviewer))?;
                outcome.errors.push(path);
            }
        }

        let committed = if outcome.applied.is_empty() {
            false
        } else {
            let commit = self
                .tools
                .git_local_commit(
                    &format!("Apply staged changes for pipeline {pipeline_id}"),
                    &outcome.applied,
                )
                .await;
            if !commit.success {
                warn!(
                    pipeline_id,
                    error = commit.error.as_deref().unwrap_or("unknown"),
                    "Commit of applied files failed"
                );
            }
            commit.success
        };

        pipeline.runbook.approval = Some(ApprovalRecord {
            reviewer: reviewer.to_string(),
            applied: outcome.applied.clone(),
            errors: outcome.errors.clone(),
            skipped: outcome.skipped.clone(),
            approved_at: Utc::now(),
        });
        pipeline.runbook.record(
            Phase::Staging,
            "orchestrator",
            "staging approved",
            json!({
                "reviewer": reviewer,
                "applied": outcome.applied,
                "errors": outcome.errors,
                "committed": committed,
            }),
        );
        self.audit.record(NewAuditEntry::new(
            reviewer,
            "approve_staging",
            format!("pipeline {pipeline_id}"),
            AuditDecision::Executed,
            format!(
                "{} applied, {} errored, {} skipped",
                outcome.applied.len(),
                outcome.errors.len(),
                outcome.skipped.len()
            ),
        ));
        self.events.emit(SystemEvent::StagingApproved {
            pipeline_id,
            applied: outcome.applied.clone(),
        });

        let remaining = self
            .db
            .staging_changes_with_status(pipeline_id, StagingStatus::Pending)?
            .len();
        if remaining == 0 && pipeline.status == PipelineStatus::StagingReview {
            if pipeline.main_task_id.is_some() {
                pipeline.status = PipelineStatus::Running;
                self.start_phase(&mut pipeline, Phase::Evolution)?;
            } else {
                pipeline.status = PipelineStatus::Completed;
            }
        }
        self.db.update_pipeline(&pipeline)?;
        info!(
            pipeline_id,
            applied = outcome.applied.len(),
            errors = outcome.errors.len(),
            "Staging approval processed"
        );
        Ok(outcome)
    }

    /// Reject every pending change and fail the pipeline.
    pub fn reject_staging_changes(&self, pipeline_id: i64, reviewer: &str) -> AtelierResult<()> {
        let mut pipeline = self.db.require_pipeline(pipeline_id)?;
        let pending = self
            .db
            .staging_changes_with_status(pipeline_id, StagingStatus::Pending)?;
        for change in &pending {
            self.db
                .set_staging_status(change.id, StagingStatus::Rejected, Some(reviewer))?;
        }
        self.audit.record(NewAuditEntry::new(
            reviewer,
            "reject_staging",
            format!("pipeline {pipeline_id}"),
            AuditDecision::Executed,
            format!("{} pending changes rejected", pending.len()),
        ));
        self.events
            .emit(SystemEvent::StagingRejected { pipeline_id });
        self.fail_pipeline(&mut pipeline, "staging changes rejected by reviewer")
    }

    /// Restore every applied change to its original content, one commit
    /// for all restored files, and fail the pipeline with a rollback
    /// annotation.
    pub async fn rollback_pipeline(&self, pipeline_id: i64) -> AtelierResult<RollbackOutcome> {
        let mut pipeline = self.db.require_pipeline(pipeline_id)?;
        let applied = self
            .db
            .staging_changes_with_status(pipeline_id, StagingStatus::Applied)?;

        let mut outcome = RollbackOutcome::default();
        let mut written = Vec::new();
        for (path, group) in group_by_path(applied) {
            // The newest applied change per path carries the baseline;
            // superseded duplicates just flip state.
            let mut group = group.into_iter();
            let Some(winner) = group.next() else { continue };

            let restored = match &winner.original_content {
                Some(original) => {
                    let write = self.tools.write_file(&path, original, false).await;
                    if write.success {
                        written.push(path.clone());
                        true
                    } else {
                        warn!(
                            path = %path,
                            error = write.error.as_deref().unwrap_or("unknown"),
                            "Rollback write failed"
                        );
                        outcome.errors.push(path.clone());
                        false
                    }
                }
                // A created file has nothing to restore but still
                // counts as reverted.
                None => true,
            };
            if restored {
                self.db
                    .set_staging_status(winner.id, StagingStatus::RolledBack, None)?;
                for duplicate in group {
                    self.db
                        .set_staging_status(duplicate.id, StagingStatus::RolledBack, None)?;
                }
                outcome.restored.push(path);
            }
        }

        if !written.is_empty() {
            let commit = self
                .tools
                .git_local_commit(&format!("Rollback pipeline {pipeline_id}"), &written)
                .await;
            if !commit.success {
                warn!(
                    pipeline_id,
                    error = commit.error.as_deref().unwrap_or("unknown"),
                    "Rollback commit failed"
                );
            }
        }

        pipeline.runbook.record(
            Phase::Staging,
            "orchestrator",
            "staging rolled back",
            json!({"restored": outcome.restored, "errors": outcome.errors}),
        );
        self.events.emit(SystemEvent::RolledBack {
            pipeline_id,
            restored: outcome.restored.clone(),
        });
        self.fail_pipeline(
            &mut pipeline,
            &format!(
                "rolled back: {} files restored, {} errors",
                outcome.restored.len(),
                outcome.errors.len()
            ),
        )?;
        Ok(outcome)
    }
}
