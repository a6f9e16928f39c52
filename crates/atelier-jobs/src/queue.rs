use atelier_core::{AtelierResult, Job, JobStatus, NewJob};
use atelier_store::{AgentSummary, Db};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// The hour bucket key used for rolling agent metrics.
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}

/// Claim-based job queue over the shared store.
#[derive(Clone)]
pub struct JobQueue {
    db: Db,
}

impl JobQueue {
    /// Wrap a store handle.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert one job as pending.
    pub fn enqueue(&self, new: NewJob) -> AtelierResult<Job> {
        let job = self.db.insert_job(&new)?;
        debug!(job_id = job.id, job_type = %job.job_type, "Job enqueued");
        Ok(job)
    }

    /// Insert a batch of jobs as pending.
    pub fn enqueue_many(&self, jobs: Vec<NewJob>) -> AtelierResult<Vec<Job>> {
        jobs.into_iter().map(|j| self.enqueue(j)).collect()
    }

    /// Claim the best available pending job for a worker, optionally
    /// restricted to specific job types. Returns `None` when nothing is
    /// claimable. Concurrent callers never receive the same job; a row
    /// lost to another claimer is skipped, not awaited.
    pub fn claim_job(
        &self,
        worker_id: &str,
        types: Option<&[String]>,
    ) -> AtelierResult<Option<Job>> {
        let claimed = self.db.claim_next_job(worker_id, types)?;
        if let Some(job) = &claimed {
            debug!(job_id = job.id, worker = %worker_id, attempt = job.attempts, "Job claimed");
        }
        Ok(claimed)
    }

    /// Complete a job with its result.
    pub fn complete_job(&self, id: i64, result: &serde_json::Value) -> AtelierResult<Job> {
        let job = self.db.mark_job_completed(id, result)?;
        debug!(job_id = id, "Job completed");
        Ok(job)
    }

    /// Mark a job failed without consuming its retry budget decision.
    pub fn fail_job(&self, id: i64, error: &str) -> AtelierResult<Job> {
        warn!(job_id = id, error = %error, "Job failed");
        self.db.mark_job_failed(id, error)
    }

    /// Resolve a handler failure: re-queue while attempts remain
    /// (assignment history preserved), dead-letter on exhaustion.
    pub fn handle_failure(&self, job: &Job, error: &str) -> AtelierResult<Job> {
        if job.attempts < job.max_attempts {
            debug!(
                job_id = job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                "Job re-queued after failure"
            );
            self.db.requeue_job(job.id, Some(error))
        } else {
            warn!(job_id = job.id, attempts = job.attempts, "Job dead-lettered");
            self.db.dead_letter_job(job.id, error)
        }
    }

    /// Manually re-queue a failed job under the same attempt cap;
    /// converts to dead letter when the cap is already reached.
    pub fn retry_job(&self, id: i64) -> AtelierResult<Job> {
        let job = self.db.require_job(id)?;
        if job.status != JobStatus::Failed {
            return Ok(job);
        }
        if job.attempts >= job.max_attempts {
            warn!(job_id = id, "Retry refused: attempt cap reached; dead-lettering");
            return self
                .db
                .dead_letter_job(id, job.error.as_deref().unwrap_or("retry budget exhausted"));
        }
        info!(job_id = id, "Job manually re-queued");
        self.db.requeue_job(id, None)
    }

    /// Cancel a job that has not finished.
    pub fn cancel_job(&self, id: i64) -> AtelierResult<bool> {
        self.db.cancel_job(id)
    }

    /// Fetch one job.
    pub fn get_job(&self, id: i64) -> AtelierResult<Option<Job>> {
        self.db.get_job(id)
    }

    /// Job counts per status.
    pub fn status_counts(&self) -> AtelierResult<Vec<(String, u64)>> {
        self.db.job_status_counts()
    }

    /// Record rolling per-agent throughput for the current hour bucket.
    /// Observability only; nothing branches on these numbers.
    pub fn record_agent_metrics(
        &self,
        agent_name: &str,
        completed: u64,
        failed: u64,
        duration_ms: u64,
    ) -> AtelierResult<()> {
        self.db
            .record_agent_metrics(agent_name, &hour_bucket(Utc::now()), completed, failed, duration_ms)
    }

    /// Aggregate summary for one agent.
    pub fn get_agent_summary(&self, agent_name: &str) -> AtelierResult<AgentSummary> {
        self.db.agent_summary(agent_name)
    }
}
