use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error (may still be retried manually).
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Retry budget exhausted; will never be retried automatically.
    DeadLetter,
}

impl JobStatus {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "dead_letter" => Some(JobStatus::DeadLetter),
            _ => None,
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLetter
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generic queued unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Row id assigned by the store.
    pub id: i64,
    /// Handler dispatch key.
    pub job_type: String,
    /// Higher priority is claimed first.
    pub priority: i64,
    /// Opaque structured input.
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Times a worker has claimed this job.
    pub attempts: u32,
    /// Retry cap; reaching it converts failures to dead letters.
    pub max_attempts: u32,
    /// Worker currently (or last) bound to the job.
    pub assigned_agent: Option<String>,
    /// The job is not claimable before this instant.
    pub scheduled_at: DateTime<Utc>,
    /// Output, set on completion.
    pub result: Option<serde_json::Value>,
    /// Error message, set on failure.
    pub error: Option<String>,
    /// Spawning job, if any.
    pub parent_job_id: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Parameters for enqueueing a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Handler dispatch key.
    pub job_type: String,
    /// Higher priority is claimed first.
    pub priority: i64,
    /// Opaque structured input.
    pub payload: serde_json::Value,
    /// Retry cap.
    pub max_attempts: u32,
    /// Earliest claimable instant; `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Spawning job, if any.
    pub parent_job_id: Option<i64>,
}

impl NewJob {
    /// A job of the given type claimable immediately, with default
    /// priority 0 and three attempts.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            priority: 0,
            payload,
            max_attempts: 3,
            scheduled_at: None,
            parent_job_id: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry cap.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay the job until the given instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::DeadLetter,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_new_job_builder() {
        let job = NewJob::new("reindex", serde_json::json!({"shard": 3}))
            .with_priority(5)
            .with_max_attempts(1);
        assert_eq!(job.job_type, "reindex");
        assert_eq!(job.priority, 5);
        assert_eq!(job.max_attempts, 1);
        assert!(job.scheduled_at.is_none());
    }
}
