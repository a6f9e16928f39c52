use crate::queue::JobQueue;
use async_trait::async_trait;
use atelier_core::{AtelierResult, Job};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Jobs claimed per handler per tick.
const CLAIM_BATCH: usize = 5;

/// Default processing interval.
const PROCESS_INTERVAL: Duration = Duration::from_secs(10);

/// One job-type handler. Implementations must be cheap to share.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one claimed job and return its result payload.
    async fn run(&self, job: &Job) -> AtelierResult<serde_json::Value>;
}

/// Background loop that claims and executes jobs for registered
/// handlers. A handler error consumes one attempt: the job is re-queued
/// while attempts remain and dead-lettered afterwards.
pub struct JobProcessor {
    queue: JobQueue,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    worker_id: String,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobProcessor {
    /// Create a processor with the default 10 s interval.
    pub fn new(queue: JobQueue, worker_id: impl Into<String>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            worker_id: worker_id.into(),
            interval: PROCESS_INTERVAL,
            handle: Mutex::new(None),
        }
    }

    /// Override the processing interval (tests use short ones).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Register a handler for a job type. Later registrations replace
    /// earlier ones.
    pub fn register_handler(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// The queue this processor drains.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// One processing pass: claim up to [`CLAIM_BATCH`] jobs per
    /// registered type and execute them. Public so callers (and tests)
    /// can drive the processor without the background loop.
    pub async fn tick(&self) {
        for (job_type, handler) in &self.handlers {
            let types = [job_type.clone()];
            // Claim the whole batch before executing so a job re-queued
            // by a failing handler waits for the next tick.
            let mut batch = Vec::with_capacity(CLAIM_BATCH);
            for _ in 0..CLAIM_BATCH {
                match self.queue.claim_job(&self.worker_id, Some(&types)) {
                    Ok(Some(job)) => batch.push(job),
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, job_type = %job_type, "Claim failed; skipping type");
                        break;
                    }
                }
            }
            for job in &batch {
                self.execute(handler.as_ref(), job).await;
            }
        }
    }

    async fn execute(&self, handler: &dyn JobHandler, job: &Job) {
        debug!(job_id = job.id, job_type = %job.job_type, "Executing job");
        match handler.run(job).await {
            Ok(result) => {
                if let Err(e) = self.queue.complete_job(job.id, &result) {
                    error!(job_id = job.id, error = %e, "Failed to record job completion");
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self.queue.handle_failure(job, &message) {
                    error!(job_id = job.id, error = %store_err, "Failed to record job failure");
                }
            }
        }
    }

    /// Start the background loop. Idempotent: a second call while
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            return;
        }
        info!(
            worker = %self.worker_id,
            handlers = self.handlers.len(),
            "Job processor started"
        );
        let processor = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(processor.interval);
            loop {
                ticker.tick().await;
                processor.tick().await;
            }
        }));
    }

    /// Stop the background loop. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!(worker = %self.worker_id, "Job processor stopped");
        }
    }
}

impl Drop for JobProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{AtelierError, JobStatus, NewJob};
    use atelier_store::Db;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Doubler;

    #[async_trait]
    impl JobHandler for Doubler {
        async fn run(&self, job: &Job) -> AtelierResult<serde_json::Value> {
            let n = job.payload.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        }
    }

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn run(&self, _job: &Job) -> AtelierResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AtelierError::Job("handler exploded".into()))
        }
    }

    fn processor() -> JobProcessor {
        JobProcessor::new(JobQueue::new(Db::open_in_memory().unwrap()), "test-worker")
    }

    #[tokio::test]
    async fn test_tick_completes_jobs() {
        let mut processor = processor();
        processor.register_handler("double", Arc::new(Doubler));
        let job = processor
            .queue()
            .enqueue(NewJob::new("double", json!(21)))
            .unwrap();

        processor.tick().await;

        let job = processor.queue().get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_handler_error_retries_then_dead_letters() {
        let mut processor = processor();
        let handler = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });
        processor.register_handler("doomed", handler.clone());
        let job = processor
            .queue()
            .enqueue(NewJob::new("doomed", json!({})).with_max_attempts(3))
            .unwrap();

        // Attempts 1 and 2 re-queue, attempt 3 dead-letters.
        processor.tick().await;
        processor.tick().await;
        processor.tick().await;

        let job = processor.queue().get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(job.attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        // Dead letters are never claimed again.
        processor.tick().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_types_untouched() {
        let mut processor = processor();
        processor.register_handler("double", Arc::new(Doubler));
        let job = processor
            .queue()
            .enqueue(NewJob::new("other", json!(1)))
            .unwrap();

        processor.tick().await;

        let job = processor.queue().get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let processor = Arc::new(processor().with_interval(Duration::from_millis(10)));
        processor.start();
        processor.start();
        processor.stop();
        processor.stop();
    }
}
