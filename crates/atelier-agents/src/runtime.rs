use async_trait::async_trait;
use atelier_blackboard::Blackboard;
use atelier_core::{AtelierResult, Task};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default polling interval per agent loop.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A worker agent: a capability predicate and a processing routine.
///
/// `process` returns the task result; the runtime performs the
/// complete/fail transition, so an implementation never touches task
/// status directly and a returned error always surfaces as a failed
/// task.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// The agent identity used for task assignment and claims.
    fn name(&self) -> &'static str;

    /// Whether this agent can process the given claimable task.
    fn can_handle(&self, task: &Task) -> bool;

    /// Perform the work. Must not complete or fail the task itself.
    async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value>;
}

/// The generic polling/claim/execute loop shared by every worker.
///
/// One tokio task per registered agent. Errors inside `process` are
/// caught and converted into `fail_task`; the loops themselves never
/// die.
pub struct AgentRuntime {
    board: Blackboard,
    agents: Vec<Arc<dyn WorkerAgent>>,
    interval: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentRuntime {
    /// Create a runtime over the shared board.
    pub fn new(board: Blackboard) -> Self {
        Self {
            board,
            agents: Vec::new(),
            interval: POLL_INTERVAL,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Override the polling interval (tests use short ones).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Register an agent before starting.
    pub fn register(&mut self, agent: Arc<dyn WorkerAgent>) {
        self.agents.push(agent);
    }

    /// Registered agent identities.
    pub fn agent_names(&self) -> Vec<&'static str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    /// One poll pass for one agent: fetch claimable tasks, claim what
    /// the agent can handle, execute. Public so tests and the CLI can
    /// drive the runtime without the background loops.
    pub async fn poll_once(&self, agent: &Arc<dyn WorkerAgent>) {
        let tasks = match self.board.pending_tasks_for(agent.name()) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(agent = agent.name(), error = %e, "Poll failed");
                return;
            }
        };
        for task in tasks {
            if !agent.can_handle(&task) {
                continue;
            }
            match self.board.claim_task(task.id, agent.name()) {
                Ok(true) => self.run_claimed(agent, task).await,
                // Lost race: another loop won this task.
                Ok(false) => debug!(agent = agent.name(), task_id = task.id, "Claim lost"),
                Err(e) => warn!(agent = agent.name(), task_id = task.id, error = %e, "Claim errored"),
            }
        }
    }

    async fn run_claimed(&self, agent: &Arc<dyn WorkerAgent>, task: Task) {
        let task_id = task.id;
        match agent.process(&task).await {
            Ok(result) => {
                if let Err(e) = self.board.complete_task(task_id, agent.name(), result) {
                    error!(task_id, error = %e, "Failed to record task completion");
                }
            }
            Err(e) => {
                // Processing failures become failed tasks, never crashes.
                let message = e.to_string();
                if let Err(store_err) = self.board.fail_task(task_id, agent.name(), &message) {
                    error!(task_id, error = %store_err, "Failed to record task failure");
                }
            }
        }
    }

    /// Run every registered agent's poll pass once. Useful for tests
    /// and single-shot CLI invocations.
    pub async fn poll_all_once(&self) {
        for agent in &self.agents {
            self.poll_once(agent).await;
        }
    }

    /// Start one polling loop per registered agent. Idempotent: calling
    /// start on a running runtime is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        info!(agents = self.agents.len(), "Agent runtime started");
        for agent in &self.agents {
            let runtime = Arc::clone(self);
            let agent = Arc::clone(agent);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(runtime.interval);
                loop {
                    ticker.tick().await;
                    runtime.poll_once(&agent).await;
                }
            }));
        }
    }

    /// Stop all polling loops. Idempotent.
    pub fn stop(&self) {
        let mut handles = self.handles.lock();
        if handles.is_empty() {
            return;
        }
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("Agent runtime stopped");
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{AtelierError, EventBus, TaskStatus};
    use atelier_store::Db;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl WorkerAgent for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn can_handle(&self, task: &Task) -> bool {
            task.assigned_agent.as_deref() == Some("echo")
        }
        async fn process(&self, task: &Task) -> AtelierResult<serde_json::Value> {
            Ok(json!({"echo": task.title}))
        }
    }

    struct Panicky;

    #[async_trait]
    impl WorkerAgent for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }
        fn can_handle(&self, _task: &Task) -> bool {
            true
        }
        async fn process(&self, _task: &Task) -> AtelierResult<serde_json::Value> {
            Err(AtelierError::Agent("synthetic processing failure".into()))
        }
    }

    fn runtime_with(agent: Arc<dyn WorkerAgent>) -> (AgentRuntime, Blackboard) {
        let board = Blackboard::new(Db::open_in_memory().unwrap(), EventBus::default());
        let mut runtime = AgentRuntime::new(board.clone());
        runtime.register(agent);
        (runtime, board)
    }

    #[tokio::test]
    async fn test_poll_claims_and_completes() {
        let (runtime, board) = runtime_with(Arc::new(Echo));
        let main = board.create_main_task("r", "r", "u1", json!({})).unwrap();
        let sub = board
            .create_subtask(main.id, "hello", "hello", "echo", vec![], json!({}))
            .unwrap();

        runtime.poll_all_once().await;

        let task = board.get_task(sub.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"echo": "hello"})));
    }

    #[tokio::test]
    async fn test_processing_error_becomes_failed_task() {
        let (runtime, board) = runtime_with(Arc::new(Panicky));
        let main = board.create_main_task("r", "r", "u1", json!({})).unwrap();
        let sub = board
            .create_subtask(main.id, "doomed", "doomed", "panicky", vec![], json!({}))
            .unwrap();

        runtime.poll_all_once().await;

        let task = board.get_task(sub.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error_message
            .unwrap()
            .contains("synthetic processing failure"));
    }

    #[tokio::test]
    async fn test_unhandled_tasks_left_alone() {
        let (runtime, board) = runtime_with(Arc::new(Echo));
        let main = board.create_main_task("r", "r", "u1", json!({})).unwrap();
        let sub = board
            .create_subtask(main.id, "other", "other", "someone-else", vec![], json!({}))
            .unwrap();

        runtime.poll_all_once().await;

        let task = board.get_task(sub.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (runtime, _board) = runtime_with(Arc::new(Echo));
        let runtime = Arc::new(runtime.with_interval(Duration::from_millis(10)));
        runtime.start();
        runtime.start();
        runtime.stop();
        runtime.stop();
    }
}
