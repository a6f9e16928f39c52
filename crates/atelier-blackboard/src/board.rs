use atelier_core::{
    AgentLog, Artifact, ArtifactKind, AtelierError, AtelierResult, EventBus, NewTask, SystemEvent,
    Task, TaskKind, TaskStatus,
};
use atelier_store::{Db, TaskStatusCounts};
use serde_json::json;
use tracing::{debug, info, warn};

/// Main tasks are always polled ahead of phase subtasks.
const MAIN_TASK_PRIORITY: i64 = 10;
const SUBTASK_PRIORITY: i64 = 5;

/// Upper bound on the parent chain. A longer chain means a cycle or
/// corruption; the walk fails loudly instead of looping.
const MAX_PARENT_DEPTH: usize = 32;

/// Retries allowed per task before `retry_task` refuses.
const MAX_TASK_RETRIES: u32 = 3;

/// A task joined with everything the board knows about it.
#[derive(Debug, Clone)]
pub struct TaskDetails {
    /// The task itself.
    pub task: Task,
    /// Direct children, in creation order.
    pub subtasks: Vec<Task>,
    /// Artifacts homed on this task.
    pub artifacts: Vec<Artifact>,
    /// Narration timeline.
    pub logs: Vec<AgentLog>,
}

/// Operator-facing snapshot of the board.
#[derive(Debug, Clone)]
pub struct BoardStats {
    /// Task counts per lifecycle state plus claim staleness.
    pub tasks: TaskStatusCounts,
    /// Total artifacts persisted.
    pub artifacts: u64,
    /// Total narration entries.
    pub logs: u64,
}

/// The shared task/artifact/log repository and task-lifecycle state
/// machine. The single source of truth agents read and write.
#[derive(Clone)]
pub struct Blackboard {
    db: Db,
    events: EventBus,
}

impl Blackboard {
    /// Wrap a store handle and an event bus.
    pub fn new(db: Db, events: EventBus) -> Self {
        Self { db, events }
    }

    /// The underlying store handle.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Create a root task. Main tasks carry a fixed high priority and
    /// are never assigned to a single agent.
    pub fn create_main_task(
        &self,
        title: &str,
        description: &str,
        user_id: &str,
        context: serde_json::Value,
    ) -> AtelierResult<Task> {
        let task = self.db.insert_task(&NewTask {
            kind: TaskKind::Main,
            parent_id: None,
            title: title.to_string(),
            description: description.to_string(),
            priority: MAIN_TASK_PRIORITY,
            assigned_agent: None,
            dependencies: Vec::new(),
            context,
            user_id: user_id.to_string(),
        })?;
        self.db.insert_log(
            task.id,
            "blackboard",
            "task_created",
            "",
            &format!("main task created: {title}"),
            &json!({"kind": "main"}),
        )?;
        info!(task_id = task.id, title = %title, "Main task created");
        self.events.emit(SystemEvent::TaskCreated {
            task_id: task.id,
            agent: None,
        });
        Ok(task)
    }

    /// Create a child task targeted at one agent capability.
    pub fn create_subtask(
        &self,
        parent_id: i64,
        title: &str,
        description: &str,
        agent: &str,
        dependencies: Vec<i64>,
        context: serde_json::Value,
    ) -> AtelierResult<Task> {
        // The parent must exist; a dangling parent_id would break root
        // resolution for every artifact this subtask produces.
        let parent = self.db.require_task(parent_id)?;
        let task = self.db.insert_task(&NewTask {
            kind: TaskKind::Sub,
            parent_id: Some(parent_id),
            title: title.to_string(),
            description: description.to_string(),
            priority: SUBTASK_PRIORITY,
            assigned_agent: Some(agent.to_string()),
            dependencies,
            context,
            user_id: parent.user_id,
        })?;
        info!(task_id = task.id, parent_id, agent = %agent, "Subtask created");
        self.events.emit(SystemEvent::TaskCreated {
            task_id: task.id,
            agent: Some(agent.to_string()),
        });
        Ok(task)
    }

    /// Pending tasks for an agent, highest priority first, filtered to
    /// those whose every dependency is completed. Tasks with unmet
    /// dependencies are invisible to claimers.
    pub fn pending_tasks_for(&self, agent: &str) -> AtelierResult<Vec<Task>> {
        let mut tasks = self.db.pending_tasks_for_agent(agent)?;
        let mut gated = Vec::with_capacity(tasks.len());
        for task in tasks.drain(..) {
            if self.dependencies_met(&task)? {
                gated.push(task);
            }
        }
        Ok(gated)
    }

    fn dependencies_met(&self, task: &Task) -> AtelierResult<bool> {
        for dep_id in &task.dependencies {
            match self.db.get_task(*dep_id)? {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                // Missing or unfinished dependency: not claimable.
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Atomically claim a pending task for an agent. Returns `false`
    /// when another claimer won the race.
    pub fn claim_task(&self, id: i64, agent: &str) -> AtelierResult<bool> {
        let won = self.db.claim_task(id, agent)?;
        if won {
            debug!(task_id = id, agent = %agent, "Task claimed");
            self.db.insert_log(
                id,
                agent,
                "task_claimed",
                "",
                "claimed for processing",
                &serde_json::Value::Null,
            )?;
            self.events.emit(SystemEvent::TaskClaimed {
                task_id: id,
                agent: agent.to_string(),
            });
        }
        Ok(won)
    }

    /// Complete a task with its result and propagate to the parent.
    pub fn complete_task(
        &self,
        id: i64,
        agent: &str,
        result: serde_json::Value,
    ) -> AtelierResult<Task> {
        let task = self.db.mark_task_completed(id, &result)?;
        info!(task_id = id, agent = %agent, "Task completed");
        self.events.emit(SystemEvent::TaskCompleted {
            task_id: id,
            agent: agent.to_string(),
        });
        self.propagate_from(task.parent_id)?;
        self.db.require_task(id)
    }

    /// Fail a task with a message and propagate to the parent.
    pub fn fail_task(&self, id: i64, agent: &str, message: &str) -> AtelierResult<Task> {
        let task = self.db.mark_task_failed(id, message)?;
        warn!(task_id = id, agent = %agent, error = %message, "Task failed");
        self.events.emit(SystemEvent::TaskFailed {
            task_id: id,
            agent: agent.to_string(),
            error: message.to_string(),
        });
        self.propagate_from(task.parent_id)?;
        self.db.require_task(id)
    }

    /// Parent completion propagation: walk toward the root, re-reading
    /// the full child set at every level before deciding. Any failed
    /// child fails the parent; all children completed (and at least one
    /// child) completes the parent with an aggregate result. Idempotent
    /// and safe under concurrent sibling completions — the last writer's
    /// re-read wins.
    fn propagate_from(&self, parent_id: Option<i64>) -> AtelierResult<()> {
        let mut current = parent_id;
        let mut depth = 0usize;
        while let Some(pid) = current {
            depth += 1;
            if depth > MAX_PARENT_DEPTH {
                return Err(AtelierError::Blackboard(format!(
                    "parent chain exceeds max depth {MAX_PARENT_DEPTH} at task {pid}"
                )));
            }
            let children = self.db.children_of(pid)?;
            if children.is_empty() {
                break;
            }
            let failed = children.iter().find(|c| c.status == TaskStatus::Failed);
            let all_completed = children.iter().all(|c| c.status == TaskStatus::Completed);
            if let Some(failed_child) = failed {
                let message = format!(
                    "subtask {} failed: {}",
                    failed_child.id,
                    failed_child.error_message.as_deref().unwrap_or("unknown")
                );
                self.db.mark_task_failed(pid, &message)?;
                debug!(task_id = pid, "Parent marked failed by propagation");
            } else if all_completed {
                let aggregate = json!({
                    "subtask_count": children.len(),
                    "subtask_ids": children.iter().map(|c| c.id).collect::<Vec<_>>(),
                    "results": children.iter().map(|c| c.result.clone()).collect::<Vec<_>>(),
                });
                self.db.mark_task_completed(pid, &aggregate)?;
                debug!(task_id = pid, "Parent marked completed by propagation");
            } else {
                // Children still in flight: nothing to decide yet.
                break;
            }
            current = self.db.require_task(pid)?.parent_id;
        }
        Ok(())
    }

    /// Resolve a task to its root main task by walking `parent_id`.
    pub fn resolve_root(&self, task_id: i64) -> AtelierResult<Task> {
        let mut task = self.db.require_task(task_id)?;
        let mut depth = 0usize;
        while let Some(parent_id) = task.parent_id {
            depth += 1;
            if depth > MAX_PARENT_DEPTH {
                return Err(AtelierError::Blackboard(format!(
                    "parent chain exceeds max depth {MAX_PARENT_DEPTH} at task {task_id}"
                )));
            }
            task = self.db.require_task(parent_id)?;
        }
        Ok(task)
    }

    /// Persist an artifact, re-homed to the task's root main task.
    pub fn add_artifact(
        &self,
        task_id: i64,
        kind: ArtifactKind,
        name: &str,
        content: &str,
        agent: &str,
        metadata: serde_json::Value,
    ) -> AtelierResult<Artifact> {
        let root = self.resolve_root(task_id)?;
        let artifact = self
            .db
            .insert_artifact(root.id, kind, name, content, agent, &metadata)?;
        debug!(task_id = root.id, name = %name, kind = %kind, "Artifact created");
        self.events.emit(SystemEvent::ArtifactCreated {
            task_id: root.id,
            name: name.to_string(),
        });
        Ok(artifact)
    }

    /// All artifacts homed on a task.
    pub fn artifacts_for_task(&self, task_id: i64) -> AtelierResult<Vec<Artifact>> {
        self.db.artifacts_for_task(task_id)
    }

    /// The newest artifact of a kind (and optionally name), resolved
    /// against the task's root.
    pub fn latest_artifact(
        &self,
        task_id: i64,
        kind: ArtifactKind,
        name: Option<&str>,
    ) -> AtelierResult<Option<Artifact>> {
        let root = self.resolve_root(task_id)?;
        self.db.latest_artifact(root.id, kind, name)
    }

    /// Append a narration entry for a task.
    pub fn add_log(
        &self,
        task_id: i64,
        agent: &str,
        action: &str,
        thought: &str,
        observation: &str,
        metadata: serde_json::Value,
    ) -> AtelierResult<AgentLog> {
        self.db
            .insert_log(task_id, agent, action, thought, observation, &metadata)
    }

    /// A task joined with its subtasks, artifacts and logs.
    pub fn task_with_details(&self, id: i64) -> AtelierResult<Option<TaskDetails>> {
        let Some(task) = self.db.get_task(id)? else {
            return Ok(None);
        };
        Ok(Some(TaskDetails {
            subtasks: self.db.children_of(id)?,
            artifacts: self.db.artifacts_for_task(id)?,
            logs: self.db.logs_for_task(id)?,
            task,
        }))
    }

    /// Fetch a single task.
    pub fn get_task(&self, id: i64) -> AtelierResult<Option<Task>> {
        self.db.get_task(id)
    }

    /// Most recently created tasks.
    pub fn recent_tasks(&self, limit: usize) -> AtelierResult<Vec<Task>> {
        self.db.recent_tasks(limit)
    }

    /// Board-wide stats. Stuck `in_progress` claims show up here as
    /// `oldest_claim_age_ms`; there is no automatic requeue.
    pub fn stats(&self) -> AtelierResult<BoardStats> {
        Ok(BoardStats {
            tasks: self.db.task_status_counts()?,
            artifacts: self.db.artifact_count()?,
            logs: self.db.log_count()?,
        })
    }

    /// Re-queue a failed task as pending, bumping its retry counter.
    /// Returns `None` once the retry budget is exhausted.
    pub fn retry_task(&self, id: i64, reason: &str) -> AtelierResult<Option<Task>> {
        let task = self.db.require_task(id)?;
        let retries = task.retry_count();
        if retries >= MAX_TASK_RETRIES {
            warn!(task_id = id, retries, "Retry refused: budget exhausted");
            return Ok(None);
        }
        let mut context = match task.context {
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            _ => json!({}),
        };
        if let Some(map) = context.as_object_mut() {
            map.insert("retry_count".into(), json!(retries + 1));
            map.insert("retry_reason".into(), json!(reason));
        }
        if !self.db.requeue_failed_task(id, &context)? {
            // Not failed (anymore): nothing to retry.
            return Ok(None);
        }
        info!(task_id = id, retry = retries + 1, reason = %reason, "Task re-queued");
        self.events.emit(SystemEvent::TaskRetried {
            task_id: id,
            retry_count: retries + 1,
        });
        self.db.get_task(id)
    }
}
