use crate::db::{bad_column, from_ms, json_from_col, opt_from_ms, to_ms, Db};
use atelier_core::{AtelierResult, NewTask, Task, TaskKind, TaskStatus};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const TASK_COLUMNS: &str = "id, kind, parent_id, title, description, status, priority, \
     assigned_agent, dependencies, context, result, error_message, user_id, \
     created_at, started_at, completed_at, updated_at";

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let kind_raw: String = row.get(1)?;
    let status_raw: String = row.get(5)?;
    let deps_raw: String = row.get(8)?;
    let dependencies: Vec<i64> = serde_json::from_str(&deps_raw)
        .map_err(|_| bad_column("dependencies", &deps_raw))?;
    Ok(Task {
        id: row.get(0)?,
        kind: TaskKind::parse(&kind_raw).ok_or_else(|| bad_column("kind", &kind_raw))?,
        parent_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| bad_column("status", &status_raw))?,
        priority: row.get(6)?,
        assigned_agent: row.get(7)?,
        dependencies,
        context: json_from_col(row.get(9)?),
        result: row.get::<_, Option<String>>(10)?.map(|s| json_from_col(Some(s))),
        error_message: row.get(11)?,
        user_id: row.get(12)?,
        created_at: from_ms(row.get(13)?),
        started_at: opt_from_ms(row.get(14)?),
        completed_at: opt_from_ms(row.get(15)?),
        updated_at: from_ms(row.get(16)?),
    })
}

/// Task counts per lifecycle state, plus operator-facing staleness info.
#[derive(Debug, Clone, Default)]
pub struct TaskStatusCounts {
    /// Tasks waiting for a claimer.
    pub pending: u64,
    /// Tasks currently claimed.
    pub in_progress: u64,
    /// Tasks finished successfully.
    pub completed: u64,
    /// Tasks finished with an error.
    pub failed: u64,
    /// Age in milliseconds of the oldest unfinished claim, if any. A
    /// large value here means an agent crashed mid-process and the task
    /// needs a manual `retry_task`.
    pub oldest_claim_age_ms: Option<i64>,
}

impl Db {
    /// Insert a task row and return it with its assigned id.
    pub fn insert_task(&self, new: &NewTask) -> AtelierResult<Task> {
        let now = to_ms(Utc::now());
        let deps = serde_json::to_string(&new.dependencies).unwrap_or_else(|_| "[]".into());
        let context = new.context.to_string();
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO tasks (kind, parent_id, title, description, status, priority, \
                 assigned_agent, dependencies, context, user_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    new.kind.as_str(),
                    new.parent_id,
                    new.title,
                    new.description,
                    new.priority,
                    new.assigned_agent,
                    deps,
                    context,
                    new.user_id,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.require_task(id)
    }

    /// Fetch a task by id.
    pub fn get_task(&self, id: i64) -> AtelierResult<Option<Task>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                map_task,
            )
            .optional()
        })
    }

    /// Fetch a task that must exist.
    pub fn require_task(&self, id: i64) -> AtelierResult<Task> {
        self.get_task(id)?.ok_or_else(|| {
            atelier_core::AtelierError::Store(format!("task {id} not found"))
        })
    }

    /// All `pending` tasks assigned to `agent`, highest priority first.
    /// Dependency gating is applied by the blackboard on top of this.
    pub fn pending_tasks_for_agent(&self, agent: &str) -> AtelierResult<Vec<Task>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE status = 'pending' AND assigned_agent = ?1 \
                 ORDER BY priority DESC, id ASC"
            ))?;
            let rows = stmt.query_map(params![agent], map_task)?;
            rows.collect()
        })
    }

    /// Atomically claim a pending task. Returns `false` on a lost race:
    /// the conditional update only wins while the row is still pending.
    pub fn claim_task(&self, id: i64, agent: &str) -> AtelierResult<bool> {
        let now = to_ms(Utc::now());
        let changed = self.with(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'in_progress', assigned_agent = ?2, \
                 started_at = ?3, updated_at = ?3 \
                 WHERE id = ?1 AND status = 'pending'",
                params![id, agent, now],
            )
        })?;
        Ok(changed == 1)
    }

    /// Mark a task completed with its result. Idempotent.
    pub fn mark_task_completed(
        &self,
        id: i64,
        result: &serde_json::Value,
    ) -> AtelierResult<Task> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'completed', result = ?2, error_message = NULL, \
                 completed_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![id, result.to_string(), now],
            )
        })?;
        self.require_task(id)
    }

    /// Mark a task failed with a message. Idempotent.
    pub fn mark_task_failed(&self, id: i64, message: &str) -> AtelierResult<Task> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'failed', error_message = ?2, \
                 completed_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![id, message, now],
            )
        })?;
        self.require_task(id)
    }

    /// Re-queue a failed task as pending with an updated context.
    /// Returns `false` if the task is not currently failed.
    pub fn requeue_failed_task(
        &self,
        id: i64,
        context: &serde_json::Value,
    ) -> AtelierResult<bool> {
        let now = to_ms(Utc::now());
        let changed = self.with(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'pending', error_message = NULL, result = NULL, \
                 started_at = NULL, completed_at = NULL, context = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND status = 'failed'",
                params![id, context.to_string(), now],
            )
        })?;
        Ok(changed == 1)
    }

    /// All direct children of a task, in creation order. Re-read in full
    /// on every propagation pass so the last writer's check wins.
    pub fn children_of(&self, parent_id: i64) -> AtelierResult<Vec<Task>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![parent_id], map_task)?;
            rows.collect()
        })
    }

    /// Most recently created tasks.
    pub fn recent_tasks(&self, limit: usize) -> AtelierResult<Vec<Task>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], map_task)?;
            rows.collect()
        })
    }

    /// Status counts and oldest-claim staleness for operator stats.
    pub fn task_status_counts(&self) -> AtelierResult<TaskStatusCounts> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            let mut counts = TaskStatusCounts::default();
            let mut stmt =
                conn.prepare("SELECT status, count(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status.as_str() {
                    "pending" => counts.pending = count as u64,
                    "in_progress" => counts.in_progress = count as u64,
                    "completed" => counts.completed = count as u64,
                    "failed" => counts.failed = count as u64,
                    _ => {}
                }
            }
            let oldest: Option<i64> = conn.query_row(
                "SELECT min(started_at) FROM tasks WHERE status = 'in_progress'",
                [],
                |row| row.get(0),
            )?;
            counts.oldest_claim_age_ms = oldest.map(|started| now - started);
            Ok(counts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_task(agent: Option<&str>) -> NewTask {
        NewTask {
            kind: TaskKind::Sub,
            parent_id: None,
            title: "test".into(),
            description: "test task".into(),
            priority: 5,
            assigned_agent: agent.map(String::from),
            dependencies: vec![],
            context: json!({}),
            user_id: "user-1".into(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = Db::open_in_memory().unwrap();
        let task = db.insert_task(&new_task(Some("architect"))).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_agent.as_deref(), Some("architect"));

        let fetched = db.get_task(task.id).unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.title, "test");
    }

    #[test]
    fn test_claim_is_single_winner() {
        let db = Db::open_in_memory().unwrap();
        let task = db.insert_task(&new_task(Some("generator"))).unwrap();

        assert!(db.claim_task(task.id, "generator").unwrap());
        // Second claim loses: the row is no longer pending.
        assert!(!db.claim_task(task.id, "generator").unwrap());

        let claimed = db.get_task(task.id).unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn test_pending_order_by_priority() {
        let db = Db::open_in_memory().unwrap();
        let mut low = new_task(Some("validator"));
        low.priority = 1;
        let mut high = new_task(Some("validator"));
        high.priority = 9;
        db.insert_task(&low).unwrap();
        let high = db.insert_task(&high).unwrap();

        let pending = db.pending_tasks_for_agent("validator").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, high.id);
    }

    #[test]
    fn test_complete_and_fail() {
        let db = Db::open_in_memory().unwrap();
        let task = db.insert_task(&new_task(None)).unwrap();

        let completed = db
            .mark_task_completed(task.id, &json!({"ok": true}))
            .unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.result, Some(json!({"ok": true})));
        assert!(completed.completed_at.is_some());

        let failed = db.mark_task_failed(task.id, "boom").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_requeue_failed_only() {
        let db = Db::open_in_memory().unwrap();
        let task = db.insert_task(&new_task(None)).unwrap();

        // Pending tasks cannot be requeued.
        assert!(!db.requeue_failed_task(task.id, &json!({})).unwrap());

        db.mark_task_failed(task.id, "err").unwrap();
        assert!(db
            .requeue_failed_task(task.id, &json!({"retry_count": 1}))
            .unwrap());
        let task = db.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count(), 1);
        assert!(task.error_message.is_none());
    }

    #[test]
    fn test_children_and_counts() {
        let db = Db::open_in_memory().unwrap();
        let mut parent = new_task(None);
        parent.kind = TaskKind::Main;
        let parent = db.insert_task(&parent).unwrap();

        let mut child = new_task(Some("architect"));
        child.parent_id = Some(parent.id);
        let child = db.insert_task(&child).unwrap();

        let children = db.children_of(parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);

        db.claim_task(child.id, "architect").unwrap();
        let counts = db.task_status_counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_progress, 1);
        assert!(counts.oldest_claim_age_ms.is_some());
    }
}
