use crate::db::{bad_column, from_ms, json_from_col, opt_from_ms, to_ms, Db};
use atelier_core::{AtelierError, AtelierResult, Job, JobStatus, NewJob};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const JOB_COLUMNS: &str = "id, job_type, priority, payload, status, attempts, max_attempts, \
     assigned_agent, scheduled_at, result, error, parent_job_id, created_at, updated_at";

fn map_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_raw: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        priority: row.get(2)?,
        payload: json_from_col(row.get(3)?),
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| bad_column("status", &status_raw))?,
        attempts: row.get::<_, i64>(5)? as u32,
        max_attempts: row.get::<_, i64>(6)? as u32,
        assigned_agent: row.get(7)?,
        scheduled_at: from_ms(row.get(8)?),
        result: row.get::<_, Option<String>>(9)?.map(|s| json_from_col(Some(s))),
        error: row.get(10)?,
        parent_job_id: row.get(11)?,
        created_at: from_ms(row.get(12)?),
        updated_at: from_ms(row.get(13)?),
    })
}

/// Aggregate throughput view over one agent's metric rows.
#[derive(Debug, Clone, Default)]
pub struct AgentSummary {
    /// Agent the summary describes.
    pub agent_name: String,
    /// Completed tasks across all periods.
    pub tasks_completed: u64,
    /// Failed tasks across all periods.
    pub tasks_failed: u64,
    /// Mean processing duration per completed task.
    pub avg_duration_ms: f64,
    /// Number of hour buckets with data.
    pub periods: u64,
}

impl Db {
    /// Insert a job as `pending` and return it.
    pub fn insert_job(&self, new: &NewJob) -> AtelierResult<Job> {
        let now = Utc::now();
        let now_ms = to_ms(now);
        let scheduled = to_ms(new.scheduled_at.unwrap_or(now));
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO jobs (job_type, priority, payload, status, max_attempts, \
                 scheduled_at, parent_job_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?7)",
                params![
                    new.job_type,
                    new.priority,
                    new.payload.to_string(),
                    new.max_attempts,
                    scheduled,
                    new.parent_job_id,
                    now_ms,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.require_job(id)
    }

    /// Fetch a job by id.
    pub fn get_job(&self, id: i64) -> AtelierResult<Option<Job>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                map_job,
            )
            .optional()
        })
    }

    /// Fetch a job that must exist.
    pub fn require_job(&self, id: i64) -> AtelierResult<Job> {
        self.get_job(id)?
            .ok_or_else(|| AtelierError::Store(format!("job {id} not found")))
    }

    /// Claim the best available pending job for `worker_id`.
    ///
    /// Candidates are ranked highest priority first, then earliest
    /// created, restricted to `types` when given and to jobs whose
    /// `scheduled_at` has passed. Each candidate is taken with a
    /// conditional update; a candidate that another claimer won in the
    /// meantime is skipped rather than awaited — the SKIP LOCKED
    /// equivalent for this store.
    pub fn claim_next_job(
        &self,
        worker_id: &str,
        types: Option<&[String]>,
    ) -> AtelierResult<Option<Job>> {
        let now = to_ms(Utc::now());
        let candidates: Vec<i64> = self.with(|conn| {
            match types {
                Some(types) if !types.is_empty() => {
                    let placeholders = types
                        .iter()
                        .map(|_| "?")
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "SELECT id FROM jobs WHERE status = 'pending' AND scheduled_at <= ?1 \
                         AND job_type IN ({placeholders}) \
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 8"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let mut bindings: Vec<&dyn rusqlite::ToSql> = vec![&now];
                    for t in types {
                        bindings.push(t);
                    }
                    let rows = stmt.query_map(bindings.as_slice(), |row| row.get(0))?;
                    rows.collect()
                }
                _ => {
                    let mut stmt = conn.prepare(
                        "SELECT id FROM jobs WHERE status = 'pending' AND scheduled_at <= ?1 \
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 8",
                    )?;
                    let rows = stmt.query_map(params![now], |row| row.get(0))?;
                    rows.collect()
                }
            }
        })?;

        for id in candidates {
            let changed = self.with(|conn| {
                conn.execute(
                    "UPDATE jobs SET status = 'processing', assigned_agent = ?2, \
                     attempts = attempts + 1, updated_at = ?3 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, worker_id, now],
                )
            })?;
            if changed == 1 {
                return self.get_job(id);
            }
            // Lost the race for this row; try the next candidate.
        }
        Ok(None)
    }

    /// Mark a job completed with its result.
    pub fn mark_job_completed(&self, id: i64, result: &serde_json::Value) -> AtelierResult<Job> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'completed', result = ?2, error = NULL, updated_at = ?3 \
                 WHERE id = ?1",
                params![id, result.to_string(), now],
            )
        })?;
        self.require_job(id)
    }

    /// Mark a job failed with an error message.
    pub fn mark_job_failed(&self, id: i64, error: &str) -> AtelierResult<Job> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'failed', error = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, error, now],
            )
        })?;
        self.require_job(id)
    }

    /// Re-queue a job as pending. Attempt count and assignment history
    /// are preserved.
    pub fn requeue_job(&self, id: i64, error: Option<&str>) -> AtelierResult<Job> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'pending', error = COALESCE(?2, error), updated_at = ?3 \
                 WHERE id = ?1",
                params![id, error, now],
            )
        })?;
        self.require_job(id)
    }

    /// Permanently dead-letter a job.
    pub fn dead_letter_job(&self, id: i64, error: &str) -> AtelierResult<Job> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'dead_letter', error = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, error, now],
            )
        })?;
        self.require_job(id)
    }

    /// Cancel a job that has not finished. Returns `false` when the job
    /// was already terminal.
    pub fn cancel_job(&self, id: i64) -> AtelierResult<bool> {
        let now = to_ms(Utc::now());
        let changed = self.with(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'cancelled', updated_at = ?2 \
                 WHERE id = ?1 AND status IN ('pending', 'processing', 'failed')",
                params![id, now],
            )
        })?;
        Ok(changed == 1)
    }

    /// Job counts per status.
    pub fn job_status_counts(&self) -> AtelierResult<Vec<(String, u64)>> {
        self.with(|conn| {
            let mut stmt = conn.prepare("SELECT status, count(*) FROM jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            rows.collect()
        })
    }

    /// Upsert one agent's metric row for an hour bucket.
    pub fn record_agent_metrics(
        &self,
        agent_name: &str,
        period: &str,
        completed_delta: u64,
        failed_delta: u64,
        duration_ms_delta: u64,
    ) -> AtelierResult<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO agent_metrics (agent_name, period, tasks_completed, tasks_failed, total_duration_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (agent_name, period) DO UPDATE SET \
                 tasks_completed = tasks_completed + excluded.tasks_completed, \
                 tasks_failed = tasks_failed + excluded.tasks_failed, \
                 total_duration_ms = total_duration_ms + excluded.total_duration_ms",
                params![
                    agent_name,
                    period,
                    completed_delta as i64,
                    failed_delta as i64,
                    duration_ms_delta as i64,
                ],
            )?;
            Ok(())
        })
    }

    /// Aggregate one agent's metric rows.
    pub fn agent_summary(&self, agent_name: &str) -> AtelierResult<AgentSummary> {
        self.with(|conn| {
            let row = conn
                .query_row(
                    "SELECT COALESCE(sum(tasks_completed), 0), COALESCE(sum(tasks_failed), 0), \
                     COALESCE(sum(total_duration_ms), 0), count(*) \
                     FROM agent_metrics WHERE agent_name = ?1",
                    params![agent_name],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )?;
            let (completed, failed, duration, periods) = row;
            let avg = if completed > 0 {
                duration as f64 / completed as f64
            } else {
                0.0
            };
            Ok(AgentSummary {
                agent_name: agent_name.to_string(),
                tasks_completed: completed as u64,
                tasks_failed: failed as u64,
                avg_duration_ms: avg,
                periods: periods as u64,
            })
        })
    }
}
