use crate::db::{bad_column, from_ms, json_from_col, to_ms, Db};
use atelier_core::{AgentLog, Artifact, ArtifactKind, AtelierResult};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const ARTIFACT_COLUMNS: &str =
    "id, task_id, kind, name, content, created_by, metadata, created_at";

fn map_artifact(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let kind_raw: String = row.get(2)?;
    Ok(Artifact {
        id: row.get(0)?,
        task_id: row.get(1)?,
        kind: ArtifactKind::parse(&kind_raw).ok_or_else(|| bad_column("kind", &kind_raw))?,
        name: row.get(3)?,
        content: row.get(4)?,
        created_by: row.get(5)?,
        metadata: json_from_col(row.get(6)?),
        created_at: from_ms(row.get(7)?),
    })
}

fn map_log(row: &Row<'_>) -> rusqlite::Result<AgentLog> {
    Ok(AgentLog {
        id: row.get(0)?,
        task_id: row.get(1)?,
        agent_name: row.get(2)?,
        action: row.get(3)?,
        thought: row.get(4)?,
        observation: row.get(5)?,
        metadata: json_from_col(row.get(6)?),
        created_at: from_ms(row.get(7)?),
    })
}

impl Db {
    /// Insert an artifact row. The caller is responsible for resolving
    /// `task_id` to the root main task first.
    pub fn insert_artifact(
        &self,
        task_id: i64,
        kind: ArtifactKind,
        name: &str,
        content: &str,
        created_by: &str,
        metadata: &serde_json::Value,
    ) -> AtelierResult<Artifact> {
        let now = to_ms(Utc::now());
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO artifacts (task_id, kind, name, content, created_by, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![task_id, kind.as_str(), name, content, created_by, metadata.to_string(), now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?1"),
                params![id],
                map_artifact,
            )
        })
    }

    /// All artifacts for a task, oldest first.
    pub fn artifacts_for_task(&self, task_id: i64) -> AtelierResult<Vec<Artifact>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE task_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![task_id], map_artifact)?;
            rows.collect()
        })
    }

    /// The newest artifact of a given kind (and optionally name) for a
    /// task. Newest by creation time, highest id as tiebreak.
    pub fn latest_artifact(
        &self,
        task_id: i64,
        kind: ArtifactKind,
        name: Option<&str>,
    ) -> AtelierResult<Option<Artifact>> {
        self.with(|conn| match name {
            Some(name) => conn
                .query_row(
                    &format!(
                        "SELECT {ARTIFACT_COLUMNS} FROM artifacts \
                         WHERE task_id = ?1 AND kind = ?2 AND name = ?3 \
                         ORDER BY created_at DESC, id DESC LIMIT 1"
                    ),
                    params![task_id, kind.as_str(), name],
                    map_artifact,
                )
                .optional(),
            None => conn
                .query_row(
                    &format!(
                        "SELECT {ARTIFACT_COLUMNS} FROM artifacts \
                         WHERE task_id = ?1 AND kind = ?2 \
                         ORDER BY created_at DESC, id DESC LIMIT 1"
                    ),
                    params![task_id, kind.as_str()],
                    map_artifact,
                )
                .optional(),
        })
    }

    /// Total number of artifacts.
    pub fn artifact_count(&self) -> AtelierResult<u64> {
        self.with(|conn| {
            conn.query_row("SELECT count(*) FROM artifacts", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as u64)
    }

    /// Append a narration entry. Entries are never updated or deleted.
    pub fn insert_log(
        &self,
        task_id: i64,
        agent_name: &str,
        action: &str,
        thought: &str,
        observation: &str,
        metadata: &serde_json::Value,
    ) -> AtelierResult<AgentLog> {
        let now = to_ms(Utc::now());
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO agent_logs (task_id, agent_name, action, thought, observation, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![task_id, agent_name, action, thought, observation, metadata.to_string(), now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with(|conn| {
            conn.query_row(
                "SELECT id, task_id, agent_name, action, thought, observation, metadata, created_at \
                 FROM agent_logs WHERE id = ?1",
                params![id],
                map_log,
            )
        })
    }

    /// All narration entries for a task, oldest first.
    pub fn logs_for_task(&self, task_id: i64) -> AtelierResult<Vec<AgentLog>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, agent_name, action, thought, observation, metadata, created_at \
                 FROM agent_logs WHERE task_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![task_id], map_log)?;
            rows.collect()
        })
    }

    /// Total number of narration entries.
    pub fn log_count(&self) -> AtelierResult<u64> {
        self.with(|conn| {
            conn.query_row("SELECT count(*) FROM agent_logs", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_list_artifacts() {
        let db = Db::open_in_memory().unwrap();
        let artifact = db
            .insert_artifact(1, ArtifactKind::Code, "src/lib.rs", "fn a() {}", "generator", &json!({}))
            .unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Code);

        let all = db.artifacts_for_task(1).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(db.artifact_count().unwrap(), 1);
    }

    #[test]
    fn test_latest_artifact_versioning() {
        let db = Db::open_in_memory().unwrap();
        db.insert_artifact(1, ArtifactKind::Spec, "spec.md", "v1", "architect", &json!({}))
            .unwrap();
        db.insert_artifact(1, ArtifactKind::Spec, "spec.md", "v2", "architect", &json!({}))
            .unwrap();

        let latest = db
            .latest_artifact(1, ArtifactKind::Spec, Some("spec.md"))
            .unwrap()
            .unwrap();
        assert_eq!(latest.content, "v2");

        let by_kind = db.latest_artifact(1, ArtifactKind::Spec, None).unwrap().unwrap();
        assert_eq!(by_kind.content, "v2");

        assert!(db
            .latest_artifact(1, ArtifactKind::Code, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_logs_append_only_ordering() {
        let db = Db::open_in_memory().unwrap();
        db.insert_log(7, "validator", "gate", "checking", "", &json!({}))
            .unwrap();
        db.insert_log(7, "validator", "score", "", "82", &json!({}))
            .unwrap();

        let logs = db.logs_for_task(7).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, "gate");
        assert_eq!(logs[1].action, "score");
        assert_eq!(db.log_count().unwrap(), 2);
    }
}
