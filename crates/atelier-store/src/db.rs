use atelier_core::{AtelierError, AtelierResult};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    kind            TEXT NOT NULL,
    parent_id       INTEGER,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    priority        INTEGER NOT NULL DEFAULT 0,
    assigned_agent  TEXT,
    dependencies    TEXT NOT NULL DEFAULT '[]',
    context         TEXT NOT NULL DEFAULT 'null',
    result          TEXT,
    error_message   TEXT,
    user_id         TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    started_at      INTEGER,
    completed_at    INTEGER,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_agent_status ON tasks(assigned_agent, status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

CREATE TABLE IF NOT EXISTS artifacts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    name        TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_by  TEXT NOT NULL,
    metadata    TEXT NOT NULL DEFAULT 'null',
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id);

CREATE TABLE IF NOT EXISTS agent_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL,
    agent_name  TEXT NOT NULL,
    action      TEXT NOT NULL,
    thought     TEXT NOT NULL DEFAULT '',
    observation TEXT NOT NULL DEFAULT '',
    metadata    TEXT NOT NULL DEFAULT 'null',
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_task ON agent_logs(task_id);

CREATE TABLE IF NOT EXISTS pipelines (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id  TEXT NOT NULL UNIQUE,
    prompt          TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'queued',
    current_phase   TEXT NOT NULL DEFAULT 'design',
    main_task_id    INTEGER,
    phases          TEXT NOT NULL,
    budget          TEXT NOT NULL,
    runbook         TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    started_at      INTEGER,
    updated_at      INTEGER NOT NULL,
    error           TEXT
);

CREATE TABLE IF NOT EXISTS staging_changes (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id       INTEGER NOT NULL,
    task_id           INTEGER NOT NULL,
    file_path         TEXT NOT NULL,
    content           TEXT NOT NULL,
    original_content  TEXT,
    action            TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'pending',
    reviewed_by       TEXT,
    reviewed_at       INTEGER,
    applied_at        INTEGER,
    rolled_back_at    INTEGER,
    created_at        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_staging_pipeline ON staging_changes(pipeline_id, status);

CREATE TABLE IF NOT EXISTS policies (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    scope       TEXT NOT NULL,
    target      TEXT NOT NULL,
    effect      TEXT NOT NULL,
    conditions  TEXT NOT NULL DEFAULT '{}',
    priority    INTEGER NOT NULL DEFAULT 100,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name     TEXT NOT NULL,
    action         TEXT NOT NULL,
    target         TEXT NOT NULL,
    decision       TEXT NOT NULL,
    justification  TEXT NOT NULL DEFAULT '',
    input          TEXT NOT NULL DEFAULT 'null',
    output         TEXT NOT NULL DEFAULT 'null',
    task_id        INTEGER,
    policy_id      INTEGER,
    created_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);

CREATE TABLE IF NOT EXISTS jobs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type       TEXT NOT NULL,
    priority       INTEGER NOT NULL DEFAULT 0,
    payload        TEXT NOT NULL DEFAULT 'null',
    status         TEXT NOT NULL DEFAULT 'pending',
    attempts       INTEGER NOT NULL DEFAULT 0,
    max_attempts   INTEGER NOT NULL DEFAULT 3,
    assigned_agent TEXT,
    scheduled_at   INTEGER NOT NULL,
    result         TEXT,
    error          TEXT,
    parent_job_id  INTEGER,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, job_type, priority, created_at);

CREATE TABLE IF NOT EXISTS agent_metrics (
    agent_name        TEXT NOT NULL,
    period            TEXT NOT NULL,
    tasks_completed   INTEGER NOT NULL DEFAULT 0,
    tasks_failed      INTEGER NOT NULL DEFAULT 0,
    total_duration_ms INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (agent_name, period)
);

CREATE TABLE IF NOT EXISTS skills (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL UNIQUE,
    description   TEXT NOT NULL DEFAULT '',
    source_key    TEXT NOT NULL UNIQUE,
    usage_count   INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    success_rate  REAL NOT NULL DEFAULT 0,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    INTEGER NOT NULL
);
"#;

/// Handle to the shared SQLite store.
///
/// Cloning is cheap; all clones share the same connection. Every access
/// serializes through the inner mutex, which is what makes the
/// conditional-update claim statements race-safe within the process.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the store at `path` and run schema bootstrap.
    pub fn open(path: impl AsRef<Path>) -> AtelierResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store. Used by tests and ephemeral runs.
    pub fn open_in_memory() -> AtelierResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection locked.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> AtelierResult<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(store_err)
    }

    /// Drop a table. Only used by fail-closed tests to poison the store.
    #[doc(hidden)]
    pub fn break_table(&self, table: &str) -> AtelierResult<()> {
        self.with(|conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))
        })
    }
}

pub(crate) fn store_err(e: rusqlite::Error) -> AtelierError {
    AtelierError::Store(e.to_string())
}

/// Conversion error for a malformed stored value.
pub(crate) fn bad_column(col: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {col}: {value}").into(),
    )
}

pub(crate) fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

/// Parse a JSON column, treating NULL and empty text as `Value::Null`.
pub(crate) fn json_from_col(raw: Option<String>) -> serde_json::Value {
    match raw {
        Some(text) if !text.is_empty() => {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::Null)
        }
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_bootstraps_schema() {
        let db = Db::open_in_memory().unwrap();
        let count: i64 = db
            .with(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!(count >= 9);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("atelier.db")).unwrap();
        db.with(|conn| conn.execute("INSERT INTO agent_metrics (agent_name, period) VALUES ('a', 'p')", []))
            .unwrap();
    }

    #[test]
    fn test_ms_round_trip() {
        let now = Utc::now();
        let back = from_ms(to_ms(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_json_from_col() {
        assert_eq!(json_from_col(None), serde_json::Value::Null);
        assert_eq!(
            json_from_col(Some("{\"a\":1}".into())),
            serde_json::json!({"a": 1})
        );
        assert_eq!(json_from_col(Some("not json".into())), serde_json::Value::Null);
    }
}
