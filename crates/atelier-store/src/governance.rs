use crate::db::{bad_column, from_ms, json_from_col, to_ms, Db};
use atelier_core::{
    AtelierResult, AuditDecision, AuditEntry, NewAuditEntry, PolicyConditions, PolicyEffect,
    PolicyRule, PolicyScope, Skill,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const POLICY_COLUMNS: &str =
    "id, name, scope, target, effect, conditions, priority, is_active, created_at";

fn map_policy(row: &Row<'_>) -> rusqlite::Result<PolicyRule> {
    let scope_raw: String = row.get(2)?;
    let effect_raw: String = row.get(4)?;
    let conditions_raw: String = row.get(5)?;
    let conditions: PolicyConditions = serde_json::from_str(&conditions_raw)
        .map_err(|_| bad_column("conditions", &conditions_raw))?;
    Ok(PolicyRule {
        id: row.get(0)?,
        name: row.get(1)?,
        scope: PolicyScope::parse(&scope_raw).ok_or_else(|| bad_column("scope", &scope_raw))?,
        target: row.get(3)?,
        effect: PolicyEffect::parse(&effect_raw)
            .ok_or_else(|| bad_column("effect", &effect_raw))?,
        conditions,
        priority: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: from_ms(row.get(8)?),
    })
}

const AUDIT_COLUMNS: &str = "id, agent_name, action, target, decision, justification, \
     input, output, task_id, policy_id, created_at";

fn map_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let decision_raw: String = row.get(4)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        action: row.get(2)?,
        target: row.get(3)?,
        decision: AuditDecision::parse(&decision_raw)
            .ok_or_else(|| bad_column("decision", &decision_raw))?,
        justification: row.get(5)?,
        input: json_from_col(row.get(6)?),
        output: json_from_col(row.get(7)?),
        task_id: row.get(8)?,
        policy_id: row.get(9)?,
        created_at: from_ms(row.get(10)?),
    })
}

const SKILL_COLUMNS: &str = "id, name, description, source_key, usage_count, \
     success_count, success_rate, is_active, created_at";

fn map_skill(row: &Row<'_>) -> rusqlite::Result<Skill> {
    Ok(Skill {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        source_key: row.get(3)?,
        usage_count: row.get::<_, i64>(4)? as u64,
        success_count: row.get::<_, i64>(5)? as u64,
        success_rate: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: from_ms(row.get(8)?),
    })
}

/// Parameters for inserting a policy rule.
#[derive(Debug, Clone)]
pub struct NewPolicyRule {
    /// Human-readable rule name.
    pub name: String,
    /// What kind of target the rule applies to.
    pub scope: PolicyScope,
    /// Target name or substring (`*` matches any).
    pub target: String,
    /// Allow or deny on match.
    pub effect: PolicyEffect,
    /// Structured predicate.
    pub conditions: PolicyConditions,
    /// Lower priority evaluates first.
    pub priority: i64,
}

impl Db {
    /// Insert a policy rule as active.
    pub fn insert_policy(&self, new: &NewPolicyRule) -> AtelierResult<PolicyRule> {
        let now = to_ms(Utc::now());
        let conditions = serde_json::to_string(&new.conditions)?;
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO policies (name, scope, target, effect, conditions, priority, is_active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                params![
                    new.name,
                    new.scope.as_str(),
                    new.target,
                    new.effect.as_str(),
                    conditions,
                    new.priority,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {POLICY_COLUMNS} FROM policies WHERE id = ?1"),
                params![id],
                map_policy,
            )
        })
    }

    /// Active rules ordered by ascending priority (evaluation order).
    pub fn active_policies(&self) -> AtelierResult<Vec<PolicyRule>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POLICY_COLUMNS} FROM policies WHERE is_active = 1 \
                 ORDER BY priority ASC, id ASC"
            ))?;
            let rows = stmt.query_map([], map_policy)?;
            rows.collect()
        })
    }

    /// All rules regardless of state.
    pub fn list_policies(&self) -> AtelierResult<Vec<PolicyRule>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POLICY_COLUMNS} FROM policies ORDER BY priority ASC, id ASC"
            ))?;
            let rows = stmt.query_map([], map_policy)?;
            rows.collect()
        })
    }

    /// Activate or deactivate a rule.
    pub fn set_policy_active(&self, id: i64, active: bool) -> AtelierResult<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE policies SET is_active = ?2 WHERE id = ?1",
                params![id, active as i64],
            )?;
            Ok(())
        })
    }

    /// Append an audit entry and return its id.
    pub fn insert_audit(&self, entry: &NewAuditEntry) -> AtelierResult<i64> {
        let now = to_ms(Utc::now());
        self.with(|conn| {
            conn.execute(
                "INSERT INTO audit_log (agent_name, action, target, decision, justification, \
                 input, output, task_id, policy_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.agent_name,
                    entry.action,
                    entry.target,
                    entry.decision.as_str(),
                    entry.justification,
                    entry.input.to_string(),
                    entry.output.to_string(),
                    entry.task_id,
                    entry.policy_id,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit_entries(&self, limit: usize) -> AtelierResult<Vec<AuditEntry>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], map_audit)?;
            rows.collect()
        })
    }

    /// Insert a skill unless one with the same source key already exists.
    /// Returns `None` when the pattern was already converted.
    pub fn insert_skill_deduped(
        &self,
        name: &str,
        description: &str,
        source_key: &str,
    ) -> AtelierResult<Option<Skill>> {
        let now = to_ms(Utc::now());
        let existing: Option<i64> = self.with(|conn| {
            conn.query_row(
                "SELECT id FROM skills WHERE source_key = ?1",
                params![source_key],
                |row| row.get(0),
            )
            .optional()
        })?;
        if existing.is_some() {
            return Ok(None);
        }
        let id = self.with(|conn| {
            conn.execute(
                "INSERT INTO skills (name, description, source_key, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, description, source_key, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_skill(id)
    }

    /// Fetch a skill by id.
    pub fn get_skill(&self, id: i64) -> AtelierResult<Option<Skill>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE id = ?1"),
                params![id],
                map_skill,
            )
            .optional()
        })
    }

    /// Fetch a skill by name.
    pub fn get_skill_by_name(&self, name: &str) -> AtelierResult<Option<Skill>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE name = ?1"),
                params![name],
                map_skill,
            )
            .optional()
        })
    }

    /// Record one usage and recompute the running success percentage.
    pub fn increment_skill_usage(&self, name: &str, success: bool) -> AtelierResult<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE skills SET usage_count = usage_count + 1, \
                 success_count = success_count + ?2, \
                 success_rate = CAST(success_count + ?2 AS REAL) * 100.0 / (usage_count + 1) \
                 WHERE name = ?1",
                params![name, success as i64],
            )?;
            Ok(())
        })
    }

    /// Deactivate a skill by name.
    pub fn deactivate_skill(&self, name: &str) -> AtelierResult<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE skills SET is_active = 0 WHERE name = ?1",
                params![name],
            )?;
            Ok(())
        })
    }

    /// All active skills.
    pub fn active_skills(&self) -> AtelierResult<Vec<Skill>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SKILL_COLUMNS} FROM skills WHERE is_active = 1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map([], map_skill)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_ordering() {
        let db = Db::open_in_memory().unwrap();
        db.insert_policy(&NewPolicyRule {
            name: "late".into(),
            scope: PolicyScope::Tool,
            target: "write_file".into(),
            effect: PolicyEffect::Allow,
            conditions: PolicyConditions::default(),
            priority: 50,
        })
        .unwrap();
        let first = db
            .insert_policy(&NewPolicyRule {
                name: "early".into(),
                scope: PolicyScope::Tool,
                target: "write_file".into(),
                effect: PolicyEffect::Deny,
                conditions: PolicyConditions::default(),
                priority: 1,
            })
            .unwrap();

        let active = db.active_policies().unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, first.id);

        db.set_policy_active(first.id, false).unwrap();
        assert_eq!(db.active_policies().unwrap().len(), 1);
        assert_eq!(db.list_policies().unwrap().len(), 2);
    }

    #[test]
    fn test_audit_append_and_recent() {
        let db = Db::open_in_memory().unwrap();
        db.insert_audit(&NewAuditEntry::new(
            "executor",
            "write_file",
            "src/a.rs",
            AuditDecision::Allowed,
            "no matching policy",
        ))
        .unwrap();
        db.insert_audit(&NewAuditEntry::new(
            "executor",
            "write_file",
            ".env",
            AuditDecision::Denied,
            "protected path",
        ))
        .unwrap();

        let recent = db.recent_audit_entries(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].decision, AuditDecision::Denied);
    }

    #[test]
    fn test_skill_dedupe_and_usage() {
        let db = Db::open_in_memory().unwrap();
        let skill = db
            .insert_skill_deduped("auto-format", "Formats staged files", "action:format:3")
            .unwrap()
            .unwrap();
        assert_eq!(skill.usage_count, 0);

        // Same source key: not converted twice.
        assert!(db
            .insert_skill_deduped("auto-format-2", "dup", "action:format:3")
            .unwrap()
            .is_none());

        db.increment_skill_usage("auto-format", true).unwrap();
        db.increment_skill_usage("auto-format", false).unwrap();
        let skill = db.get_skill_by_name("auto-format").unwrap().unwrap();
        assert_eq!(skill.usage_count, 2);
        assert_eq!(skill.success_count, 1);
        assert!((skill.success_rate - 50.0).abs() < f64::EPSILON);

        db.deactivate_skill("auto-format").unwrap();
        assert!(db.active_skills().unwrap().is_empty());
    }
}
