use atelier_core::{AtelierResult, Skill};
use atelier_store::Db;
use tracing::info;

/// Registry of skills distilled from repeated audited actions.
///
/// Skills are created by the evolution cycle when it observes the same
/// action pattern often enough; `source_key` de-duplication guarantees a
/// pattern is never converted twice.
#[derive(Clone)]
pub struct SkillRegistry {
    db: Db,
}

impl SkillRegistry {
    /// Wrap a store handle.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a skill unless its source pattern was already converted.
    pub fn create_skill(
        &self,
        name: &str,
        description: &str,
        source_key: &str,
    ) -> AtelierResult<Option<Skill>> {
        let created = self.db.insert_skill_deduped(name, description, source_key)?;
        if let Some(skill) = &created {
            info!(skill = %skill.name, source_key = %source_key, "Skill created");
        }
        Ok(created)
    }

    /// Record one usage and recompute the running success percentage.
    pub fn increment_skill_usage(&self, name: &str, success: bool) -> AtelierResult<()> {
        self.db.increment_skill_usage(name, success)
    }

    /// Deactivate a skill; inactive skills are never offered to agents.
    pub fn deactivate_skill(&self, name: &str) -> AtelierResult<()> {
        info!(skill = %name, "Skill deactivated");
        self.db.deactivate_skill(name)
    }

    /// All active skills.
    pub fn list_active(&self) -> AtelierResult<Vec<Skill>> {
        self.db.active_skills()
    }

    /// Look a skill up by name.
    pub fn get(&self, name: &str) -> AtelierResult<Option<Skill>> {
        self.db.get_skill_by_name(name)
    }
}
