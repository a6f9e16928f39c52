use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of target a policy rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    /// An external tool invocation.
    Tool,
    /// A contract-level operation (e.g. staging approval).
    Contract,
    /// An agent identity.
    Agent,
}

impl PolicyScope {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyScope::Tool => "tool",
            PolicyScope::Contract => "contract",
            PolicyScope::Agent => "agent",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool" => Some(PolicyScope::Tool),
            "contract" => Some(PolicyScope::Contract),
            "agent" => Some(PolicyScope::Agent),
            _ => None,
        }
    }
}

/// Whether a matching rule allows or denies the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    /// Permit the action.
    Allow,
    /// Block the action.
    Deny,
}

impl PolicyEffect {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyEffect::Allow => "allow",
            PolicyEffect::Deny => "deny",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(PolicyEffect::Allow),
            "deny" => Some(PolicyEffect::Deny),
            _ => None,
        }
    }
}

/// Structured predicate attached to a policy rule.
///
/// All fields are optional; an empty condition set matches every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConditions {
    /// Substring blocklist matched against the target path.
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    /// Substring blocklist matched (case-insensitively) against the
    /// context's `command` field.
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// When non-empty, only these agents match.
    #[serde(default)]
    pub allowed_agents: Vec<String>,
    /// Match only when `context.score >= min_score`.
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Always matches; the caller must then gate on a separate approval
    /// step.
    #[serde(default)]
    pub require_human_approval: bool,
}

impl PolicyConditions {
    /// Whether no condition is configured at all.
    pub fn is_empty(&self) -> bool {
        self.blocked_paths.is_empty()
            && self.blocked_commands.is_empty()
            && self.allowed_agents.is_empty()
            && self.min_score.is_none()
            && !self.require_human_approval
    }
}

/// A fail-closed access-control rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Row id assigned by the store.
    pub id: i64,
    /// Human-readable rule name.
    pub name: String,
    /// What kind of target the rule applies to.
    pub scope: PolicyScope,
    /// Target name or substring the rule applies to (`*` matches any).
    pub target: String,
    /// Allow or deny when the rule matches.
    pub effect: PolicyEffect,
    /// Structured predicate.
    pub conditions: PolicyConditions,
    /// Lower priority is evaluated first.
    pub priority: i64,
    /// Inactive rules are skipped.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Outcome recorded for a governed decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    /// The action was permitted.
    Allowed,
    /// The action was blocked.
    Denied,
    /// The action was carried out (post-hoc record).
    Executed,
}

impl AuditDecision {
    /// Stable text form used in store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditDecision::Allowed => "allowed",
            AuditDecision::Denied => "denied",
            AuditDecision::Executed => "executed",
        }
    }

    /// Parse the text form back. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allowed" => Some(AuditDecision::Allowed),
            "denied" => Some(AuditDecision::Denied),
            "executed" => Some(AuditDecision::Executed),
            _ => None,
        }
    }
}

/// Immutable record of one governed decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Row id assigned by the store.
    pub id: i64,
    /// Requesting agent.
    pub agent_name: String,
    /// Action that was evaluated or executed.
    pub action: String,
    /// Target of the action.
    pub target: String,
    /// Decision taken.
    pub decision: AuditDecision,
    /// Why the decision was taken.
    pub justification: String,
    /// Input snapshot.
    pub input: serde_json::Value,
    /// Output snapshot.
    pub output: serde_json::Value,
    /// Related task, if any.
    pub task_id: Option<i64>,
    /// Matched policy rule, if any.
    pub policy_id: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Parameters for recording a new audit entry.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    /// Requesting agent.
    pub agent_name: String,
    /// Action that was evaluated or executed.
    pub action: String,
    /// Target of the action.
    pub target: String,
    /// Decision taken.
    pub decision: AuditDecision,
    /// Why the decision was taken.
    pub justification: String,
    /// Input snapshot.
    pub input: serde_json::Value,
    /// Output snapshot.
    pub output: serde_json::Value,
    /// Related task, if any.
    pub task_id: Option<i64>,
    /// Matched policy rule, if any.
    pub policy_id: Option<i64>,
}

impl NewAuditEntry {
    /// Minimal entry with empty snapshots.
    pub fn new(
        agent_name: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        decision: AuditDecision,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            action: action.into(),
            target: target.into(),
            decision,
            justification: justification.into(),
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            task_id: None,
            policy_id: None,
        }
    }
}

/// A reusable capability distilled from repeated audited actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    /// Row id assigned by the store.
    pub id: i64,
    /// Unique skill name.
    pub name: String,
    /// What the skill does.
    pub description: String,
    /// Stable key of the pattern the skill was distilled from; used for
    /// de-duplication so the same pattern is never converted twice.
    pub source_key: String,
    /// Times the skill has been invoked.
    pub usage_count: u64,
    /// Successful invocations.
    pub success_count: u64,
    /// Running success percentage (0–100).
    pub success_rate: f64,
    /// Inactive skills are never offered.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_effect_round_trips() {
        for scope in [PolicyScope::Tool, PolicyScope::Contract, PolicyScope::Agent] {
            assert_eq!(PolicyScope::parse(scope.as_str()), Some(scope));
        }
        for effect in [PolicyEffect::Allow, PolicyEffect::Deny] {
            assert_eq!(PolicyEffect::parse(effect.as_str()), Some(effect));
        }
        for decision in [
            AuditDecision::Allowed,
            AuditDecision::Denied,
            AuditDecision::Executed,
        ] {
            assert_eq!(AuditDecision::parse(decision.as_str()), Some(decision));
        }
    }

    #[test]
    fn test_conditions_is_empty() {
        assert!(PolicyConditions::default().is_empty());
        let conditions = PolicyConditions {
            blocked_paths: vec!["/etc".into()],
            ..PolicyConditions::default()
        };
        assert!(!conditions.is_empty());
    }

    #[test]
    fn test_conditions_deserialize_partial() {
        let conditions: PolicyConditions =
            serde_json::from_str(r#"{"blocked_commands": ["rm -rf"]}"#).unwrap();
        assert_eq!(conditions.blocked_commands, vec!["rm -rf"]);
        assert!(conditions.blocked_paths.is_empty());
        assert!(!conditions.require_human_approval);
    }
}
