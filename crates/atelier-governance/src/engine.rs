use crate::audit::AuditRecorder;
use atelier_core::{
    AtelierResult, AuditDecision, NewAuditEntry, PolicyConditions, PolicyEffect, PolicyRule,
    PolicyScope,
};
use atelier_store::Db;
use serde_json::Value;
use tracing::warn;

/// Outcome of one policy evaluation.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    /// Whether the action may proceed.
    pub allowed: bool,
    /// Human-readable reason for the decision.
    pub reason: String,
    /// The rule that decided, when one matched.
    pub matched_policy_id: Option<i64>,
}

/// Priority-ordered, first-match policy evaluator.
///
/// No matching rule means allow; the fail-closed guarantee applies to
/// evaluator malfunction only. Every evaluation — matched or not —
/// writes an audit entry synchronously before returning.
#[derive(Clone)]
pub struct PolicyEngine {
    db: Db,
    audit: AuditRecorder,
}

impl PolicyEngine {
    /// Wrap a store handle; audit entries go to the same store.
    pub fn new(db: Db) -> Self {
        let audit = AuditRecorder::new(db.clone());
        Self { db, audit }
    }

    /// The recorder this engine writes evaluations through.
    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    /// Evaluate a requested action against the active rule set.
    pub fn evaluate(
        &self,
        agent: &str,
        action: &str,
        target: &str,
        context: &Value,
    ) -> PolicyDecision {
        let decision = match self.evaluate_inner(agent, action, target, context) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, action = %action, "Policy evaluator malfunction; denying");
                PolicyDecision {
                    allowed: false,
                    reason: format!("policy evaluator failure: {e}"),
                    matched_policy_id: None,
                }
            }
        };
        let audit_decision = if decision.allowed {
            AuditDecision::Allowed
        } else {
            AuditDecision::Denied
        };
        let mut entry = NewAuditEntry::new(agent, action, target, audit_decision, &decision.reason);
        entry.input = context.clone();
        entry.policy_id = decision.matched_policy_id;
        self.audit.record(entry);
        decision
    }

    fn evaluate_inner(
        &self,
        agent: &str,
        action: &str,
        target: &str,
        context: &Value,
    ) -> AtelierResult<PolicyDecision> {
        let rules = self.db.active_policies()?;
        for rule in &rules {
            if !scope_matches(rule, agent, action, target) {
                continue;
            }
            if !conditions_match(&rule.conditions, agent, target, context) {
                continue;
            }
            return Ok(PolicyDecision {
                allowed: rule.effect == PolicyEffect::Allow,
                reason: format!("matched policy '{}'", rule.name),
                matched_policy_id: Some(rule.id),
            });
        }
        Ok(PolicyDecision {
            allowed: true,
            reason: "no matching policy (default allow)".to_string(),
            matched_policy_id: None,
        })
    }
}

/// Whether the rule's scope and target cover this request.
fn scope_matches(rule: &PolicyRule, agent: &str, action: &str, target: &str) -> bool {
    match rule.scope {
        PolicyScope::Tool => rule.target == "*" || rule.target == action,
        PolicyScope::Agent => rule.target == "*" || rule.target == agent,
        PolicyScope::Contract => rule.target == "*" || target.contains(rule.target.as_str()),
    }
}

/// Short-circuit condition dispatch: the first configured condition kind
/// decides whether the rule matches the request.
fn conditions_match(
    conditions: &PolicyConditions,
    agent: &str,
    target: &str,
    context: &Value,
) -> bool {
    if !conditions.blocked_paths.is_empty() {
        return conditions
            .blocked_paths
            .iter()
            .any(|p| target.contains(p.as_str()));
    }
    if !conditions.blocked_commands.is_empty() {
        let command = context
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        return conditions
            .blocked_commands
            .iter()
            .any(|c| command.contains(&c.to_lowercase()));
    }
    if !conditions.allowed_agents.is_empty() {
        return conditions.allowed_agents.iter().any(|a| a == agent);
    }
    if conditions.require_human_approval {
        return true;
    }
    if let Some(min_score) = conditions.min_score {
        return context
            .get("score")
            .and_then(Value::as_f64)
            .is_some_and(|score| score >= min_score);
    }
    // An empty condition set matches every request.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_store::NewPolicyRule;
    use serde_json::json;

    fn engine_with(rules: &[NewPolicyRule]) -> (PolicyEngine, Db) {
        let db = Db::open_in_memory().unwrap();
        for rule in rules {
            db.insert_policy(rule).unwrap();
        }
        (PolicyEngine::new(db.clone()), db)
    }

    fn deny_paths(target: &str, paths: &[&str], priority: i64) -> NewPolicyRule {
        NewPolicyRule {
            name: format!("deny-{target}"),
            scope: PolicyScope::Tool,
            target: target.into(),
            effect: PolicyEffect::Deny,
            conditions: PolicyConditions {
                blocked_paths: paths.iter().map(|s| s.to_string()).collect(),
                ..PolicyConditions::default()
            },
            priority,
        }
    }

    #[test]
    fn test_default_allow_when_no_rule_matches() {
        let (engine, db) = engine_with(&[]);
        let decision = engine.evaluate("generator", "write_file", "src/a.rs", &json!({}));
        assert!(decision.allowed);
        assert!(decision.matched_policy_id.is_none());
        // The evaluation itself was audited.
        assert_eq!(db.recent_audit_entries(10).unwrap().len(), 1);
    }

    #[test]
    fn test_blocked_path_denies() {
        let (engine, _db) = engine_with(&[deny_paths("write_file", &[".env", ".git/"], 10)]);
        let denied = engine.evaluate("executor", "write_file", "config/.env", &json!({}));
        assert!(!denied.allowed);
        assert!(denied.matched_policy_id.is_some());

        let allowed = engine.evaluate("executor", "write_file", "src/a.rs", &json!({}));
        assert!(allowed.allowed);
    }

    #[test]
    fn test_blocked_command_case_insensitive() {
        let (engine, _db) = engine_with(&[NewPolicyRule {
            name: "no-destructive".into(),
            scope: PolicyScope::Tool,
            target: "*".into(),
            effect: PolicyEffect::Deny,
            conditions: PolicyConditions {
                blocked_commands: vec!["rm -rf".into()],
                ..PolicyConditions::default()
            },
            priority: 10,
        }]);
        let denied = engine.evaluate(
            "researcher",
            "shell",
            "workspace",
            &json!({"command": "RM -RF /tmp/x"}),
        );
        assert!(!denied.allowed);

        let allowed = engine.evaluate(
            "researcher",
            "shell",
            "workspace",
            &json!({"command": "ls -la"}),
        );
        assert!(allowed.allowed);
    }

    #[test]
    fn test_agent_allowlist() {
        let (engine, _db) = engine_with(&[
            NewPolicyRule {
                name: "commit-for-executor".into(),
                scope: PolicyScope::Tool,
                target: "git_local_commit".into(),
                effect: PolicyEffect::Allow,
                conditions: PolicyConditions {
                    allowed_agents: vec!["executor".into()],
                    ..PolicyConditions::default()
                },
                priority: 10,
            },
            NewPolicyRule {
                name: "commit-denied-otherwise".into(),
                scope: PolicyScope::Tool,
                target: "git_local_commit".into(),
                effect: PolicyEffect::Deny,
                conditions: PolicyConditions::default(),
                priority: 20,
            },
        ]);
        assert!(engine
            .evaluate("executor", "git_local_commit", "repo", &json!({}))
            .allowed);
        assert!(!engine
            .evaluate("validator", "git_local_commit", "repo", &json!({}))
            .allowed);
    }

    #[test]
    fn test_min_score_threshold() {
        let (engine, _db) = engine_with(&[NewPolicyRule {
            name: "quality-bar".into(),
            scope: PolicyScope::Contract,
            target: "deploy".into(),
            effect: PolicyEffect::Allow,
            conditions: PolicyConditions {
                min_score: Some(60.0),
                ..PolicyConditions::default()
            },
            priority: 10,
        }]);
        let high = engine.evaluate("executor", "stage", "deploy", &json!({"score": 82}));
        assert!(high.allowed);
        assert!(high.matched_policy_id.is_some());

        // Below threshold the rule does not match; default allow applies
        // with no matched rule.
        let low = engine.evaluate("executor", "stage", "deploy", &json!({"score": 12}));
        assert!(low.allowed);
        assert!(low.matched_policy_id.is_none());
    }

    #[test]
    fn test_priority_order_first_match_wins() {
        let (engine, _db) = engine_with(&[
            NewPolicyRule {
                name: "allow-first".into(),
                scope: PolicyScope::Tool,
                target: "read_file".into(),
                effect: PolicyEffect::Allow,
                conditions: PolicyConditions::default(),
                priority: 1,
            },
            NewPolicyRule {
                name: "deny-later".into(),
                scope: PolicyScope::Tool,
                target: "read_file".into(),
                effect: PolicyEffect::Deny,
                conditions: PolicyConditions::default(),
                priority: 99,
            },
        ]);
        let decision = engine.evaluate("researcher", "read_file", "src/a.rs", &json!({}));
        assert!(decision.allowed);
        assert_eq!(decision.reason, "matched policy 'allow-first'");
    }

    #[test]
    fn test_fail_closed_on_evaluator_malfunction() {
        let (engine, db) = engine_with(&[]);
        db.break_table("policies").unwrap();
        let decision = engine.evaluate("generator", "write_file", "src/a.rs", &json!({}));
        assert!(!decision.allowed);
        assert!(decision.reason.contains("policy evaluator failure"));
    }

    #[test]
    fn test_human_approval_flag_always_matches() {
        let (engine, _db) = engine_with(&[NewPolicyRule {
            name: "hitl-staging".into(),
            scope: PolicyScope::Contract,
            target: "apply_staging".into(),
            effect: PolicyEffect::Allow,
            conditions: PolicyConditions {
                require_human_approval: true,
                ..PolicyConditions::default()
            },
            priority: 10,
        }]);
        let decision = engine.evaluate("executor", "approve", "apply_staging", &json!({}));
        assert!(decision.allowed);
        assert!(decision.matched_policy_id.is_some());
    }
}
