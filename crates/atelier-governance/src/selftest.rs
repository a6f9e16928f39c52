use crate::engine::PolicyEngine;
use atelier_core::{AtelierResult, PolicyConditions, PolicyEffect, PolicyScope};
use atelier_store::{Db, NewPolicyRule};
use serde_json::{json, Value};
use tracing::info;

/// One regression case for the policy evaluator.
#[derive(Debug, Clone)]
pub struct SelfTestCase {
    /// Case label shown in reports.
    pub label: &'static str,
    /// Requesting agent.
    pub agent: &'static str,
    /// Requested action.
    pub action: &'static str,
    /// Action target.
    pub target: &'static str,
    /// Request context.
    pub context: Value,
    /// Expected evaluator verdict.
    pub expect_allowed: bool,
}

/// Result of running one self-test case.
#[derive(Debug, Clone)]
pub struct SelfTestOutcome {
    /// Case label.
    pub label: &'static str,
    /// Actual verdict.
    pub allowed: bool,
    /// Expected verdict.
    pub expect_allowed: bool,
    /// Whether actual matched expected.
    pub passed: bool,
}

/// Install the baseline rule set the self-test suite pins its
/// expectations against. Idempotent only by rule content, so callers
/// run it once per fresh store.
pub fn seed_default_policies(db: &Db) -> AtelierResult<()> {
    db.insert_policy(&NewPolicyRule {
        name: "protect-secret-paths".into(),
        scope: PolicyScope::Tool,
        target: "write_file".into(),
        effect: PolicyEffect::Deny,
        conditions: PolicyConditions {
            blocked_paths: vec![".env".into(), ".git/".into(), "secrets".into()],
            ..PolicyConditions::default()
        },
        priority: 10,
    })?;
    db.insert_policy(&NewPolicyRule {
        name: "block-destructive-commands".into(),
        scope: PolicyScope::Tool,
        target: "*".into(),
        effect: PolicyEffect::Deny,
        conditions: PolicyConditions {
            blocked_commands: vec!["rm -rf".into(), "drop table".into(), "git push --force".into()],
            ..PolicyConditions::default()
        },
        priority: 20,
    })?;
    db.insert_policy(&NewPolicyRule {
        name: "commit-only-executor".into(),
        scope: PolicyScope::Tool,
        target: "git_local_commit".into(),
        effect: PolicyEffect::Allow,
        conditions: PolicyConditions {
            allowed_agents: vec!["executor".into()],
            ..PolicyConditions::default()
        },
        priority: 30,
    })?;
    db.insert_policy(&NewPolicyRule {
        name: "commit-denied-otherwise".into(),
        scope: PolicyScope::Tool,
        target: "git_local_commit".into(),
        effect: PolicyEffect::Deny,
        conditions: PolicyConditions::default(),
        priority: 40,
    })?;
    db.insert_policy(&NewPolicyRule {
        name: "staging-needs-human".into(),
        scope: PolicyScope::Contract,
        target: "apply_staging".into(),
        effect: PolicyEffect::Allow,
        conditions: PolicyConditions {
            require_human_approval: true,
            ..PolicyConditions::default()
        },
        priority: 50,
    })?;
    Ok(())
}

/// The fixed case table. Expectations assume the
/// [`seed_default_policies`] rule set.
pub fn default_cases() -> Vec<SelfTestCase> {
    vec![
        SelfTestCase {
            label: "env write denied",
            agent: "executor",
            action: "write_file",
            target: "config/.env",
            context: json!({}),
            expect_allowed: false,
        },
        SelfTestCase {
            label: "source write allowed",
            agent: "generator",
            action: "write_file",
            target: "src/export.rs",
            context: json!({}),
            expect_allowed: true,
        },
        SelfTestCase {
            label: "destructive command denied",
            agent: "researcher",
            action: "shell",
            target: "workspace",
            context: json!({"command": "rm -rf /"}),
            expect_allowed: false,
        },
        SelfTestCase {
            label: "executor commit allowed",
            agent: "executor",
            action: "git_local_commit",
            target: "repo",
            context: json!({}),
            expect_allowed: true,
        },
        SelfTestCase {
            label: "validator commit denied",
            agent: "validator",
            action: "git_local_commit",
            target: "repo",
            context: json!({}),
            expect_allowed: false,
        },
        SelfTestCase {
            label: "unmatched action default allow",
            agent: "researcher",
            action: "telemetry_ping",
            target: "metrics",
            context: json!({}),
            expect_allowed: true,
        },
    ]
}

/// Run the fixed case table through the evaluator.
pub fn run_self_test(engine: &PolicyEngine) -> Vec<SelfTestOutcome> {
    default_cases()
        .into_iter()
        .map(|case| {
            let decision = engine.evaluate(case.agent, case.action, case.target, &case.context);
            let passed = decision.allowed == case.expect_allowed;
            info!(
                label = case.label,
                allowed = decision.allowed,
                expected = case.expect_allowed,
                passed,
                "policy self-test case"
            );
            SelfTestOutcome {
                label: case.label,
                allowed: decision.allowed,
                expect_allowed: case.expect_allowed,
                passed,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_passes_against_seeded_rules() {
        let db = Db::open_in_memory().unwrap();
        seed_default_policies(&db).unwrap();
        let engine = PolicyEngine::new(db);
        let outcomes = run_self_test(&engine);
        assert_eq!(outcomes.len(), default_cases().len());
        for outcome in &outcomes {
            assert!(outcome.passed, "case failed: {}", outcome.label);
        }
    }

    #[test]
    fn test_suite_detects_missing_rules() {
        // Without the seeded rules everything default-allows, so the
        // deny expectations must fail.
        let engine = PolicyEngine::new(Db::open_in_memory().unwrap());
        let outcomes = run_self_test(&engine);
        assert!(outcomes.iter().any(|o| !o.passed));
    }
}
