//! Governance for Atelier agents: fail-closed policy evaluation, the
//! immutable audit trail, and the skill registry.
//!
//! Every privileged action passes through [`PolicyEngine::evaluate`].
//! The evaluator is fail-closed on its own malfunction — an internal
//! error during evaluation denies the action — while an absent rule
//! deliberately defaults to allow (the rule set, not the evaluator,
//! decides what is forbidden).

mod audit;
mod engine;
mod selftest;
mod skills;

pub use audit::AuditRecorder;
pub use engine::{PolicyDecision, PolicyEngine};
pub use selftest::{default_cases, run_self_test, seed_default_policies, SelfTestCase, SelfTestOutcome};
pub use skills::SkillRegistry;
