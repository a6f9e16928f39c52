//! The Atelier pipeline orchestrator.
//!
//! Drives one five-phase workflow per development request: design →
//! codegen → validation → staging → evolution. Enforces a resource
//! budget before every phase start and on every monitor tick, holds
//! candidate file edits as staging changes until a human approves, and
//! records everything into an append-only runbook per pipeline.

mod orchestrator;
mod staging;

pub use orchestrator::PipelineOrchestrator;
pub use staging::{ApproveOutcome, RollbackOutcome};
