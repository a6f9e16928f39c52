//! The shared task board that decouples Atelier agents from each other.
//!
//! Agents never talk to one another directly: they poll the blackboard
//! for claimable work, write artifacts and narration logs back to it,
//! and complete or fail their tasks. Completion cascades to the parent
//! task, which is how the pipeline orchestrator observes phase progress.

mod board;
/// Pure validators applied before artifacts are trusted.
pub mod guardrails;

pub use board::{Blackboard, BoardStats, TaskDetails};
pub use guardrails::{validate_content, validate_file_path, GuardrailViolation};
