//! Core types and error definitions for the Atelier agent system.
//!
//! This crate provides the foundational types shared across all Atelier
//! crates: the unified error enum, the task/artifact/pipeline/job data
//! model, the event bus used for UI streaming, and the tool-collaborator
//! contract.
//!
//! # Main types
//!
//! - [`AtelierError`] — Unified error enum for all Atelier subsystems.
//! - [`AtelierResult`] — Convenience alias for `Result<T, AtelierError>`.
//! - [`Task`] / [`Artifact`] / [`AgentLog`] — The blackboard data model.
//! - [`Pipeline`] / [`StagingChange`] — The orchestrator data model.
//! - [`PolicyRule`] / [`AuditEntry`] — The governance data model.
//! - [`Job`] — A generic queued unit of work.
//! - [`EventBus`] / [`SystemEvent`] — Best-effort pub/sub for observers.
//! - [`ToolExecutor`] — The external file/search/typecheck/git collaborator.

/// Event bus and event payloads.
pub mod event;
/// Generic job queue types.
pub mod job;
/// Pipeline, phase, budget, runbook and staging types.
pub mod pipeline;
/// Governance types: policies, audit entries, skills.
pub mod policy;
/// Blackboard types: tasks, artifacts, agent logs.
pub mod task;
/// The external tool collaborator contract.
pub mod tool;

pub use event::{EventBus, SystemEvent};
pub use job::{Job, JobStatus, NewJob};
pub use pipeline::{
    is_protected_path, ApprovalRecord, Budget, BudgetOverrides, Phase, PhaseState, PhaseStatus,
    Pipeline, PipelineStatus, Runbook, RunbookEntry, StagingAction, StagingChange, StagingStatus,
    PROTECTED_PATHS,
};
pub use policy::{
    AuditDecision, AuditEntry, NewAuditEntry, PolicyConditions, PolicyEffect, PolicyRule,
    PolicyScope, Skill,
};
pub use task::{AgentLog, Artifact, ArtifactKind, NewTask, Task, TaskKind, TaskStatus};
pub use tool::{ToolExecutor, ToolOutcome};

/// Top-level error type for the Atelier system.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum AtelierError {
    /// An error from the persistent store (SQLite).
    #[error("Store error: {0}")]
    Store(String),

    /// An error raised by the blackboard task lifecycle.
    #[error("Blackboard error: {0}")]
    Blackboard(String),

    /// An error originating from an agent's processing routine.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error from the pipeline orchestrator.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// An error from the governance engine.
    #[error("Governance error: {0}")]
    Governance(String),

    /// An error from the job queue.
    #[error("Job error: {0}")]
    Job(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from an outbound HTTP request (e.g. completion service).
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`AtelierError`].
pub type AtelierResult<T> = Result<T, AtelierError>;
