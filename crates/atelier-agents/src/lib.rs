//! The Atelier agent runtime and the concrete phase agents.
//!
//! Every agent implements [`WorkerAgent`]: a capability predicate and a
//! processing routine. The [`AgentRuntime`] owns the polling loops,
//! claims work through the blackboard, and converts any processing error
//! into a failed task — a thrown error never crashes a loop.

mod architect;
mod context;
mod evolution;
mod executor;
/// Deterministic quality gates run by the validator.
pub mod gates;
mod generator;
mod llm;
mod researcher;
mod runtime;
mod validator;

pub use architect::ArchitectAgent;
pub use context::AgentContext;
pub use evolution::{EvolutionAgent, EvolutionCycle};
pub use executor::ExecutorAgent;
pub use generator::GeneratorAgent;
pub use llm::{
    parse_thought, think, AgentThought, CompletionClient, HttpCompletionClient, ModelConfig,
};
pub use researcher::ResearcherAgent;
pub use runtime::{AgentRuntime, WorkerAgent};
pub use validator::ValidatorAgent;
