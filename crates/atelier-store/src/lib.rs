//! SQLite persistence for the Atelier agent system.
//!
//! One [`Db`] handle wraps a single `rusqlite` connection behind a mutex;
//! every other crate coordinates exclusively through it. Claim-style
//! operations (`claim_task`, `claim_next_job`) are expressed as
//! conditional `UPDATE ... WHERE status = 'pending'` statements so that
//! two concurrent callers observing the same claimable row never both
//! win.

mod artifacts;
mod db;
mod governance;
mod jobs;
mod pipelines;
mod tasks;

pub use db::Db;
pub use governance::NewPolicyRule;
pub use jobs::AgentSummary;
pub use pipelines::NewStagingChange;
pub use tasks::TaskStatusCounts;
