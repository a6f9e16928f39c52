//! Generic claim-based asynchronous job processing for Atelier.
//!
//! Jobs are persisted rows claimed with conditional updates (no two
//! workers ever receive the same job), executed by registered handlers,
//! retried up to a per-job cap, and dead-lettered on exhaustion.

mod processor;
mod queue;

pub use processor::{JobHandler, JobProcessor};
pub use queue::{hour_bucket, JobQueue};
