//! sweep-exec - resource-bound execution of rendered tasks.
//!
//! Workers pull tasks from a shared queue, one per resource slot, and record
//! per-command progress in YAML state files so a later invocation can resume.

pub mod events;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use events::{CommandRef, SchedulerEvent};
pub use runner::{CommandOutcome, Runner, RunnerError};
pub use scheduler::{RunSummary, Scheduler, SchedulerError, SchedulerOptions};
pub use state::{StateError, StateStore};
