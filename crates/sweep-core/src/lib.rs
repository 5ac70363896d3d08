pub mod alias;
pub mod config;
pub mod dedup;
pub mod naming;
pub mod render;
pub mod sweep;
pub mod task;
pub mod types;

pub use config::{ConfigError, SweepConfig};
pub use task::{build_tasks, RunContext, TaskSet};
pub use types::*;
