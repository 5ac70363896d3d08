//! Progress events emitted by scheduler workers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifies one command of one task on the slot handling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRef {
    pub task: String,
    pub output: PathBuf,
    pub command: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerEvent {
    /// Dry run: the command would have been launched.
    CommandPlanned { target: CommandRef, line: String },
    CommandStarted { target: CommandRef, line: String },
    /// Already finished in an earlier invocation.
    CommandSkipped { target: CommandRef },
    CommandFinished { target: CommandRef, duration_ms: u64 },
    CommandFailed {
        target: CommandRef,
        /// `None` if the child was killed by a signal or never spawned.
        exit_code: Option<i32>,
        duration_ms: u64,
    },
}

impl SchedulerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandPlanned { .. } => "COMMAND_PLANNED",
            Self::CommandStarted { .. } => "COMMAND_STARTED",
            Self::CommandSkipped { .. } => "COMMAND_SKIPPED",
            Self::CommandFinished { .. } => "COMMAND_FINISHED",
            Self::CommandFailed { .. } => "COMMAND_FAILED",
        }
    }

    pub fn target(&self) -> &CommandRef {
        match self {
            Self::CommandPlanned { target, .. }
            | Self::CommandStarted { target, .. }
            | Self::CommandSkipped { target }
            | Self::CommandFinished { target, .. }
            | Self::CommandFailed { target, .. } => target,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
