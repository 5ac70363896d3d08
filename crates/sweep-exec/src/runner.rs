//! Runs one rendered command line through bash on a resource slot.
//!
//! Output redirection is part of the rendered line, so the child inherits
//! the parent's stdio. A nonzero exit is an outcome, not an error.

use std::process::Stdio;
use std::time::{Duration, Instant};
use sweep_core::config::DEFAULT_RESOURCE_ENV;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Interval between progress log lines while a command runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to run `{shell}`: {source}")]
    Io {
        shell: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// How a finished child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    shell: String,
    resource_env: String,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(DEFAULT_RESOURCE_ENV)
    }
}

impl Runner {
    pub fn new(resource_env: impl Into<String>) -> Self {
        Self {
            shell: "bash".to_string(),
            resource_env: resource_env.into(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn resource_env(&self) -> &str {
        &self.resource_env
    }

    /// Run `line` with the slot exported and wait for it to exit.
    pub async fn run(&self, line: &str, resource: &str) -> Result<CommandOutcome> {
        let io_err = |source: std::io::Error| RunnerError::Io {
            shell: self.shell.clone(),
            source,
        };

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(line)
            .env(&self.resource_env, resource)
            .stdin(Stdio::null())
            .spawn()
            .map_err(io_err)?;
        debug!(resource, pid = child.id(), "spawned command");

        let started = Instant::now();
        let status = loop {
            tokio::select! {
                result = child.wait() => break result.map_err(io_err)?,
                () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    info!(
                        resource,
                        elapsed_sec = started.elapsed().as_secs(),
                        "command still running"
                    );
                }
            }
        };

        Ok(CommandOutcome {
            exit_code: status.code(),
            duration: started.elapsed(),
        })
    }
}
