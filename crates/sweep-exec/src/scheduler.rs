//! Resource-bound scheduler.
//!
//! One worker per resource slot pulls task indices from a shared, pre-filled
//! queue, so at most `slots` commands run at any time. Within a task the
//! commands run in declared order and the first failure ends the task.
//! Per-command state moves `scheduled -> running -> finished | failed`.

use crate::events::{CommandRef, SchedulerEvent};
use crate::runner::Runner;
use crate::state::{StateError, StateStore, DEFAULT_LOCK_TIMEOUT};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sweep_core::config::DEFAULT_RESOURCE_ENV;
use sweep_core::render::shell_quote;
use sweep_core::types::{CommandStatus, Task};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("no resource slots configured")]
    NoResources,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Re-run commands already marked finished.
    pub force: bool,
    /// Announce commands without running them or touching state.
    pub dry_run: bool,
    /// Environment variable receiving the slot.
    pub resource_env: String,
    pub lock_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            force: false,
            dry_run: false,
            resource_env: DEFAULT_RESOURCE_ENV.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    /// Tasks taken off the queue; less than `total` after cancellation.
    pub dispatched: usize,
    /// Output directories of tasks with at least one skipped command.
    pub skipped: Vec<PathBuf>,
    /// Output directories of tasks that stopped on a failed command.
    pub failed: Vec<PathBuf>,
}

impl RunSummary {
    pub fn cancelled(&self) -> bool {
        self.dispatched < self.total
    }
}

#[derive(Debug)]
pub struct Scheduler {
    resources: Vec<String>,
    options: SchedulerOptions,
    store: StateStore,
    runner: Runner,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(resources: Vec<String>, options: SchedulerOptions) -> Self {
        Self {
            resources,
            store: StateStore::new(options.lock_timeout),
            runner: Runner::new(options.resource_env.clone()),
            options,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Send progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Stop dequeuing new tasks once `token` is cancelled. Running commands
    /// are left to finish.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    /// Run every task and wait for all workers to drain the queue.
    ///
    /// A state error stops the worker that hit it; it is returned once the
    /// other workers have finished.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<RunSummary> {
        if self.resources.is_empty() {
            return Err(SchedulerError::NoResources);
        }

        let total = tasks.len();
        let (tx, rx) = mpsc::channel(total.max(1));
        for index in 0..total {
            if tx.send(index).await.is_err() {
                break;
            }
        }
        drop(tx);

        let tasks = Arc::new(tasks);
        let queue = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for resource in &self.resources {
            let worker = Worker {
                resource: resource.clone(),
                force: self.options.force,
                dry_run: self.options.dry_run,
                store: self.store.clone(),
                runner: self.runner.clone(),
                events: self.events.clone(),
            };
            workers.spawn(worker.run(
                Arc::clone(&tasks),
                Arc::clone(&queue),
                self.cancel.clone(),
            ));
        }
        info!(tasks = total, slots = self.resources.len(), "scheduler started");

        let mut dispatched = 0;
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let report = joined?;
            dispatched += report.dispatched;
            skipped.extend(report.skipped);
            failed.extend(report.failed);
            if first_error.is_none() {
                first_error = report.error;
            }
        }
        if let Some(err) = first_error {
            return Err(err.into());
        }

        skipped.sort_unstable();
        failed.sort_unstable();
        let output = |index: usize| tasks[index].meta.output.clone();
        let summary = RunSummary {
            total,
            dispatched,
            skipped: skipped.into_iter().map(output).collect(),
            failed: failed.into_iter().map(output).collect(),
        };
        info!(
            dispatched = summary.dispatched,
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "scheduler finished"
        );
        Ok(summary)
    }
}

/// Task indices collected by one worker.
#[derive(Debug, Default)]
struct WorkerReport {
    dispatched: usize,
    skipped: Vec<usize>,
    failed: Vec<usize>,
    error: Option<StateError>,
}

#[derive(Debug, Default)]
struct TaskOutcome {
    skipped: bool,
    failed: bool,
}

/// Executes tasks on a single resource slot.
#[derive(Debug)]
struct Worker {
    resource: String,
    force: bool,
    dry_run: bool,
    store: StateStore,
    runner: Runner,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Worker {
    async fn run(
        self,
        tasks: Arc<Vec<Task>>,
        queue: Arc<Mutex<mpsc::Receiver<usize>>>,
        cancel: CancellationToken,
    ) -> WorkerReport {
        let mut report = WorkerReport::default();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                index = async { queue.lock().await.recv().await } => index,
            };
            let Some(index) = next else {
                break;
            };
            report.dispatched += 1;

            match self.run_task(&tasks[index]).await {
                Ok(outcome) => {
                    if outcome.skipped {
                        report.skipped.push(index);
                    }
                    if outcome.failed {
                        report.failed.push(index);
                    }
                }
                Err(err) => {
                    warn!(
                        resource = %self.resource,
                        output = %tasks[index].meta.output.display(),
                        error = %err,
                        "state error; stopping worker"
                    );
                    report.failed.push(index);
                    report.error = Some(err);
                    break;
                }
            }
        }
        debug!(resource = %self.resource, dispatched = report.dispatched, "worker exiting");
        report
    }

    async fn run_task(&self, task: &Task) -> std::result::Result<TaskOutcome, StateError> {
        let output = &task.meta.output;
        let mut outcome = TaskOutcome::default();

        let finished = if self.dry_run {
            let mut finished = std::collections::BTreeSet::new();
            for command in task.commands.keys() {
                if self.store.status_of(output, command).await? == Some(CommandStatus::Finished) {
                    finished.insert(command.clone());
                }
            }
            finished
        } else {
            self.store
                .merge_params(output, &task.record(), &self.launch_lines(task))
                .await?;
            self.store
                .mark_scheduled(output, task.commands.keys().map(String::as_str))
                .await?
        };

        for (command, line) in &task.commands {
            let target = CommandRef {
                task: task.meta.name.clone(),
                output: output.clone(),
                command: command.clone(),
                resource: self.resource.clone(),
            };

            if !self.force && finished.contains(command) {
                debug!(output = %output.display(), command = %command, "already finished; skipping");
                outcome.skipped = true;
                self.emit(SchedulerEvent::CommandSkipped { target });
                continue;
            }

            if self.dry_run {
                self.emit(SchedulerEvent::CommandPlanned {
                    target,
                    line: line.clone(),
                });
                continue;
            }

            self.store
                .set_status(output, command, CommandStatus::Running, Some(self.resource.as_str()))
                .await?;
            info!(
                task = %task.meta.name,
                command = %command,
                resource = %self.resource,
                "dispatching command"
            );
            self.emit(SchedulerEvent::CommandStarted {
                target: target.clone(),
                line: line.clone(),
            });

            let (exit_code, duration) = match self.runner.run(line, &self.resource).await {
                Ok(result) => (result.exit_code, result.duration),
                Err(err) => {
                    warn!(command = %command, error = %err, "command could not be started");
                    (None, Duration::ZERO)
                }
            };
            let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

            if exit_code == Some(0) {
                self.store
                    .set_status(output, command, CommandStatus::Finished, None)
                    .await?;
                self.emit(SchedulerEvent::CommandFinished {
                    target,
                    duration_ms,
                });
            } else {
                self.store
                    .set_status(output, command, CommandStatus::Failed, None)
                    .await?;
                warn!(task = %task.meta.name, command = %command, ?exit_code, "command failed");
                self.emit(SchedulerEvent::CommandFailed {
                    target,
                    exit_code,
                    duration_ms,
                });
                outcome.failed = true;
                break;
            }
        }
        Ok(outcome)
    }

    /// Command lines as launched on this slot, for the parameter record.
    fn launch_lines(&self, task: &Task) -> IndexMap<String, String> {
        let slot = shell_quote(&self.resource);
        task.commands
            .iter()
            .map(|(command, line)| {
                let line = format!("{}={slot} {line}", self.runner.resource_env());
                (command.clone(), line)
            })
            .collect()
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
