//! Per-task state files guarded by advisory lock files.
//!
//! Every task output directory holds two YAML mappings:
//! - `param`: the full parameter record plus `_scripts` (command -> line as launched);
//! - `stat`: command -> status, plus `_resource` (slot last used).
//!
//! Writers hold an exclusive OS lock on `<file>.lock` for a read-modify-write
//! cycle. Readers never lock; writes go through a temp file and a rename.

use fs2::FileExt;
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value as Yaml};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sweep_core::types::{yaml_kind, CommandStatus, ParameterAssignment};
use thiserror::Error;
use tracing::{debug, warn};

pub const PARAM_FILE: &str = "param";
pub const STAT_FILE: &str = "stat";
pub const SCRIPTS_KEY: &str = "_scripts";
pub const RESOURCE_KEY: &str = "_resource";

/// Default interval between lock attempts.
pub const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(200);
/// Default bound on waiting for a lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{} holds a {found}, expected a mapping", path.display())]
    Malformed { path: PathBuf, found: &'static str },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Reads and updates state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    poll: Duration,
    timeout: Duration,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

impl StateStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            poll: DEFAULT_LOCK_POLL,
            timeout,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Read a state file. Absent, empty and null files read as an empty mapping.
    pub async fn read(&self, path: &Path) -> Result<Mapping> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Mapping::new()),
            Err(err) => return Err(err.into()),
        };
        if content.trim().is_empty() {
            return Ok(Mapping::new());
        }
        match serde_yaml::from_str::<Yaml>(&content)? {
            Yaml::Null => Ok(Mapping::new()),
            Yaml::Mapping(map) => Ok(map),
            other => Err(StateError::Malformed {
                path: path.to_path_buf(),
                found: yaml_kind(&other),
            }),
        }
    }

    /// Read-modify-write under the file's lock.
    ///
    /// `f` mutates the parsed mapping in place, so keys it does not touch are
    /// written back unchanged. Nothing is written if `f` fails.
    pub async fn update<R>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut Mapping) -> Result<R>,
    ) -> Result<R> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _lock = self.lock(path).await?;

        let mut map = self.read(path).await?;
        let result = f(&mut map)?;

        let yaml = serde_yaml::to_string(&Yaml::Mapping(map))?;
        let tmp = sibling(path, ".tmp");
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(result)
    }

    /// Take an exclusive OS lock on `<path>.lock`, polling until `timeout`.
    ///
    /// The lock lives as long as the returned handle and is released by the
    /// OS if this process dies, so a leftover lock file never blocks anyone.
    async fn lock(&self, path: &Path) -> Result<File> {
        let lock_path = sibling(path, ".lock");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .await?
            .into_std()
            .await;
        let started = Instant::now();
        let mut contended = false;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %lock_path.display(), "lock acquired");
                    return Ok(file);
                }
                Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        return Err(StateError::LockTimeout {
                            path: lock_path,
                            waited,
                        });
                    }
                    if !contended {
                        warn!(path = %lock_path.display(), "state file is locked; waiting");
                        contended = true;
                    }
                    tokio::time::sleep(self.poll).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Status of `command` in the task directory `dir`, if recorded.
    pub async fn status_of(&self, dir: &Path, command: &str) -> Result<Option<CommandStatus>> {
        let stat = self.read(&dir.join(STAT_FILE)).await?;
        Ok(stat
            .get(command)
            .and_then(Yaml::as_str)
            .and_then(CommandStatus::parse))
    }

    /// Record `status` for `command`, and the slot when given.
    pub async fn set_status(
        &self,
        dir: &Path,
        command: &str,
        status: CommandStatus,
        resource: Option<&str>,
    ) -> Result<()> {
        self.update(&dir.join(STAT_FILE), |stat| {
            stat.insert(command.into(), status.as_str().into());
            if let Some(resource) = resource {
                stat.insert(RESOURCE_KEY.into(), resource.into());
            }
            Ok(())
        })
        .await?;
        debug!(dir = %dir.display(), command, status = status.as_str(), "status recorded");
        Ok(())
    }

    /// Mark every command not yet finished as `scheduled`.
    ///
    /// Returns the commands that were already finished.
    pub async fn mark_scheduled<'a>(
        &self,
        dir: &Path,
        commands: impl IntoIterator<Item = &'a str>,
    ) -> Result<BTreeSet<String>> {
        self.update(&dir.join(STAT_FILE), |stat| {
            let mut finished = BTreeSet::new();
            for command in commands {
                let status = stat
                    .get(command)
                    .and_then(Yaml::as_str)
                    .and_then(CommandStatus::parse);
                if status == Some(CommandStatus::Finished) {
                    finished.insert(command.to_string());
                } else {
                    stat.insert(command.into(), CommandStatus::Scheduled.as_str().into());
                }
            }
            Ok(finished)
        })
        .await
    }

    /// Merge a parameter record and its rendered commands into `param`.
    ///
    /// Parameters overwrite; `_scripts` entries are merged per command.
    pub async fn merge_params(
        &self,
        dir: &Path,
        record: &ParameterAssignment,
        scripts: &IndexMap<String, String>,
    ) -> Result<()> {
        let mut values = Vec::with_capacity(record.len());
        for (key, value) in record {
            values.push((Yaml::from(key.as_str()), serde_yaml::to_value(value)?));
        }

        self.update(&dir.join(PARAM_FILE), move |param| {
            for (key, value) in values {
                param.insert(key, value);
            }
            let mut merged = match param.remove(SCRIPTS_KEY) {
                Some(Yaml::Mapping(existing)) => existing,
                _ => Mapping::new(),
            };
            for (command, line) in scripts {
                merged.insert(command.as_str().into(), line.as_str().into());
            }
            param.insert(SCRIPTS_KEY.into(), Yaml::Mapping(merged));
            Ok(())
        })
        .await
    }
}
