//! Task building: choice blocks in, rendered tasks out.

use crate::alias::resolve;
use crate::config::{check_commands, ConfigError, SweepConfig};
use crate::dedup::{Admission, Deduplicator};
use crate::naming::{task_name, MAX_VALUE_LENGTH};
use crate::render::{log_suffix, render_template};
use crate::sweep::sweep;
use crate::types::{canonical_key, DedupPolicy, Task, TaskMeta};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Timestamp format shared by log names and the `_time` key.
pub const TIME_FORMAT: &str = "%Y%m%d.%H%M%S";

/// Per-invocation settings threaded through task building and rendering.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub output_root: PathBuf,
    pub time: String,
    /// Write every task directly into `output_root`.
    pub no_subdir: bool,
    pub debug: bool,
    pub sample: Option<usize>,
    pub dedup: DedupPolicy,
    /// Overrides each block's `_cmd` when set.
    pub command_filter: Option<Vec<String>>,
    pub seed: Option<u64>,
}

impl RunContext {
    pub fn new(output_root: impl Into<PathBuf>, time: impl Into<String>) -> Self {
        Self {
            output_root: output_root.into(),
            time: time.into(),
            no_subdir: false,
            debug: false,
            sample: None,
            dedup: DedupPolicy::default(),
            command_filter: None,
            seed: None,
        }
    }

    /// Context stamped with the current local time.
    pub fn now(output_root: impl Into<PathBuf>) -> Self {
        Self::new(output_root, chrono::Local::now().format(TIME_FORMAT).to_string())
    }

    fn task_output(&self, name: &str) -> PathBuf {
        if self.no_subdir || name.is_empty() {
            self.output_root.clone()
        } else {
            self.output_root.join(name)
        }
    }
}

/// Tasks of one invocation plus the parameters no template used.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    pub tasks: Vec<Task>,
    pub orphans: BTreeSet<String>,
}

/// Length of the hash suffix that separates tasks whose names collide.
const COLLISION_SUFFIX_LENGTH: usize = 8;

/// Expand, resolve, deduplicate and render every choice block.
pub fn build_tasks(config: &SweepConfig, ctx: &RunContext) -> Result<TaskSet, ConfigError> {
    let mut rng = match ctx.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut dedup = Deduplicator::new(ctx.dedup);
    let mut outputs = OutputClaims::default();
    let mut set = TaskSet::default();
    // Parameter names referenced by each task's commands, across merges.
    let mut consumed: Vec<BTreeSet<String>> = Vec::new();

    for block in &config.choices {
        let selected = match ctx.command_filter.as_ref().or(block.commands.as_ref()) {
            Some(names) => {
                check_commands(names, &config.templates)?;
                names.iter().cloned().collect::<BTreeSet<_>>()
            }
            None => config.templates.keys().cloned().collect(),
        };

        for raw in sweep(&block.params, ctx.sample, &mut rng)? {
            let name = task_name(&raw, MAX_VALUE_LENGTH);
            let assignment = resolve(raw, &config.aliases, &config.defaults)?;
            let (name, output) = outputs.claim(name, &canonical_key(&assignment), ctx)?;

            let index = match dedup.admit(&assignment, &output, set.tasks.len()) {
                Admission::Drop => continue,
                Admission::Merge(index) => index,
                Admission::New => {
                    set.tasks.push(Task {
                        assignment,
                        meta: TaskMeta {
                            name,
                            time: ctx.time.clone(),
                            output,
                        },
                        commands: IndexMap::new(),
                    });
                    consumed.push(BTreeSet::new());
                    set.tasks.len() - 1
                }
            };

            let names = render_commands(&mut set.tasks[index], &selected, config, ctx)?;
            consumed[index].extend(names);
        }
    }

    for (task, consumed) in set.tasks.iter().zip(&consumed) {
        set.orphans.extend(
            task.assignment
                .keys()
                .filter(|key| !consumed.contains(key.as_str()))
                .cloned(),
        );
    }
    if ctx.debug {
        set.tasks.truncate(1);
    }
    Ok(set)
}

/// Output directories handed out so far, with the assignment owning each.
#[derive(Debug, Default)]
struct OutputClaims {
    /// Output directory -> (canonical key, task name).
    owners: HashMap<PathBuf, (String, String)>,
}

impl OutputClaims {
    /// Pick the name and output directory for an assignment with `key`.
    ///
    /// Names are lossy, so distinct assignments can render the same name.
    /// The later one gets a hash suffix. When every task shares the output
    /// root there is nothing to suffix and the collision is an error.
    fn claim(
        &mut self,
        name: String,
        key: &str,
        ctx: &RunContext,
    ) -> Result<(String, PathBuf), ConfigError> {
        let output = ctx.task_output(&name);
        let first = match self.owners.get(&output) {
            None => {
                self.owners
                    .insert(output.clone(), (key.to_string(), name.clone()));
                return Ok((name, output));
            }
            Some((owner, _)) if owner == key => return Ok((name, output)),
            Some((_, first)) => first.clone(),
        };

        let suffixed = format!("{name}.{}", &key[..COLLISION_SUFFIX_LENGTH]);
        let retry = ctx.task_output(&suffixed);
        if !name.is_empty() && retry != output {
            match self.owners.get(&retry) {
                None => {
                    self.owners
                        .insert(retry.clone(), (key.to_string(), suffixed.clone()));
                    return Ok((suffixed, retry));
                }
                Some((owner, _)) if owner == key => return Ok((suffixed, retry)),
                Some(_) => {}
            }
        }
        // Debug runs keep only the first task, which always owns its directory.
        if ctx.debug {
            return Ok((name, output));
        }
        Err(ConfigError::OutputCollision {
            output,
            first,
            second: name,
        })
    }
}

/// Render the selected commands missing from `task`, keeping template order.
fn render_commands(
    task: &mut Task,
    selected: &BTreeSet<String>,
    config: &SweepConfig,
    ctx: &RunContext,
) -> Result<BTreeSet<String>, ConfigError> {
    let record = task.record();
    let mut consumed = BTreeSet::new();
    let mut commands = IndexMap::with_capacity(config.templates.len());

    for (command, template) in &config.templates {
        if let Some(existing) = task.commands.get(command) {
            commands.insert(command.clone(), existing.clone());
            continue;
        }
        if !selected.contains(command) {
            continue;
        }
        let rendered = render_template(command, template, &record, &config.aliases)?;
        consumed.extend(rendered.consumed);
        let line = format!(
            "{} {}",
            rendered.command,
            log_suffix(command, &task.meta, ctx)
        );
        commands.insert(command.clone(), line);
    }

    task.commands = commands;
    Ok(consumed)
}
