//! Core types shared by task generation and execution.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Bookkeeping key holding the generated task name.
pub const NAME_KEY: &str = "_name";
/// Bookkeeping key holding the run timestamp.
pub const TIME_KEY: &str = "_time";
/// Bookkeeping key holding the task output directory.
pub const OUTPUT_KEY: &str = "_output";

/// A scalar parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Convert a YAML node into a scalar, rejecting sequences and mappings.
    pub fn from_yaml(key: &str, node: &serde_yaml::Value) -> Result<Self, ConfigError> {
        match node {
            serde_yaml::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        found: n.to_string(),
                    })
                }
            }
            serde_yaml::Value::String(s) => Ok(Self::Str(s.clone())),
            serde_yaml::Value::Tagged(tagged) => Self::from_yaml(key, &tagged.value),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                found: yaml_kind(other).to_string(),
            }),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => f.write_str(&format_float(*x)),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// Shortest round-trip form, always keeping a fractional part or exponent.
pub fn format_float(x: f64) -> String {
    format!("{x:?}")
}

/// Human readable name of a YAML node kind, for error messages.
pub fn yaml_kind(node: &serde_yaml::Value) -> &'static str {
    match node {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "list",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged value",
    }
}

/// One concrete combination of parameter values.
///
/// Keys are kept sorted so serialization is canonical.
pub type ParameterAssignment = BTreeMap<String, Value>;

/// Canonical serialization of an assignment (sorted key/value pairs).
pub fn canonical_form(assignment: &ParameterAssignment) -> String {
    // BTreeMap keys are sorted and Value serializes without ambiguity.
    serde_json::to_string(assignment).unwrap_or_default()
}

/// Stable hash of an assignment's canonical form.
pub fn canonical_key(assignment: &ParameterAssignment) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_form(assignment).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Bookkeeping attached to each task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Generated name derived from the swept values.
    pub name: String,
    /// Run timestamp shared by every task of one invocation.
    pub time: String,
    /// Directory receiving state files and logs.
    pub output: PathBuf,
}

/// The unit of scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Resolved assignment, without bookkeeping keys.
    pub assignment: ParameterAssignment,
    pub meta: TaskMeta,
    /// Declared command name -> rendered shell string, in template order.
    pub commands: IndexMap<String, String>,
}

impl Task {
    /// The assignment with bookkeeping keys added.
    pub fn record(&self) -> ParameterAssignment {
        let mut record = self.assignment.clone();
        record.insert(NAME_KEY.to_string(), Value::Str(self.meta.name.clone()));
        record.insert(TIME_KEY.to_string(), Value::Str(self.meta.time.clone()));
        record.insert(
            OUTPUT_KEY.to_string(),
            Value::Str(self.meta.output.to_string_lossy().to_string()),
        );
        record
    }
}

/// Per-command execution status persisted in the `stat` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Scheduled,
    Running,
    Finished,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// How repeated assignments are treated during task generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Drop a repeat unless it targets a new output directory.
    #[default]
    Output,
    /// Like `Output`, but fold the repeat's commands into the earlier task.
    Merge,
    /// Keep every repeat as an independent task.
    None,
}

impl DedupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Merge => "merge",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "output" => Some(Self::Output),
            "merge" => Some(Self::Merge),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}
