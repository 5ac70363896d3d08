//! Command template rendering.
//!
//! Two placeholder forms are supported:
//! - `{name}` is replaced by the shell-escaped value of `name`;
//! - `[name]` is replaced by `--name <value>`, or by a bare `--name` /
//!   nothing for booleans.
//!
//! After substitution a log redirection is appended to every command.

use crate::alias::Aliases;
use crate::config::ConfigError;
use crate::task::RunContext;
use crate::types::{ParameterAssignment, TaskMeta, Value};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

fn direct_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([\w\-]+?)\}").expect("valid placeholder pattern"))
}

fn flag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[([\w\-]+?)\]").expect("valid flag pattern"))
}

fn any_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([\w\-]+?)\}|\[([\w\-]+?)\]").expect("valid placeholder pattern")
    })
}

fn line_break_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s*\n\s*").expect("valid line break pattern"))
}

/// A template filled with parameter values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub command: String,
    /// Parameter names referenced by any placeholder.
    pub consumed: BTreeSet<String>,
}

/// Quote a string for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'"'"'"#))
    }
}

/// Shell form of a non-boolean scalar.
fn shell_arg(value: &Value) -> Option<String> {
    match value {
        Value::Bool(_) => None,
        Value::Int(_) | Value::Float(_) => Some(value.to_string()),
        Value::Str(s) => Some(shell_quote(s)),
    }
}

/// Fill one template. `record` must include bookkeeping keys.
pub fn render_template(
    command: &str,
    template: &str,
    record: &ParameterAssignment,
    aliases: &Aliases,
) -> Result<Rendered, ConfigError> {
    let template = line_break_pattern().replace_all(template.trim(), " ");

    let direct: BTreeSet<String> = direct_pattern()
        .captures_iter(&template)
        .map(|c| c[1].to_string())
        .collect();
    let flags: BTreeSet<String> = flag_pattern()
        .captures_iter(&template)
        .map(|c| c[1].to_string())
        .collect();

    let both: Vec<String> = direct.intersection(&flags).cloned().collect();
    if !both.is_empty() {
        return Err(ConfigError::DuplicatePlaceholder {
            command: command.to_string(),
            names: both,
        });
    }

    if let Some(name) = direct.iter().chain(&flags).find(|name| aliases.contains_key(name.as_str())) {
        return Err(ConfigError::AliasInTemplate {
            command: command.to_string(),
            name: name.clone(),
        });
    }

    let missing: Vec<String> = direct
        .iter()
        .chain(&flags)
        .filter(|name| !record.contains_key(name.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if !missing.is_empty() {
        return Err(ConfigError::MissingParams {
            command: command.to_string(),
            names: missing,
        });
    }

    let mut direct_values = HashMap::with_capacity(direct.len());
    for name in &direct {
        let value = shell_arg(&record[name]).ok_or_else(|| ConfigError::BoolPlaceholder {
            command: command.to_string(),
            name: name.clone(),
        })?;
        direct_values.insert(name.as_str(), value);
    }
    let flag_values: HashMap<&str, String> = flags
        .iter()
        .map(|name| {
            let fragment = match &record[name] {
                Value::Bool(true) => format!("--{name}"),
                Value::Bool(false) => String::new(),
                other => format!("--{name} {}", shell_arg(other).unwrap_or_default()),
            };
            (name.as_str(), fragment)
        })
        .collect();

    // One pass, so substituted values are never scanned for placeholders.
    let filled = any_pattern().replace_all(&template, |caps: &regex::Captures<'_>| {
        match (caps.get(1), caps.get(2)) {
            (Some(name), _) => direct_values.get(name.as_str()).cloned(),
            (None, Some(name)) => flag_values.get(name.as_str()).cloned(),
            (None, None) => None,
        }
        .unwrap_or_default()
    });

    Ok(Rendered {
        command: filled.into_owned(),
        consumed: direct.into_iter().chain(flags).collect(),
    })
}

/// Log file name for one command of a task.
pub fn log_file_name(command: &str, meta: &TaskMeta, ctx: &RunContext) -> String {
    if ctx.no_subdir {
        format!("log.{command}.{}.{}", meta.time, meta.name)
    } else {
        format!("log.{command}.{}", meta.time)
    }
}

/// Redirection appended to a rendered command.
///
/// Debug mode tees output to the terminal and keeps the command's own exit
/// status; otherwise output goes to the log file only.
pub fn log_suffix(command: &str, meta: &TaskMeta, ctx: &RunContext) -> String {
    let log = meta.output.join(log_file_name(command, meta, ctx));
    let log = shell_quote(&log.to_string_lossy());
    if ctx.debug {
        format!("2>&1 | tee {log}; exit ${{PIPESTATUS[0]}}")
    } else {
        format!("> {log} 2>&1")
    }
}
