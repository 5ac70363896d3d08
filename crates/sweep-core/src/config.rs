//! Sweep configuration loading.
//!
//! The configuration is a multi-document YAML file. The first document holds
//! the header (`template`, `resource`, `alias`, `default`, ...); every
//! following document is one choice block.
//!
//! ```yaml
//! template:
//!   train: python train.py --lr {lr} [amp]
//! resource: [0, 1]
//! ---
//! _title: baseline
//! lr: [0.1, 0.01]
//! amp: [true, false]
//! ```

use crate::alias::{Alias, Aliases};
use crate::types::{yaml_kind, DedupPolicy, ParameterAssignment, Value};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Environment variable receiving the resource slot when none is configured.
pub const DEFAULT_RESOURCE_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Reserved choice key selecting blocks by title.
pub const TITLE_KEY: &str = "_title";
/// Reserved choice key restricting a block to a subset of commands.
pub const COMMAND_KEY: &str = "_cmd";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("empty config file")]
    Empty,
    #[error("'{section}' should be in the first document")]
    MissingSection { section: String },
    #[error("'{section}' should be a {expected}, found {found}")]
    InvalidSection {
        section: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("'{section}' should not be empty")]
    EmptySection { section: String },
    #[error("'{key}' should be a list, not {found}")]
    NotAList { key: String, found: &'static str },
    #[error("'{key}' should be a string, int, float or bool, not {found}")]
    InvalidValue { key: String, found: String },
    #[error("all entries of alias '{key}' should have the same target keys, found {expected:?} and {found:?}")]
    InconsistentAlias {
        key: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("value '{value}' of '{key}' should be one of {allowed:?}")]
    UnknownAliasValue {
        key: String,
        value: String,
        allowed: Vec<String>,
    },
    #[error("alias param '{name}' should not be referenced in template '{command}'")]
    AliasInTemplate { command: String, name: String },
    #[error("boolean param '{name}' in template '{command}' is not supported as {{{name}}}, use [{name}]")]
    BoolPlaceholder { command: String, name: String },
    #[error("params {names:?} appear as both {{name}} and [name] in template '{command}'")]
    DuplicatePlaceholder { command: String, names: Vec<String> },
    #[error("params {names:?} in template '{command}' are not specified in 'default' or any choice")]
    MissingParams { command: String, names: Vec<String> },
    #[error("unknown commands {names:?}, expected one of {known:?}")]
    UnknownCommand {
        names: Vec<String>,
        known: Vec<String>,
    },
    #[error("tasks '{first}' and '{second}' would share output directory {}", output.display())]
    OutputCollision {
        output: std::path::PathBuf,
        first: String,
        second: String,
    },
    #[error("no choices available")]
    NoChoices,
    #[error("'_title' not specified in any choice")]
    TitleUnset,
    #[error("'_title'={0} not found in any choice")]
    TitleNotFound(String),
}

/// One choice block: candidate values per parameter plus reserved keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceBlock {
    pub title: Option<String>,
    /// Commands this block runs; `None` means every template.
    pub commands: Option<Vec<String>>,
    /// Parameter name -> raw YAML node (validated as a list by the sweeper).
    pub params: IndexMap<String, serde_yaml::Value>,
}

/// Parsed sweep configuration.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Command name -> template, in declaration order.
    pub templates: IndexMap<String, String>,
    pub resources: Vec<String>,
    pub aliases: Aliases,
    pub defaults: ParameterAssignment,
    pub resource_env: String,
    pub dedup: Option<DedupPolicy>,
    pub choices: Vec<ChoiceBlock>,
}

impl SweepConfig {
    /// Load a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse config content (multi-document YAML).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut docs = Vec::new();
        for document in serde_yaml::Deserializer::from_str(content) {
            docs.push(serde_yaml::Value::deserialize(document)?);
        }
        let mut docs = docs.into_iter();
        let header = match docs.next() {
            None | Some(serde_yaml::Value::Null) => return Err(ConfigError::Empty),
            Some(serde_yaml::Value::Mapping(map)) => map,
            Some(other) => {
                return Err(ConfigError::InvalidSection {
                    section: "header".to_string(),
                    expected: "mapping",
                    found: yaml_kind(&other),
                })
            }
        };

        let templates = Self::parse_templates(&header)?;
        let resources = Self::parse_resources(&header)?;
        let aliases = Self::parse_aliases(&header)?;
        let defaults = Self::parse_defaults(&header)?;

        let resource_env = match header.get("resource_env") {
            None => DEFAULT_RESOURCE_ENV.to_string(),
            Some(serde_yaml::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(other) => {
                return Err(ConfigError::InvalidSection {
                    section: "resource_env".to_string(),
                    expected: "non-empty string",
                    found: yaml_kind(other),
                })
            }
        };

        let dedup = match header.get("dedup") {
            None => None,
            Some(serde_yaml::Value::String(s)) => {
                Some(DedupPolicy::parse(s).ok_or_else(|| ConfigError::InvalidValue {
                    key: "dedup".to_string(),
                    found: s.clone(),
                })?)
            }
            Some(other) => {
                return Err(ConfigError::InvalidSection {
                    section: "dedup".to_string(),
                    expected: "string",
                    found: yaml_kind(other),
                })
            }
        };

        let choices = docs
            .filter(|doc| !doc.is_null())
            .map(|doc| Self::parse_choice(doc, &templates))
            .collect::<Result<Vec<_>, _>>()?;
        if choices.is_empty() {
            return Err(ConfigError::NoChoices);
        }

        Ok(Self {
            templates,
            resources,
            aliases,
            defaults,
            resource_env,
            dedup,
            choices,
        })
    }

    fn section<'a>(
        header: &'a serde_yaml::Mapping,
        section: &str,
        required: bool,
    ) -> Result<Option<&'a serde_yaml::Value>, ConfigError> {
        match header.get(section) {
            None | Some(serde_yaml::Value::Null) if required => Err(ConfigError::MissingSection {
                section: section.to_string(),
            }),
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(value) => Ok(Some(value)),
        }
    }

    fn parse_templates(header: &serde_yaml::Mapping) -> Result<IndexMap<String, String>, ConfigError> {
        let Some(node) = Self::section(header, "template", true)? else {
            return Err(ConfigError::MissingSection {
                section: "template".to_string(),
            });
        };
        let map = node.as_mapping().ok_or(ConfigError::InvalidSection {
            section: "template".to_string(),
            expected: "mapping",
            found: yaml_kind(node),
        })?;
        if map.is_empty() {
            return Err(ConfigError::EmptySection {
                section: "template".to_string(),
            });
        }
        let mut templates = IndexMap::new();
        for (name, template) in map {
            let name = scalar_key(name);
            let template = template.as_str().ok_or_else(|| ConfigError::InvalidSection {
                section: format!("template.{name}"),
                expected: "string",
                found: yaml_kind(template),
            })?;
            templates.insert(name, template.to_string());
        }
        Ok(templates)
    }

    fn parse_resources(header: &serde_yaml::Mapping) -> Result<Vec<String>, ConfigError> {
        let Some(node) = Self::section(header, "resource", true)? else {
            return Err(ConfigError::MissingSection {
                section: "resource".to_string(),
            });
        };
        let list = node.as_sequence().ok_or(ConfigError::InvalidSection {
            section: "resource".to_string(),
            expected: "list",
            found: yaml_kind(node),
        })?;
        if list.is_empty() {
            return Err(ConfigError::EmptySection {
                section: "resource".to_string(),
            });
        }
        list.iter()
            .map(|slot| Value::from_yaml("resource", slot).map(|v| v.to_string()))
            .collect()
    }

    fn parse_aliases(header: &serde_yaml::Mapping) -> Result<Aliases, ConfigError> {
        let Some(node) = Self::section(header, "alias", false)? else {
            return Ok(Aliases::new());
        };
        let map = node.as_mapping().ok_or(ConfigError::InvalidSection {
            section: "alias".to_string(),
            expected: "mapping",
            found: yaml_kind(node),
        })?;
        let mut aliases = Aliases::new();
        for (key, rule) in map {
            let key = scalar_key(key);
            let alias = Alias::from_yaml(&key, rule)?;
            aliases.insert(key, alias);
        }
        Ok(aliases)
    }

    fn parse_defaults(header: &serde_yaml::Mapping) -> Result<ParameterAssignment, ConfigError> {
        let Some(node) = Self::section(header, "default", false)? else {
            return Ok(ParameterAssignment::new());
        };
        let map = node.as_mapping().ok_or(ConfigError::InvalidSection {
            section: "default".to_string(),
            expected: "mapping",
            found: yaml_kind(node),
        })?;
        map.iter()
            .map(|(key, value)| {
                let key = scalar_key(key);
                let value = Value::from_yaml(&key, value)?;
                Ok((key, value))
            })
            .collect()
    }

    fn parse_choice(
        doc: serde_yaml::Value,
        templates: &IndexMap<String, String>,
    ) -> Result<ChoiceBlock, ConfigError> {
        let serde_yaml::Value::Mapping(map) = doc else {
            return Err(ConfigError::InvalidSection {
                section: "choice".to_string(),
                expected: "mapping",
                found: yaml_kind(&doc),
            });
        };

        let mut block = ChoiceBlock {
            title: None,
            commands: None,
            params: IndexMap::new(),
        };
        for (key, value) in map {
            let key = scalar_key(&key);
            match key.as_str() {
                TITLE_KEY => block.title = Some(Value::from_yaml(TITLE_KEY, &value)?.to_string()),
                COMMAND_KEY => {
                    let names = match &value {
                        serde_yaml::Value::Sequence(items) => items
                            .iter()
                            .map(|item| Value::from_yaml(COMMAND_KEY, item).map(|v| v.to_string()))
                            .collect::<Result<Vec<_>, _>>()?,
                        scalar => vec![Value::from_yaml(COMMAND_KEY, scalar)?.to_string()],
                    };
                    check_commands(&names, templates)?;
                    block.commands = Some(names);
                }
                _ => {
                    block.params.insert(key, value);
                }
            }
        }
        Ok(block)
    }

    /// Keep only the choice blocks carrying the given title.
    pub fn select_title(&mut self, title: &str) -> Result<(), ConfigError> {
        if self.choices.iter().all(|choice| choice.title.is_none()) {
            return Err(ConfigError::TitleUnset);
        }
        self.choices
            .retain(|choice| choice.title.as_deref() == Some(title));
        if self.choices.is_empty() {
            return Err(ConfigError::TitleNotFound(title.to_string()));
        }
        Ok(())
    }
}

/// Fail if any requested command has no template.
pub fn check_commands(
    names: &[String],
    templates: &IndexMap<String, String>,
) -> Result<(), ConfigError> {
    let unknown: Vec<String> = names
        .iter()
        .filter(|name| !templates.contains_key(name.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::UnknownCommand {
            names: unknown,
            known: templates.keys().cloned().collect(),
        })
    }
}

/// Mapping keys may be written as numbers or booleans; treat them as names.
pub(crate) fn scalar_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r"
template:
  train: python train.py --lr {lr} [amp]
  eval: python eval.py --out {_output}
resource: [0, '1,2']
default:
  seed: 1
---
_title: small
lr: [0.1, 0.01]
amp: [true]
---
_title: big
_cmd: [train]
lr: [1.0]
amp: [false]
";

    #[test]
    fn parse_basic_config() {
        let config = SweepConfig::parse(BASIC).unwrap();
        assert_eq!(
            config.templates.keys().collect::<Vec<_>>(),
            vec!["train", "eval"]
        );
        assert_eq!(config.resources, vec!["0", "1,2"]);
        assert_eq!(config.defaults.get("seed"), Some(&Value::Int(1)));
        assert_eq!(config.resource_env, DEFAULT_RESOURCE_ENV);
        assert_eq!(config.choices.len(), 2);
        assert_eq!(config.choices[1].commands, Some(vec!["train".to_string()]));
        assert!(!config.choices[0].params.contains_key(TITLE_KEY));
    }

    #[test]
    fn missing_template_is_reported() {
        let err = SweepConfig::parse("resource: [0]\n---\na: [1]\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection { ref section } if section == "template"));
    }

    #[test]
    fn missing_resource_is_reported() {
        let err = SweepConfig::parse("template: {a: echo}\n---\na: [1]\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection { ref section } if section == "resource"));
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(matches!(SweepConfig::parse(""), Err(ConfigError::Empty)));
    }

    #[test]
    fn no_choices_is_rejected() {
        let err = SweepConfig::parse("template: {a: echo}\nresource: [0]\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoChoices));
    }

    #[test]
    fn unknown_cmd_in_choice_is_rejected() {
        let content = "template: {a: echo}\nresource: [0]\n---\n_cmd: [b]\nx: [1]\n";
        let err = SweepConfig::parse(content).unwrap_err();
        match err {
            ConfigError::UnknownCommand { names, known } => {
                assert_eq!(names, vec!["b"]);
                assert_eq!(known, vec!["a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn select_title_filters_blocks() {
        let mut config = SweepConfig::parse(BASIC).unwrap();
        config.select_title("big").unwrap();
        assert_eq!(config.choices.len(), 1);
        assert_eq!(config.choices[0].title.as_deref(), Some("big"));
    }

    #[test]
    fn select_title_not_found() {
        let mut config = SweepConfig::parse(BASIC).unwrap();
        let err = config.select_title("huge").unwrap_err();
        assert!(matches!(err, ConfigError::TitleNotFound(ref t) if t == "huge"));
    }

    #[test]
    fn select_title_unset() {
        let content = "template: {a: echo}\nresource: [0]\n---\nx: [1]\n";
        let mut config = SweepConfig::parse(content).unwrap();
        assert!(matches!(config.select_title("any"), Err(ConfigError::TitleUnset)));
    }

    #[test]
    fn parse_dedup_and_resource_env() {
        let content = "template: {a: echo}\nresource: [0]\nresource_env: HIP_VISIBLE_DEVICES\ndedup: merge\n---\nx: [1]\n";
        let config = SweepConfig::parse(content).unwrap();
        assert_eq!(config.resource_env, "HIP_VISIBLE_DEVICES");
        assert_eq!(config.dedup, Some(DedupPolicy::Merge));
    }

    #[test]
    fn invalid_dedup_is_rejected() {
        let content = "template: {a: echo}\nresource: [0]\ndedup: sometimes\n---\nx: [1]\n";
        assert!(matches!(
            SweepConfig::parse(content),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "dedup"
        ));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("params.yaml");
        std::fs::write(&path, BASIC).unwrap();
        let config = SweepConfig::from_file(&path).unwrap();
        assert_eq!(config.choices.len(), 2);
    }
}
