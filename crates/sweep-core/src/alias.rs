//! Alias rules and assignment resolution.
//!
//! An alias either broadcasts one value to several parameters:
//!
//! ```yaml
//! alias:
//!   seed: [model_seed, data_seed]
//! ```
//!
//! or remaps a symbolic value to a fragment of parameters:
//!
//! ```yaml
//! alias:
//!   size:
//!     small: { layers: 2, hidden: 128 }
//!     large: { layers: 8, hidden: 1024 }
//! ```

use crate::config::{scalar_key, ConfigError};
use crate::types::{yaml_kind, ParameterAssignment, Value};
use indexmap::IndexMap;

/// Registered alias rules by parameter name.
pub type Aliases = IndexMap<String, Alias>;

#[derive(Debug, Clone, PartialEq)]
pub enum Alias {
    /// Copy the value to every target name.
    Broadcast(Vec<String>),
    /// Replace a candidate value with a fragment. Every fragment shares the
    /// same key set.
    Remap(Vec<(Value, ParameterAssignment)>),
}

impl Alias {
    /// Parse and validate one alias rule.
    pub fn from_yaml(key: &str, node: &serde_yaml::Value) -> Result<Self, ConfigError> {
        let section = format!("alias.{key}");
        match node {
            serde_yaml::Value::Sequence(targets) => {
                if targets.is_empty() {
                    return Err(ConfigError::EmptySection { section });
                }
                let targets = targets
                    .iter()
                    .map(|target| Value::from_yaml(&section, target).map(|v| v.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Broadcast(targets))
            }
            serde_yaml::Value::Mapping(cases) => {
                if cases.is_empty() {
                    return Err(ConfigError::EmptySection { section });
                }
                let mut expected: Option<Vec<String>> = None;
                let mut remap = Vec::with_capacity(cases.len());
                for (case, fragment) in cases {
                    let case_value = Value::from_yaml(&section, case)?;
                    let case_section = format!("{section}.{}", scalar_key(case));
                    let fragment_map =
                        fragment
                            .as_mapping()
                            .ok_or_else(|| ConfigError::InvalidSection {
                                section: case_section.clone(),
                                expected: "mapping",
                                found: yaml_kind(fragment),
                            })?;
                    if fragment_map.is_empty() {
                        return Err(ConfigError::EmptySection {
                            section: case_section,
                        });
                    }
                    let mut parsed = ParameterAssignment::new();
                    for (name, value) in fragment_map {
                        let name = scalar_key(name);
                        let value = Value::from_yaml(&name, value)?;
                        parsed.insert(name, value);
                    }

                    let keys: Vec<String> = parsed.keys().cloned().collect();
                    match &expected {
                        None => expected = Some(keys),
                        Some(first) if *first != keys => {
                            return Err(ConfigError::InconsistentAlias {
                                key: key.to_string(),
                                expected: first.clone(),
                                found: keys,
                            });
                        }
                        Some(_) => {}
                    }
                    remap.push((case_value, parsed));
                }
                Ok(Self::Remap(remap))
            }
            other => Err(ConfigError::InvalidSection {
                section,
                expected: "list or mapping",
                found: yaml_kind(other),
            }),
        }
    }

    /// Fragment replacing `key = value`.
    pub fn expand(&self, key: &str, value: &Value) -> Result<ParameterAssignment, ConfigError> {
        match self {
            Self::Broadcast(targets) => Ok(targets
                .iter()
                .map(|target| (target.clone(), value.clone()))
                .collect()),
            Self::Remap(cases) => cases
                .iter()
                .find(|(case, _)| case == value)
                .map(|(_, fragment)| fragment.clone())
                .ok_or_else(|| ConfigError::UnknownAliasValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    allowed: cases.iter().map(|(case, _)| case.to_string()).collect(),
                }),
        }
    }
}

/// Apply alias rules, then backfill defaults.
///
/// Alias keys are removed from the assignment and their fragments merged in.
/// Defaults only fill keys that are still absent.
pub fn resolve(
    mut assignment: ParameterAssignment,
    aliases: &Aliases,
    defaults: &ParameterAssignment,
) -> Result<ParameterAssignment, ConfigError> {
    let alias_keys: Vec<String> = assignment
        .keys()
        .filter(|key| aliases.contains_key(key.as_str()))
        .cloned()
        .collect();

    let mut merged = ParameterAssignment::new();
    for key in alias_keys {
        let (Some(value), Some(alias)) = (assignment.remove(&key), aliases.get(&key)) else {
            continue;
        };
        merged.extend(alias.expand(&key, &value)?);
    }
    assignment.extend(merged);

    for (key, value) in defaults {
        assignment
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases(yaml: &str) -> Aliases {
        let node: serde_yaml::Mapping = serde_yaml::from_str(yaml).unwrap();
        node.iter()
            .map(|(k, v)| {
                let key = scalar_key(k);
                let alias = Alias::from_yaml(&key, v).unwrap();
                (key, alias)
            })
            .collect()
    }

    fn assignment(pairs: &[(&str, Value)]) -> ParameterAssignment {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn broadcast_copies_value_and_removes_key() {
        let aliases = aliases("seed: [model_seed, data_seed]");
        let resolved = resolve(
            assignment(&[("seed", Value::Int(7)), ("lr", Value::Float(0.1))]),
            &aliases,
            &ParameterAssignment::new(),
        )
        .unwrap();
        assert_eq!(
            resolved,
            assignment(&[
                ("data_seed", Value::Int(7)),
                ("lr", Value::Float(0.1)),
                ("model_seed", Value::Int(7)),
            ])
        );
    }

    #[test]
    fn remap_merges_fragment() {
        let aliases = aliases("size: {small: {layers: 2, hidden: 128}, large: {layers: 8, hidden: 1024}}");
        let resolved = resolve(
            assignment(&[("size", Value::from("large"))]),
            &aliases,
            &ParameterAssignment::new(),
        )
        .unwrap();
        assert_eq!(
            resolved,
            assignment(&[("hidden", Value::Int(1024)), ("layers", Value::Int(8))])
        );
    }

    #[test]
    fn remap_unknown_value_lists_allowed() {
        let aliases = aliases("size: {small: {layers: 2}, large: {layers: 8}}");
        let err = resolve(
            assignment(&[("size", Value::from("medium"))]),
            &aliases,
            &ParameterAssignment::new(),
        )
        .unwrap_err();
        match err {
            ConfigError::UnknownAliasValue {
                key,
                value,
                allowed,
            } => {
                assert_eq!(key, "size");
                assert_eq!(value, "medium");
                assert_eq!(allowed, vec!["small", "large"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn remap_with_non_string_cases() {
        let aliases = aliases("fast: {true: {steps: 10}, false: {steps: 1000}}");
        let resolved = resolve(
            assignment(&[("fast", Value::Bool(false))]),
            &aliases,
            &ParameterAssignment::new(),
        )
        .unwrap();
        assert_eq!(resolved, assignment(&[("steps", Value::Int(1000))]));
    }

    #[test]
    fn inconsistent_remap_is_rejected() {
        let node: serde_yaml::Value =
            serde_yaml::from_str("{small: {layers: 2}, large: {hidden: 8}}").unwrap();
        let err = Alias::from_yaml("size", &node).unwrap_err();
        assert!(matches!(err, ConfigError::InconsistentAlias { ref key, .. } if key == "size"));
    }

    #[test]
    fn scalar_alias_is_rejected() {
        let node: serde_yaml::Value = serde_yaml::from_str("3").unwrap();
        assert!(matches!(
            Alias::from_yaml("x", &node),
            Err(ConfigError::InvalidSection { .. })
        ));
    }

    #[test]
    fn defaults_never_overwrite() {
        let defaults = assignment(&[("lr", Value::Float(0.5)), ("epochs", Value::Int(3))]);
        let resolved = resolve(
            assignment(&[("lr", Value::Float(0.1))]),
            &Aliases::new(),
            &defaults,
        )
        .unwrap();
        assert_eq!(
            resolved,
            assignment(&[("epochs", Value::Int(3)), ("lr", Value::Float(0.1))])
        );
    }

    #[test]
    fn defaults_apply_after_aliases() {
        let aliases = aliases("size: {small: {layers: 2}}");
        let defaults = assignment(&[("layers", Value::Int(99)), ("hidden", Value::Int(64))]);
        let resolved = resolve(
            assignment(&[("size", Value::from("small"))]),
            &aliases,
            &defaults,
        )
        .unwrap();
        assert_eq!(
            resolved,
            assignment(&[("hidden", Value::Int(64)), ("layers", Value::Int(2))])
        );
    }
}
