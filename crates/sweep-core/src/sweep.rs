//! Cartesian-product expansion of a choice block.

use crate::config::ConfigError;
use crate::types::{canonical_form, yaml_kind, ParameterAssignment, Value};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use rand::Rng;

/// Parameter name -> raw candidate list, as written in a choice block.
pub type ParameterChoice = IndexMap<String, serde_yaml::Value>;

/// Expand a choice into every combination of its candidate values.
///
/// With `sample`, the full product is shuffled, truncated to `sample`
/// entries, and the survivors sorted by canonical form so runs with
/// different seeds still list tasks in a comparable order.
pub fn sweep<R: Rng + ?Sized>(
    choice: &ParameterChoice,
    sample: Option<usize>,
    rng: &mut R,
) -> Result<Vec<ParameterAssignment>, ConfigError> {
    let mut axes: Vec<(&str, Vec<Value>)> = Vec::with_capacity(choice.len());
    for (key, node) in choice {
        let serde_yaml::Value::Sequence(items) = node else {
            return Err(ConfigError::NotAList {
                key: key.clone(),
                found: yaml_kind(node),
            });
        };
        let values = items
            .iter()
            .map(|item| Value::from_yaml(key, item))
            .collect::<Result<Vec<_>, _>>()?;
        axes.push((key.as_str(), values));
    }

    let mut product = vec![ParameterAssignment::new()];
    for (key, values) in &axes {
        let mut next = Vec::with_capacity(product.len() * values.len());
        for partial in &product {
            for value in values {
                let mut combined = partial.clone();
                combined.insert((*key).to_string(), value.clone());
                next.push(combined);
            }
        }
        product = next;
    }

    if let Some(count) = sample {
        product.shuffle(rng);
        product.truncate(count);
        product.sort_by_cached_key(canonical_form);
    }
    Ok(product)
}
