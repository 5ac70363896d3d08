//! Task naming.
//!
//! Each task is named after its swept values so output directories are
//! readable: `{lr: 0.01, batch_size: 32}` becomes `BaSize_32-Lr_0.01`.

use crate::types::{ParameterAssignment, Value};
use std::path::Path;

/// Maximum characters kept from a string value.
pub const MAX_VALUE_LENGTH: usize = 100;

/// Build a task name from an assignment (keys in sorted order).
pub fn task_name(assignment: &ParameterAssignment, max_value_len: usize) -> String {
    assignment
        .iter()
        .map(|(key, value)| format!("{}_{}", abbreviate_key(key), format_value(value, max_value_len)))
        .collect::<Vec<_>>()
        .join("-")
}

/// `learning_rate` -> `LeRate`: every component but the last is cut to two
/// characters, all components are title-cased.
fn abbreviate_key(key: &str) -> String {
    let components: Vec<&str> = if key.contains('-') {
        key.split('-').collect()
    } else {
        key.split('_').collect()
    };
    let Some((last, head)) = components.split_last() else {
        return String::new();
    };
    let mut out = String::new();
    for component in head {
        if component.chars().count() > 2 {
            out.push_str(&title_case(&component.chars().take(2).collect::<String>()));
        } else {
            out.push_str(component);
        }
    }
    out.push_str(&title_case(last));
    out
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn format_value(value: &Value, max_len: usize) -> String {
    match value {
        Value::Bool(true) => "T".to_string(),
        Value::Bool(false) => "F".to_string(),
        Value::Int(i) => format_general(*i as f64),
        Value::Float(x) => format_general(*x),
        Value::Str(s) => {
            let path = Path::new(s);
            let cleaned = match path.file_name() {
                Some(base) if path.exists() => base.to_string_lossy().to_string(),
                _ => s.trim_start_matches(['/', '.']).replace('/', "_"),
            };
            let len = cleaned.chars().count();
            if len > max_len {
                cleaned.chars().skip(len - max_len).collect()
            } else {
                cleaned
            }
        }
    }
}

/// printf-style `%g`: six significant digits, trailing zeros removed,
/// scientific notation for very small or large magnitudes.
pub fn format_general(x: f64) -> String {
    if x == 0.0 {
        return "0".to_string();
    }
    if !x.is_finite() {
        return if x.is_nan() {
            "nan".to_string()
        } else if x > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }

    let scientific = format!("{x:.5e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if !(-4..6).contains(&exponent) {
        let mantissa = trim_zeros(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = usize::try_from(5 - exponent).unwrap_or(0);
        trim_zeros(&format!("{x:.decimals$}")).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbreviates_keys() {
        assert_eq!(abbreviate_key("lr"), "Lr");
        assert_eq!(abbreviate_key("batch_size"), "BaSize");
        assert_eq!(abbreviate_key("num-train-epochs"), "NuTrEpochs");
        assert_eq!(abbreviate_key("a_b"), "aB");
    }

    #[test]
    fn general_format_matches_printf() {
        assert_eq!(format_general(0.01), "0.01");
        assert_eq!(format_general(32.0), "32");
        assert_eq!(format_general(1_000_000.0), "1e+06");
        assert_eq!(format_general(0.00001), "1e-05");
        assert_eq!(format_general(123_456.0), "123456");
        assert_eq!(format_general(0.123_456_789), "0.123457");
        assert_eq!(format_general(-2.5), "-2.5");
    }

    #[test]
    fn name_joins_sorted_entries() {
        let assignment = ParameterAssignment::from([
            ("lr".to_string(), Value::Float(0.01)),
            ("batch_size".to_string(), Value::Int(32)),
            ("amp".to_string(), Value::Bool(true)),
        ]);
        assert_eq!(task_name(&assignment, MAX_VALUE_LENGTH), "Amp_T-BaSize_32-Lr_0.01");
    }

    #[test]
    fn string_values_are_path_safe() {
        let assignment =
            ParameterAssignment::from([("data".to_string(), Value::from("./no/such/dir"))]);
        assert_eq!(task_name(&assignment, MAX_VALUE_LENGTH), "Data_no_such_dir");
    }

    #[test]
    fn existing_paths_use_basename() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("corpus.txt");
        std::fs::write(&file, "").unwrap();
        let assignment = ParameterAssignment::from([(
            "data".to_string(),
            Value::Str(file.to_string_lossy().to_string()),
        )]);
        assert_eq!(task_name(&assignment, MAX_VALUE_LENGTH), "Data_corpus.txt");
    }

    #[test]
    fn long_strings_keep_the_tail() {
        let assignment = ParameterAssignment::from([("x".to_string(), Value::from("abcdefgh"))]);
        assert_eq!(task_name(&assignment, 3), "X_fgh");
    }
}
