//! Tagged metric value and the storage-column routing rule (C1/C5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    #[default]
    Null,
}

impl MetricValue {
    /// Promotes a value to a numeric reading for condition evaluation.
    /// Unparseable strings evaluate to `None`, which callers treat as a
    /// false condition rather than an error (alarm conditions never panic
    /// on unexpected payload shapes).
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Float(f) => Some(*f),
            MetricValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            MetricValue::String(s) => s.trim().parse::<f64>().ok(),
            MetricValue::Null => None,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            MetricValue::Int(i) => i.to_string(),
            MetricValue::Float(f) => f.to_string(),
            MetricValue::Bool(b) => b.to_string(),
            MetricValue::String(s) => s.clone(),
            MetricValue::Null => String::new(),
        }
    }
}

/// Which physical history column a Sparkplug type name routes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRoute {
    Int,
    Float,
    Bool,
    String,
}

/// Case-insensitive prefix match on the Sparkplug type name, per the C5
/// routing rule: `int*`/`uint*` -> int, `float`/`double` -> float,
/// `boolean` -> bool, everything else -> string.
pub fn route_for_type(type_name: &str) -> ColumnRoute {
    let lower = type_name.to_ascii_lowercase();
    if lower.starts_with("int") || lower.starts_with("uint") {
        ColumnRoute::Int
    } else if lower == "float" || lower == "double" {
        ColumnRoute::Float
    } else if lower == "boolean" {
        ColumnRoute::Bool
    } else {
        ColumnRoute::String
    }
}

/// A 64-bit value that may have arrived as a big-integer wire value beyond
/// the safe-integer range. We normalise to `i64`, accepting the documented
/// precision loss for magnitudes beyond `2^63`.
pub fn promote_bigint(raw: i128) -> i64 {
    raw.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_promotes_to_zero_or_one() {
        assert_eq!(MetricValue::Bool(true).as_numeric(), Some(1.0));
        assert_eq!(MetricValue::Bool(false).as_numeric(), Some(0.0));
    }

    #[test]
    fn unparseable_string_is_none_not_error() {
        assert_eq!(MetricValue::String("not a number".into()).as_numeric(), None);
    }

    #[test]
    fn numeric_string_parses() {
        assert_eq!(MetricValue::String(" 72.5 ".into()).as_numeric(), Some(72.5));
    }

    #[test]
    fn route_prefix_matching_is_case_insensitive() {
        assert_eq!(route_for_type("Int32"), ColumnRoute::Int);
        assert_eq!(route_for_type("UInt64"), ColumnRoute::Int);
        assert_eq!(route_for_type("Float"), ColumnRoute::Float);
        assert_eq!(route_for_type("Double"), ColumnRoute::Float);
        assert_eq!(route_for_type("Boolean"), ColumnRoute::Bool);
        assert_eq!(route_for_type("String"), ColumnRoute::String);
        assert_eq!(route_for_type("Template"), ColumnRoute::String);
    }

    #[test]
    fn bigint_beyond_i64_clamps_instead_of_panicking() {
        let huge: i128 = i64::MAX as i128 + 1000;
        assert_eq!(promote_bigint(huge), i64::MAX);
    }
}
