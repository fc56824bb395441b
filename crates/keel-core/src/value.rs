use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a customer data field or variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Structured,
}

/// Runtime value for variables and customer data entries.
///
/// A tagged union instead of raw JSON so the generator can stringify with a
/// per-type formatter and validation can check values against `ValueType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// Opaque structured payload; kept as raw JSON.
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldValue::Str(_) => ValueType::String,
            FieldValue::Int(_) => ValueType::Int,
            FieldValue::Float(_) => ValueType::Float,
            FieldValue::Bool(_) => ValueType::Bool,
            FieldValue::Timestamp(_) => ValueType::Timestamp,
            FieldValue::Json(_) => ValueType::Structured,
        }
    }

    pub fn matches(&self, expected: ValueType) -> bool {
        self.value_type() == expected
    }

    /// Coerce a loosely typed JSON value (LLM output, legacy rows) into the
    /// declared type. Returns `None` when the value cannot represent the type.
    pub fn coerce(raw: &serde_json::Value, expected: ValueType) -> Option<FieldValue> {
        match expected {
            ValueType::String => raw.as_str().map(|s| FieldValue::Str(s.to_string())),
            ValueType::Int => raw
                .as_i64()
                .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))
                .map(FieldValue::Int),
            ValueType::Float => raw
                .as_f64()
                .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))
                .map(FieldValue::Float),
            ValueType::Bool => raw
                .as_bool()
                .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))
                .map(FieldValue::Bool),
            ValueType::Timestamp => raw
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| FieldValue::Timestamp(dt.with_timezone(&Utc))),
            ValueType::Structured => Some(FieldValue::Json(raw.clone())),
        }
    }
}

impl fmt::Display for FieldValue {
    /// Per-type formatter used wherever a value is rendered into prompt text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            FieldValue::Json(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_accepts_matching_types() {
        assert_eq!(
            FieldValue::coerce(&json!("hello"), ValueType::String),
            Some(FieldValue::Str("hello".into()))
        );
        assert_eq!(
            FieldValue::coerce(&json!(42), ValueType::Int),
            Some(FieldValue::Int(42))
        );
        assert_eq!(
            FieldValue::coerce(&json!("42"), ValueType::Int),
            Some(FieldValue::Int(42))
        );
        assert_eq!(FieldValue::coerce(&json!({}), ValueType::Int), None);
    }

    #[test]
    fn timestamp_round_trips_rfc3339() {
        let raw = json!("2026-03-01T12:00:00Z");
        let v = FieldValue::coerce(&raw, ValueType::Timestamp).unwrap();
        assert_eq!(v.to_string(), "2026-03-01T12:00:00+00:00");
        assert!(v.matches(ValueType::Timestamp));
    }

    #[test]
    fn serde_tagged_form_is_stable() {
        let v = FieldValue::Int(7);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json, json!({"type": "int", "value": 7}));
    }
}
