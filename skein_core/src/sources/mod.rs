//! Built-in data source integrations.
//!
//! Each backend lives in its own module, speaks plain HTTP+JSON through a
//! shared `reqwest` client, and normalizes responses into [`Item`]s with a
//! handful of pure functions that the module tests exercise directly.

pub mod blockchain;
pub mod elasticsearch;
pub mod twitter;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::item::FieldValue;

/// Flatten a JSON value into zero or more scalar field values.
///
/// Arrays flatten in order (multi-valued fields), RFC 3339 strings become
/// dates, nested objects and nulls are dropped.
pub(crate) fn scalar_values(value: Value) -> Vec<FieldValue> {
    match value {
        Value::String(s) => vec![date_or_string(s)],
        Value::Number(n) => n.as_f64().map(FieldValue::Number).into_iter().collect(),
        Value::Bool(b) => vec![FieldValue::String(b.to_string())],
        Value::Array(values) => values.into_iter().flat_map(scalar_values).collect(),
        Value::Null | Value::Object(_) => Vec::new(),
    }
}

pub(crate) fn date_or_string(s: String) -> FieldValue {
    match DateTime::parse_from_rfc3339(&s) {
        Ok(date) => FieldValue::Date(date.with_timezone(&Utc)),
        Err(_) => FieldValue::String(s),
    }
}
