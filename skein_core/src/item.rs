//! The normalized result unit every data source maps into.
//!
//! Two items with the same `(sourceName, itemType, id)` triple are the same
//! graph node to downstream consumers and must be safely mergeable by field
//! union. Merging itself is a consumer concern; the hub only guarantees the
//! identity triple and immutability after construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidItem;

/// A single scalar field value.
///
/// Untagged on the wire: numbers stay numbers, RFC 3339 strings become
/// dates, everything else is a plain string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Date(DateTime<Utc>),
    String(String),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

/// One normalized result record contributed by a data source.
///
/// `id` is unique within the item's source and type, not globally. Fields
/// are multi-valued; values within a field keep insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    id: String,
    item_type: String,
    source_name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    fields: HashMap<String, Vec<FieldValue>>,
}

impl Item {
    /// Create a new item. Fails when `id` or `item_type` is empty.
    pub fn new(
        source_name: impl Into<String>,
        item_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, InvalidItem> {
        let id = id.into();
        let item_type = item_type.into();
        if id.is_empty() {
            return Err(InvalidItem("id"));
        }
        if item_type.is_empty() {
            return Err(InvalidItem("itemType"));
        }
        Ok(Self {
            id,
            item_type,
            source_name: source_name.into(),
            fields: HashMap::new(),
        })
    }

    /// Append one value to a (possibly multi-valued) field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn item_type(&self) -> &str {
        &self.item_type
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// All values recorded for a field, in insertion order.
    pub fn field(&self, name: &str) -> Option<&[FieldValue]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    pub fn fields(&self) -> &HashMap<String, Vec<FieldValue>> {
        &self.fields
    }

    /// The `(sourceName, itemType, id)` identity triple used for graph node
    /// merging downstream.
    pub fn graph_key(&self) -> (&str, &str, &str) {
        (&self.source_name, &self.item_type, &self.id)
    }
}
