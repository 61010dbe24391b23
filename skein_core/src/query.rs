//! Client-submitted query.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One client request, correlated with its results by the client-chosen
/// `queryId`. An empty `sources` list targets every registered source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub query_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sources: Vec<String>,
    /// Opaque to the hub; individual sources may interpret or ignore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

impl Query {
    pub fn new(query_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            text: text.into(),
            sources: Vec::new(),
            filters: None,
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }
}
