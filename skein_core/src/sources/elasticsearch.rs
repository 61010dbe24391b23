//! Full-text search over an Elasticsearch index.
//!
//! Pages through `_search` with from/size, emitting one item per hit. The
//! hit `_id` becomes the item id and `_type` the item type, so documents
//! indexed under different types map to distinct graph node categories.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::scalar_values;
use crate::error::{ConfigError, SourceError};
use crate::item::Item;
use crate::query::Query;
use crate::{DataSource, ItemStream};

const PAGE_SIZE: usize = 50;

fn default_max_results() -> usize {
    200
}

#[derive(Debug, Clone, Deserialize)]
struct ElasticsearchParams {
    /// Index URL, e.g. `http://127.0.0.1:9200/tweets`.
    url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

pub struct ElasticsearchSource {
    name: String,
    client: Client,
    endpoint: Url,
    params: ElasticsearchParams,
}

/// Constructor registered for the `elasticsearch` kind.
pub fn from_params(name: &str, params: &Value) -> Result<Arc<dyn DataSource>, ConfigError> {
    let params: ElasticsearchParams =
        serde_json::from_value(params.clone()).map_err(|err| ConfigError::MalformedDescriptor {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
    let mut endpoint = Url::parse(&params.url).map_err(|err| ConfigError::MalformedDescriptor {
        name: name.to_string(),
        reason: format!("invalid url: {err}"),
    })?;
    endpoint
        .path_segments_mut()
        .map_err(|()| ConfigError::MalformedDescriptor {
            name: name.to_string(),
            reason: "url cannot be a base".to_string(),
        })?
        .pop_if_empty()
        .push("_search");
    Ok(Arc::new(ElasticsearchSource {
        name: name.to_string(),
        client: Client::new(),
        endpoint,
        params,
    }))
}

#[async_trait]
impl DataSource for ElasticsearchSource {
    fn kind(&self) -> &'static str {
        "elasticsearch"
    }

    fn description(&self) -> &'static str {
        "full-text search over an Elasticsearch index"
    }

    async fn search(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ItemStream, SourceError> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let name = self.name.clone();
        let username = self.params.username.clone();
        let password = self.params.password.clone();
        let max_results = self.params.max_results;

        let stream = try_stream! {
            let mut from = 0usize;
            'pages: loop {
                if cancel.is_cancelled() {
                    break 'pages;
                }
                let body = build_body(&query, from, PAGE_SIZE);
                let mut request = client.post(endpoint.clone()).json(&body);
                if let Some(user) = &username {
                    request = request.basic_auth(user, password.as_deref());
                }
                let response = request.send().await?.error_for_status()?;
                let page: SearchResponse = response.json().await?;
                let hits = page.hits.hits;
                if hits.is_empty() {
                    break 'pages;
                }
                let count = hits.len();
                debug!(source = %name, from, count, "elasticsearch page");
                for hit in hits {
                    if cancel.is_cancelled() {
                        break 'pages;
                    }
                    yield hit_to_item(&name, hit)?;
                }
                from += count;
                if count < PAGE_SIZE || from >= max_results {
                    break 'pages;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_type", default)]
    doc_type: Option<String>,
    #[serde(rename = "_source", default)]
    source: Map<String, Value>,
}

fn build_body(query: &Query, from: usize, size: usize) -> Value {
    let mut must = vec![json!({"query_string": {"query": query.text}})];
    if let Some(Value::Object(filters)) = &query.filters {
        for (field, value) in filters {
            let mut term = Map::new();
            term.insert(field.clone(), value.clone());
            must.push(json!({"term": Value::Object(term)}));
        }
    }
    json!({
        "from": from,
        "size": size,
        "query": {"bool": {"must": must}},
    })
}

fn hit_to_item(source_name: &str, hit: Hit) -> Result<Item, SourceError> {
    let doc_type = hit.doc_type.unwrap_or_else(|| "doc".to_string());
    let mut item = Item::new(source_name, doc_type, hit.id)?;
    for (field, value) in hit.source {
        for scalar in scalar_values(value) {
            item = item.with_field(field.clone(), scalar);
        }
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::FieldValue;

    #[test]
    fn hit_maps_to_item_with_type_and_fields() {
        let hit: Hit = serde_json::from_value(json!({
            "_id": "doc-1",
            "_type": "article",
            "_source": {
                "title": "hello",
                "tags": ["a", "b"],
                "views": 12,
            }
        }))
        .unwrap();

        let item = hit_to_item("es", hit).unwrap();
        assert_eq!(item.graph_key(), ("es", "article", "doc-1"));
        assert_eq!(
            item.field("title").unwrap(),
            &[FieldValue::String("hello".into())]
        );
        assert_eq!(
            item.field("tags").unwrap(),
            &[FieldValue::String("a".into()), FieldValue::String("b".into())]
        );
        assert_eq!(item.field("views").unwrap(), &[FieldValue::Number(12.0)]);
    }

    #[test]
    fn hit_without_type_defaults_to_doc() {
        let hit: Hit = serde_json::from_value(json!({"_id": "1"})).unwrap();
        let item = hit_to_item("es", hit).unwrap();
        assert_eq!(item.item_type(), "doc");
    }

    #[test]
    fn body_carries_query_string_and_paging() {
        let query = Query::new("q1", "alpha beta");
        let body = build_body(&query, 50, 25);
        assert_eq!(body["from"], 50);
        assert_eq!(body["size"], 25);
        assert_eq!(
            body["query"]["bool"]["must"][0]["query_string"]["query"],
            "alpha beta"
        );
    }

    #[test]
    fn filters_become_term_clauses() {
        let mut query = Query::new("q1", "alpha");
        query.filters = Some(json!({"user": "alice"}));
        let body = build_body(&query, 0, 10);
        assert_eq!(body["query"]["bool"]["must"][1]["term"]["user"], "alice");
    }

    #[test]
    fn descriptor_requires_url() {
        let err = from_params("es", &json!({})).err().unwrap();
        assert!(matches!(err, ConfigError::MalformedDescriptor { .. }));
    }

    #[test]
    fn endpoint_appends_search_to_index_url() {
        let source = from_params("es", &json!({"url": "http://127.0.0.1:9200/tweets"})).unwrap();
        assert_eq!(source.kind(), "elasticsearch");
    }
}
