//! Bitcoin address lookups against the blockchain.info raw-address API.
//!
//! The query text is taken as an address; every transaction touching it
//! becomes one item carrying the input/output addresses and the total
//! output value.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConfigError, SourceError};
use crate::item::Item;
use crate::query::Query;
use crate::{DataSource, ItemStream};

const DEFAULT_ENDPOINT: &str = "https://blockchain.info";
const PAGE_SIZE: usize = 50;

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_max_transactions() -> usize {
    200
}

#[derive(Debug, Clone, Deserialize)]
struct BlockchainParams {
    #[serde(default = "default_endpoint")]
    url: String,
    #[serde(default = "default_max_transactions")]
    max_transactions: usize,
}

pub struct BlockchainSource {
    name: String,
    client: Client,
    params: BlockchainParams,
}

/// Constructor registered for the `blockchain` kind.
pub fn from_params(name: &str, params: &Value) -> Result<Arc<dyn DataSource>, ConfigError> {
    let params: BlockchainParams =
        serde_json::from_value(params.clone()).map_err(|err| ConfigError::MalformedDescriptor {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
    Ok(Arc::new(BlockchainSource {
        name: name.to_string(),
        client: Client::new(),
        params,
    }))
}

#[async_trait]
impl DataSource for BlockchainSource {
    fn kind(&self) -> &'static str {
        "blockchain"
    }

    fn description(&self) -> &'static str {
        "bitcoin transactions by address via blockchain.info"
    }

    async fn search(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ItemStream, SourceError> {
        let address = query.text.trim().to_string();
        if address.is_empty() {
            return Err(SourceError::Backend(
                "blockchain lookups need an address as the query text".to_string(),
            ));
        }
        let client = self.client.clone();
        let name = self.name.clone();
        let base = self.params.url.trim_end_matches('/').to_string();
        let max_transactions = self.params.max_transactions;

        let stream = try_stream! {
            let mut offset = 0usize;
            'pages: loop {
                if cancel.is_cancelled() {
                    break 'pages;
                }
                let url = format!("{base}/rawaddr/{address}");
                let response = client
                    .get(&url)
                    .query(&[("limit", PAGE_SIZE), ("offset", offset)])
                    .send()
                    .await?
                    .error_for_status()?;
                let page: RawAddr = response.json().await?;
                if page.txs.is_empty() {
                    break 'pages;
                }
                let count = page.txs.len();
                debug!(source = %name, offset, count, "blockchain page");
                for tx in page.txs {
                    if cancel.is_cancelled() {
                        break 'pages;
                    }
                    yield tx_to_item(&name, tx)?;
                }
                offset += count;
                if offset >= page.n_tx || offset >= max_transactions {
                    break 'pages;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Deserialize)]
struct RawAddr {
    #[serde(default)]
    n_tx: usize,
    #[serde(default)]
    txs: Vec<RawTx>,
}

#[derive(Debug, Deserialize)]
struct RawTx {
    hash: String,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    inputs: Vec<TxInput>,
    #[serde(default)]
    out: Vec<TxOutput>,
}

#[derive(Debug, Deserialize)]
struct TxInput {
    #[serde(default)]
    prev_out: Option<TxOutput>,
}

#[derive(Debug, Deserialize)]
struct TxOutput {
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    value: u64,
}

fn tx_to_item(source_name: &str, tx: RawTx) -> Result<Item, SourceError> {
    let mut item = Item::new(source_name, "transaction", tx.hash)?;
    if let Some(time) = Utc.timestamp_opt(tx.time, 0).single() {
        item = item.with_field("time", time);
    }
    let mut total = 0u64;
    for input in tx.inputs {
        if let Some(addr) = input.prev_out.and_then(|out| out.addr) {
            item = item.with_field("input", addr);
        }
    }
    for out in tx.out {
        total += out.value;
        if let Some(addr) = out.addr {
            item = item.with_field("output", addr);
        }
    }
    // total output value in satoshi
    item = item.with_field("value", total as f64);
    Ok(item)
}
