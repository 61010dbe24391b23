//! Social-feed search against the Twitter v1.1 search API.
//!
//! Uses application-only auth: the bearer token is exchanged once, lazily,
//! from the configured consumer key/secret and cached for the lifetime of
//! the source. Pages backwards through results with `max_id`.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConfigError, SourceError};
use crate::item::Item;
use crate::query::Query;
use crate::{DataSource, ItemStream};

const TOKEN_URL: &str = "https://api.twitter.com/oauth2/token";
const SEARCH_URL: &str = "https://api.twitter.com/1.1/search/tweets.json";
const PAGE_SIZE: usize = 100;
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

fn default_max_results() -> usize {
    200
}

#[derive(Debug, Clone, Deserialize)]
struct TwitterParams {
    consumer_key: String,
    consumer_secret: String,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

pub struct TwitterSource {
    name: String,
    client: Client,
    params: TwitterParams,
    bearer: OnceCell<String>,
}

/// Constructor registered for the `twitter` kind.
pub fn from_params(name: &str, params: &Value) -> Result<Arc<dyn DataSource>, ConfigError> {
    let params: TwitterParams =
        serde_json::from_value(params.clone()).map_err(|err| ConfigError::MalformedDescriptor {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
    Ok(Arc::new(TwitterSource {
        name: name.to_string(),
        client: Client::new(),
        params,
        bearer: OnceCell::new(),
    }))
}

impl TwitterSource {
    async fn bearer_token(&self) -> Result<String, SourceError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let token = self
            .bearer
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .post(TOKEN_URL)
                    .basic_auth(&self.params.consumer_key, Some(&self.params.consumer_secret))
                    .form(&[("grant_type", "client_credentials")])
                    .send()
                    .await?
                    .error_for_status()?;
                let token: TokenResponse = response.json().await?;
                Ok::<_, SourceError>(token.access_token)
            })
            .await?;
        Ok(token.clone())
    }
}

#[async_trait]
impl DataSource for TwitterSource {
    fn kind(&self) -> &'static str {
        "twitter"
    }

    fn description(&self) -> &'static str {
        "tweet search via the Twitter API"
    }

    async fn search(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ItemStream, SourceError> {
        let bearer = self.bearer_token().await?;
        let client = self.client.clone();
        let name = self.name.clone();
        let max_results = self.params.max_results;

        let stream = try_stream! {
            let mut max_id: Option<u64> = None;
            let mut fetched = 0usize;
            'pages: loop {
                if cancel.is_cancelled() {
                    break 'pages;
                }
                let mut request = client
                    .get(SEARCH_URL)
                    .bearer_auth(&bearer)
                    .query(&[("q", query.text.as_str())])
                    .query(&[("count", PAGE_SIZE)]);
                if let Some(max_id) = max_id {
                    request = request.query(&[("max_id", max_id)]);
                }
                let response = request.send().await?.error_for_status()?;
                let page: SearchResponse = response.json().await?;
                if page.statuses.is_empty() {
                    break 'pages;
                }
                debug!(source = %name, count = page.statuses.len(), "twitter page");
                let mut min_id = u64::MAX;
                for tweet in page.statuses {
                    if cancel.is_cancelled() {
                        break 'pages;
                    }
                    min_id = min_id.min(tweet.id);
                    fetched += 1;
                    yield tweet_to_item(&name, tweet)?;
                    if fetched >= max_results {
                        break 'pages;
                    }
                }
                // page backwards past the oldest tweet we have seen
                max_id = min_id.checked_sub(1);
                if max_id.is_none() {
                    break 'pages;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    statuses: Vec<Tweet>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: u64,
    id_str: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    created_at: String,
    user: TweetUser,
    #[serde(default)]
    entities: Entities,
}

#[derive(Debug, Deserialize)]
struct TweetUser {
    screen_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Entities {
    #[serde(default)]
    hashtags: Vec<Hashtag>,
    #[serde(default)]
    user_mentions: Vec<Mention>,
}

#[derive(Debug, Deserialize)]
struct Hashtag {
    text: String,
}

#[derive(Debug, Deserialize)]
struct Mention {
    screen_name: String,
}

fn tweet_to_item(source_name: &str, tweet: Tweet) -> Result<Item, SourceError> {
    let mut item = Item::new(source_name, "tweet", tweet.id_str)?
        .with_field("text", tweet.text)
        .with_field("user", tweet.user.screen_name);
    match DateTime::parse_from_str(&tweet.created_at, CREATED_AT_FORMAT) {
        Ok(date) => item = item.with_field("date", date.with_timezone(&Utc)),
        Err(_) if !tweet.created_at.is_empty() => {
            item = item.with_field("date", tweet.created_at);
        }
        Err(_) => {}
    }
    for hashtag in tweet.entities.hashtags {
        item = item.with_field("hashtag", hashtag.text);
    }
    for mention in tweet.entities.user_mentions {
        item = item.with_field("mention", mention.screen_name);
    }
    Ok(item)
}
