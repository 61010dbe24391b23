//! Wire protocol spoken over the client WebSocket.

use serde::{Deserialize, Serialize};

use crate::item::Item;
use crate::query::Query;
use crate::SourceInfo;

/// Inbound message, client to server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Query(Query),
    #[serde(rename_all = "camelCase")]
    Stop { query_id: String },
}

/// Lifecycle state of a query session, reported in status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Error payload carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl WireError {
    pub const UNKNOWN_DATA_SOURCE: &'static str = "unknown_data_source";
    pub const INVALID_MESSAGE: &'static str = "invalid_message";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn unknown_data_source(message: impl Into<String>) -> Self {
        Self::new(Self::UNKNOWN_DATA_SOURCE, message)
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_MESSAGE, message)
    }

    pub fn from_source(error: &crate::error::SourceError) -> Self {
        Self::new(error.code_str(), error.to_string())
    }
}

/// Outbound message, server to client.
///
/// `item` and session-scoped `error`/`status` messages travel the
/// backpressured per-connection queue; `sources` announcements and
/// broadcasts are best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Item {
        query_id: String,
        source_name: String,
        item: Item,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        query_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_name: Option<String>,
        error: WireError,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        query_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_name: Option<String>,
        state: SessionState,
    },
    Sources { sources: Vec<SourceInfo> },
}
