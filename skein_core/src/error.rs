//! Error taxonomy for the hub and the data-source layer.
//!
//! Errors are contained at the smallest scope that caused them: only
//! [`ConfigError`] prevents the process from serving, everything else is
//! scoped to one query, one target, or one connection.

use thiserror::Error;

/// Fatal, startup-time configuration failure. The registry refuses to build
/// and the server must not start serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown data source kind `{kind}` for `{name}`")]
    UnknownKind { name: String, kind: String },

    #[error("malformed descriptor for `{name}`: {reason}")]
    MalformedDescriptor { name: String, reason: String },
}

/// A query referenced one or more source names that are not in the registry.
/// Recoverable, reported to the requesting client only.
#[derive(Debug, Clone, Error)]
#[error("unknown data source(s): {}", names.join(", "))]
pub struct UnknownSourceError {
    pub names: Vec<String>,
}

/// Construction-time validation failure for an [`Item`](crate::item::Item).
#[derive(Debug, Clone, Error)]
#[error("item requires a non-empty `{0}`")]
pub struct InvalidItem(pub &'static str);

/// A data source failed for one query/target. Scoped to a single
/// `(queryId, sourceName)` pair; sibling targets are unaffected.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Item(#[from] InvalidItem),
}

impl SourceError {
    /// Stable wire-level error kind for this failure.
    pub fn code_str(&self) -> &'static str {
        match self {
            SourceError::Http(_) => "upstream_error",
            SourceError::Decode(_) => "parse_error",
            SourceError::Backend(_) => "backend_error",
            SourceError::Timeout(_) => "timeout",
            SourceError::Item(_) => "invalid_item",
        }
    }
}

/// The per-connection outbound channel is gone (client closed or writer
/// failed). Triggers teardown of the owning connection, never crosses to
/// other connections.
#[derive(Debug, Clone, Copy, Error)]
#[error("outbound channel closed")]
pub struct ChannelClosed;
