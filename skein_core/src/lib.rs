// src/lib.rs
pub mod connection;
pub mod error;
pub mod hub;
pub mod item;
pub mod proto;
pub mod query;
pub mod session;
pub mod sources;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, SourceError, UnknownSourceError};

pub use crate::item::{FieldValue, Item};
pub use crate::query::Query;

/// The lazy, cancelable result sequence produced by one `search` call.
///
/// Finite per query: it terminates on completion, cancellation, or a
/// terminal error, and is not restartable.
pub type ItemStream = BoxStream<'static, Result<Item, SourceError>>;

/// Capability interface every backend integration implements.
///
/// `search` performs only bounded setup (request building, a cached token
/// fetch) before returning; the long-running backend work happens on the
/// producing side of the returned stream. Implementations check `cancel`
/// between emissions and stop promptly once it fires.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// The configured kind tag this implementation answers for.
    fn kind(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn search(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<ItemStream, SourceError>;
}

/// Configuration-time identity of one data source instance: the kind tag
/// selecting the implementation, plus kind-specific parameters the hub
/// never inspects.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Value,
}

/// Constructor for one data source kind. Receives the configured name and
/// the opaque descriptor parameters.
pub type SourceCtor = fn(name: &str, params: &Value) -> Result<Arc<dyn DataSource>, ConfigError>;

/// Maps kind tags to constructors. New kinds register themselves here
/// instead of extending a branching conditional at decode time.
pub struct RegistryBuilder {
    ctors: HashMap<String, SourceCtor>,
}

impl RegistryBuilder {
    /// A builder with the built-in kinds already registered.
    pub fn new() -> Self {
        let mut builder = Self {
            ctors: HashMap::new(),
        };
        builder.register_kind("elasticsearch", sources::elasticsearch::from_params);
        builder.register_kind("twitter", sources::twitter::from_params);
        builder.register_kind("blockchain", sources::blockchain::from_params);
        builder
    }

    pub fn register_kind(&mut self, kind: impl Into<String>, ctor: SourceCtor) -> &mut Self {
        self.ctors.insert(kind.into(), ctor);
        self
    }

    /// Instantiate every configured source. Any unknown kind or malformed
    /// descriptor is fatal: the registry is not built and the server must
    /// not start serving.
    pub fn build(
        &self,
        config: &HashMap<String, SourceDescriptor>,
    ) -> Result<SourceRegistry, ConfigError> {
        let mut sources = HashMap::with_capacity(config.len());
        for (name, descriptor) in config {
            let ctor = self
                .ctors
                .get(&descriptor.kind)
                .ok_or_else(|| ConfigError::UnknownKind {
                    name: name.clone(),
                    kind: descriptor.kind.clone(),
                })?;
            sources.insert(name.clone(), ctor(name, &descriptor.params)?);
        }
        Ok(SourceRegistry { sources })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Name and kind of one registered source, announced to clients on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,
    pub kind: String,
}

/// Immutable, process-lifetime mapping from configured name to live data
/// source instance. Built once at startup; concurrent reads afterwards are
/// lock-free.
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn DataSource>>,
}

impl SourceRegistry {
    /// Build a registry directly from already-constructed sources. Used by
    /// callers that wire instances themselves (and by tests).
    pub fn from_sources(sources: HashMap<String, Arc<dyn DataSource>>) -> Self {
        Self { sources }
    }

    /// Resolve a set of names to live instances. An empty set means "all
    /// registered sources". Fails listing every name not present.
    pub fn resolve(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, Arc<dyn DataSource>)>, UnknownSourceError> {
        if names.is_empty() {
            let mut all: Vec<_> = self
                .sources
                .iter()
                .map(|(name, source)| (name.clone(), Arc::clone(source)))
                .collect();
            all.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(all);
        }

        let mut resolved = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.sources.get(name) {
                Some(source) => resolved.push((name.clone(), Arc::clone(source))),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(UnknownSourceError { names: missing })
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.get(name).map(Arc::clone)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Name + kind listing, sorted by name.
    pub fn infos(&self) -> Vec<SourceInfo> {
        let mut infos: Vec<_> = self
            .sources
            .iter()
            .map(|(name, source)| SourceInfo {
                name: name.clone(),
                kind: source.kind().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
