//! The central coordinator: owns the live connection set, routes inbound
//! messages into query sessions, and fans broadcasts out to every client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::proto::{ClientMessage, ServerMessage, SessionState, WireError};
use crate::session::{QuerySession, DEFAULT_TARGET_TIMEOUT};
use crate::SourceRegistry;

/// Process-scoped coordinator, constructed once at startup and passed
/// explicitly to every connection-handling entry point.
pub struct Hub {
    registry: Arc<SourceRegistry>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    target_timeout: Duration,
}

impl Hub {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self {
            registry,
            connections: RwLock::new(HashMap::new()),
            target_timeout: DEFAULT_TARGET_TIMEOUT,
        }
    }

    pub fn with_target_timeout(mut self, target_timeout: Duration) -> Self {
        self.target_timeout = target_timeout;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Add a connection to the live set; subsequent broadcasts include it.
    pub async fn register(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        debug!(conn = %connection.id(), "connection registered");
        let _ = connections.insert(connection.id().to_string(), connection);
    }

    /// Remove a connection and defensively cancel anything it still owns.
    /// Tolerates being called twice, and for ids never registered.
    pub async fn unregister(&self, connection_id: &str) {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(connection) = removed {
            connection.close().await;
            debug!(conn = connection_id, "connection unregistered");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Entry point for one decoded inbound message.
    pub async fn dispatch(&self, connection: &Arc<Connection>, message: ClientMessage) {
        match message {
            ClientMessage::Query(query) => {
                QuerySession::start(
                    &self.registry,
                    Arc::clone(connection),
                    query,
                    self.target_timeout,
                )
                .await;
            }
            ClientMessage::Stop { query_id } => {
                if connection.cancel_session(&query_id).await {
                    let _ = connection
                        .forward(ServerMessage::Status {
                            query_id,
                            source_name: None,
                            state: SessionState::Cancelled,
                        })
                        .await;
                } else {
                    debug!(conn = %connection.id(), query_id, "stop for unknown query");
                }
            }
        }
    }

    /// Entry point for one raw inbound frame. A malformed message is
    /// reported back to the sender; the connection stays open.
    pub async fn dispatch_text(&self, connection: &Arc<Connection>, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.dispatch(connection, message).await,
            Err(err) => {
                warn!(conn = %connection.id(), error = %err, "invalid inbound message");
                let query_id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("queryId").and_then(|q| q.as_str()).map(str::to_string))
                    .unwrap_or_default();
                let _ = connection
                    .forward(ServerMessage::Error {
                        query_id,
                        source_name: None,
                        error: WireError::invalid_message(err.to_string()),
                    })
                    .await;
            }
        }
    }

    /// Best-effort system-wide notification. A slow connection's queue may
    /// drop it rather than block the hub.
    pub async fn broadcast(&self, message: ServerMessage) {
        let connections = self.connections.read().await;
        for connection in connections.values() {
            if !connection.notify(message.clone()) {
                warn!(conn = %connection.id(), "dropped broadcast for slow connection");
            }
        }
    }
}
