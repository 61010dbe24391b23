//! Per-client connection state: the outbound queue and the set of query
//! sessions owned by one live WebSocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ChannelClosed;
use crate::proto::ServerMessage;

/// Depth of the bounded per-connection outbound queue.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Handle to one in-flight query session, held in the owning connection's
/// session map.
struct SessionHandle {
    cancel: CancellationToken,
    epoch: u64,
}

/// One client's live duplex channel: a bounded outbound sink plus the
/// `queryId -> session` map. Destroying the connection (close) cancels
/// every owned session; close is idempotent.
pub struct Connection {
    id: String,
    tx: mpsc::Sender<ServerMessage>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_epoch: AtomicU64,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Connection {
    pub fn new(id: impl Into<String>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: id.into(),
            tx,
            sessions: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Backpressured send for items and session-scoped errors/statuses.
    /// Suspends while the queue is full; fails fast once the connection is
    /// closed or the writer is gone.
    pub async fn forward(&self, message: ServerMessage) -> Result<(), ChannelClosed> {
        if self.is_closed() {
            return Err(ChannelClosed);
        }
        self.tx.send(message).await.map_err(|_| ChannelClosed)
    }

    /// Backpressured send gated on session ownership: delivers only while
    /// `(query_id, epoch)` still holds its slot in the session map. The
    /// lock is held across the send, so a superseded or stopped session
    /// cannot enqueue behind anything its replacement has forwarded.
    pub async fn forward_session(
        &self,
        query_id: &str,
        epoch: u64,
        message: ServerMessage,
    ) -> Result<(), ChannelClosed> {
        if self.is_closed() {
            return Err(ChannelClosed);
        }
        let sessions = self.sessions.lock().await;
        if !sessions.get(query_id).is_some_and(|h| h.epoch == epoch) {
            return Err(ChannelClosed);
        }
        self.tx.send(message).await.map_err(|_| ChannelClosed)
    }

    /// Best-effort send for broadcasts and announcements. Never blocks;
    /// counts the message as dropped when the queue is full or closed.
    pub fn notify(&self, message: ServerMessage) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Messages dropped on the best-effort path.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Register a new session under `query_id`, cancelling any session
    /// already holding that id (supersession) before the replacement's
    /// token is handed out.
    ///
    /// Returns the new session's cancellation token and its epoch; the
    /// epoch guards [`end_session`](Self::end_session) against a superseded
    /// session removing its replacement. On a closed connection the
    /// returned token is already cancelled.
    pub async fn begin_session(&self, query_id: &str) -> (CancellationToken, u64) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut sessions = self.sessions.lock().await;
        if let Some(old) = sessions.insert(
            query_id.to_string(),
            SessionHandle {
                cancel: token.clone(),
                epoch,
            },
        ) {
            debug!(conn = %self.id, query_id, "superseding in-flight query");
            old.cancel.cancel();
        }
        if self.is_closed() {
            token.cancel();
        }
        (token, epoch)
    }

    /// Remove a finished session, but only if it still owns the map slot.
    pub async fn end_session(&self, query_id: &str, epoch: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(query_id).is_some_and(|h| h.epoch == epoch) {
            sessions.remove(query_id);
        }
    }

    /// Cancel one session by id. Returns whether a session was found.
    pub async fn cancel_session(&self, query_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(query_id);
        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of sessions currently owned by this connection.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Cancel every owned session and refuse further forwards. Idempotent;
    /// double-close is not an error.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sessions = self.sessions.lock().await;
        for (_, handle) in sessions.drain() {
            handle.cancel.cancel();
        }
        debug!(conn = %self.id, "connection closed");
    }
}
