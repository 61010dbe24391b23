//! Query session: fan-out across the targeted data sources for one query,
//! fan-in of their results to the owning connection.
//!
//! One worker task per `(session, target)` pair. Items from a single target
//! reach the connection in production order; nothing is guaranteed across
//! targets. Cancellation is cooperative: a worker may pull at most one more
//! item after the token fires, and that item is accepted but not forwarded —
//! item delivery is gated on the session still owning its `queryId` slot.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::SourceError;
use crate::proto::{ServerMessage, SessionState, WireError};
use crate::query::Query;
use crate::{DataSource, SourceRegistry};

/// Safety timeout per target: a silently-stuck backend is force-cancelled
/// and reported as a timeout error once this elapses.
pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(30);

const STATE_RUNNING: u8 = 0;
const STATE_COMPLETED: u8 = 1;
const STATE_CANCELLED: u8 = 2;
const STATE_FAILED: u8 = 3;

/// Runtime state of one in-flight query.
pub struct QuerySession {
    query_id: String,
    connection: Arc<Connection>,
    cancel: CancellationToken,
    epoch: u64,
    state: AtomicU8,
    items_emitted: AtomicU64,
}

impl QuerySession {
    /// Resolve targets and start one worker per target. Resolution failure
    /// reports a single `unknown_data_source` error and starts nothing.
    ///
    /// The call itself only spawns workers; it never waits on a backend.
    pub async fn start(
        registry: &SourceRegistry,
        connection: Arc<Connection>,
        query: Query,
        target_timeout: Duration,
    ) -> Arc<Self> {
        let query_id = query.query_id.clone();

        let targets = match registry.resolve(&query.sources) {
            Ok(targets) => targets,
            Err(err) => {
                warn!(conn = %connection.id(), query_id = %query_id, error = %err, "query resolution failed");
                // a replacement supersedes even when it fails to resolve
                if connection.cancel_session(&query_id).await {
                    debug!(conn = %connection.id(), query_id = %query_id, "superseding in-flight query");
                }
                let session = Arc::new(Self::inert(query_id.clone(), connection.clone()));
                session.state.store(STATE_FAILED, Ordering::SeqCst);
                let _ = connection
                    .forward(ServerMessage::Error {
                        query_id,
                        source_name: None,
                        error: WireError::unknown_data_source(err.to_string()),
                    })
                    .await;
                return session;
            }
        };

        let (cancel, epoch) = connection.begin_session(&query_id).await;
        debug!(
            conn = %connection.id(),
            query_id = %query_id,
            targets = targets.len(),
            "starting query session"
        );

        let session = Arc::new(Self {
            query_id,
            connection: connection.clone(),
            cancel: cancel.clone(),
            epoch,
            state: AtomicU8::new(STATE_RUNNING),
            items_emitted: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(targets.len());
        for (source_name, source) in targets {
            workers.push(tokio::spawn(run_target(
                Arc::clone(&session),
                source_name,
                source,
                query.clone(),
                cancel.child_token(),
                target_timeout,
            )));
        }

        let supervisor = Arc::clone(&session);
        tokio::spawn(async move {
            let _ = futures::future::join_all(workers).await;
            supervisor.finish().await;
        });

        session
    }

    fn inert(query_id: String, connection: Arc<Connection>) -> Self {
        Self {
            query_id,
            connection,
            cancel: CancellationToken::new(),
            epoch: 0,
            state: AtomicU8::new(STATE_RUNNING),
            items_emitted: AtomicU64::new(0),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Items forwarded to the connection so far.
    pub fn items_emitted(&self) -> u64 {
        self.items_emitted.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => SessionState::Running,
            STATE_COMPLETED => SessionState::Completed,
            STATE_CANCELLED => SessionState::Cancelled,
            _ => SessionState::Failed,
        }
    }

    async fn finish(&self) {
        let final_state = if self.cancel.is_cancelled() {
            STATE_CANCELLED
        } else {
            STATE_COMPLETED
        };
        self.state.store(final_state, Ordering::SeqCst);
        self.connection.end_session(&self.query_id, self.epoch).await;
        debug!(
            query_id = %self.query_id,
            items = self.items_emitted(),
            state = ?self.state(),
            "query session finished"
        );
    }

    async fn report_error(&self, source_name: &str, error: &SourceError) {
        if self.cancel.is_cancelled() {
            return;
        }
        warn!(query_id = %self.query_id, source = source_name, error = %error, "target failed");
        let _ = self
            .connection
            .forward(ServerMessage::Error {
                query_id: self.query_id.clone(),
                source_name: Some(source_name.to_string()),
                error: WireError::from_source(error),
            })
            .await;
    }
}

/// One worker: drives a single target's stream and forwards its output.
///
/// A per-target error never cancels sibling targets. A forward failure
/// means the connection is gone, so the worker cancels itself.
async fn run_target(
    session: Arc<QuerySession>,
    source_name: String,
    source: Arc<dyn DataSource>,
    query: Query,
    cancel: CancellationToken,
    target_timeout: Duration,
) {
    let deadline = Instant::now() + target_timeout;

    let mut stream = match source.search(query, cancel.clone()).await {
        Ok(stream) => stream,
        Err(err) => {
            session.report_error(&source_name, &err).await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(query_id = %session.query_id, source = %source_name, "target cancelled");
                return;
            }
            next = timeout_at(deadline, stream.next()) => next,
        };

        match next {
            Err(_elapsed) => {
                cancel.cancel();
                session
                    .report_error(
                        &source_name,
                        &SourceError::Timeout(format!(
                            "no completion within {}s",
                            target_timeout.as_secs()
                        )),
                    )
                    .await;
                return;
            }
            Ok(None) => {
                if !cancel.is_cancelled() {
                    let _ = session
                        .connection
                        .forward(ServerMessage::Status {
                            query_id: session.query_id.clone(),
                            source_name: Some(source_name.clone()),
                            state: SessionState::Completed,
                        })
                        .await;
                }
                return;
            }
            Ok(Some(Ok(item))) => {
                // A post-cancel emission is accepted but never forwarded.
                if cancel.is_cancelled() {
                    return;
                }
                // Epoch-gated: delivery requires still owning the session
                // slot, so a superseded worker cannot enqueue behind its
                // replacement's items.
                let forwarded = session
                    .connection
                    .forward_session(
                        &session.query_id,
                        session.epoch,
                        ServerMessage::Item {
                            query_id: session.query_id.clone(),
                            source_name: source_name.clone(),
                            item,
                        },
                    )
                    .await;
                match forwarded {
                    Ok(()) => {
                        let _ = session.items_emitted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        cancel.cancel();
                        return;
                    }
                }
            }
            Ok(Some(Err(err))) => {
                session.report_error(&source_name, &err).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::item::Item;
    use crate::{ItemStream, SourceRegistry};

    /// Yields a fixed item list, then completes.
    struct StaticSource {
        items: Vec<Item>,
        invoked: AtomicBool,
    }

    impl StaticSource {
        fn new(items: Vec<Item>) -> Arc<Self> {
            Arc::new(Self {
                items,
                invoked: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl DataSource for StaticSource {
        fn kind(&self) -> &'static str {
            "static"
        }

        fn description(&self) -> &'static str {
            "fixed items for tests"
        }

        async fn search(
            &self,
            _query: Query,
            _cancel: CancellationToken,
        ) -> Result<ItemStream, SourceError> {
            self.invoked.store(true, Ordering::SeqCst);
            Ok(futures::stream::iter(self.items.clone().into_iter().map(Ok)).boxed())
        }
    }

    /// Fails with a terminal backend error as its only emission.
    struct FailingSource;

    #[async_trait]
    impl DataSource for FailingSource {
        fn kind(&self) -> &'static str {
            "failing"
        }

        fn description(&self) -> &'static str {
            "always errors"
        }

        async fn search(
            &self,
            _query: Query,
            _cancel: CancellationToken,
        ) -> Result<ItemStream, SourceError> {
            Ok(futures::stream::iter([Err(SourceError::Backend("E1".into()))]).boxed())
        }
    }

    /// Never yields; runs until cancelled or timed out.
    struct StuckSource;

    #[async_trait]
    impl DataSource for StuckSource {
        fn kind(&self) -> &'static str {
            "stuck"
        }

        fn description(&self) -> &'static str {
            "never produces"
        }

        async fn search(
            &self,
            _query: Query,
            _cancel: CancellationToken,
        ) -> Result<ItemStream, SourceError> {
            Ok(futures::stream::pending().boxed())
        }
    }

    fn item(source: &str, id: &str) -> Item {
        Item::new(source, "doc", id).unwrap()
    }

    fn registry(entries: Vec<(&str, Arc<dyn DataSource>)>) -> SourceRegistry {
        let sources: HashMap<_, _> = entries
            .into_iter()
            .map(|(n, s)| (n.to_string(), s))
            .collect();
        SourceRegistry::from_sources(sources)
    }

    fn connection() -> (Arc<Connection>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(Connection::new("conn_1", tx)), rx)
    }

    async fn collect_until_terminal(
        rx: &mut mpsc::Receiver<ServerMessage>,
        terminals: usize,
    ) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        let mut seen = 0;
        while seen < terminals {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for messages")
                .expect("channel closed early");
            match &msg {
                ServerMessage::Status { .. } | ServerMessage::Error { .. } => seen += 1,
                _ => {}
            }
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn fan_out_preserves_per_source_order_and_scopes_errors() {
        let es = StaticSource::new(vec![item("es", "A1"), item("es", "A2")]);
        let registry = registry(vec![
            ("es", es as Arc<dyn DataSource>),
            ("twitter", Arc::new(FailingSource)),
        ]);
        let (conn, mut rx) = connection();

        let query = Query::new("q1", "alpha").with_sources(["es", "twitter"]);
        let session =
            QuerySession::start(&registry, conn.clone(), query, DEFAULT_TARGET_TIMEOUT).await;

        // one terminal per target: es completed status + twitter error
        let messages = collect_until_terminal(&mut rx, 2).await;

        let es_messages: Vec<_> = messages
            .iter()
            .filter(|m| match m {
                ServerMessage::Item { source_name, .. } => source_name == "es",
                ServerMessage::Status { source_name, .. } => {
                    source_name.as_deref() == Some("es")
                }
                _ => false,
            })
            .collect();
        assert_eq!(es_messages.len(), 3);
        assert!(
            matches!(es_messages[0], ServerMessage::Item { item, .. } if item.id() == "A1")
        );
        assert!(
            matches!(es_messages[1], ServerMessage::Item { item, .. } if item.id() == "A2")
        );
        assert!(matches!(
            es_messages[2],
            ServerMessage::Status {
                state: SessionState::Completed,
                ..
            }
        ));

        let twitter_error = messages.iter().find_map(|m| match m {
            ServerMessage::Error {
                source_name, error, ..
            } if source_name.as_deref() == Some("twitter") => Some(error.clone()),
            _ => None,
        });
        let twitter_error = twitter_error.expect("missing twitter error");
        assert_eq!(twitter_error.kind, "backend_error");
        assert!(twitter_error.message.contains("E1"));

        // session drains to completed despite the failed sibling
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.active_sessions().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.items_emitted(), 2);
    }

    #[tokio::test]
    async fn unknown_source_reports_once_and_invokes_nothing() {
        let es = StaticSource::new(vec![item("es", "A1")]);
        let registry = registry(vec![("es", Arc::clone(&es) as Arc<dyn DataSource>)]);
        let (conn, mut rx) = connection();

        let query = Query::new("q1", "alpha").with_sources(["nope"]);
        let session =
            QuerySession::start(&registry, conn.clone(), query, DEFAULT_TARGET_TIMEOUT).await;

        let msg = rx.recv().await.unwrap();
        match msg {
            ServerMessage::Error {
                query_id,
                source_name,
                error,
            } => {
                assert_eq!(query_id, "q1");
                assert!(source_name.is_none());
                assert_eq!(error.kind, "unknown_data_source");
                assert!(error.message.contains("nope"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!es.invoked.load(Ordering::SeqCst));
        assert_eq!(conn.active_sessions().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_target_set_means_all_sources() {
        let a = StaticSource::new(vec![item("a", "1")]);
        let b = StaticSource::new(vec![item("b", "2")]);
        let registry = registry(vec![
            ("a", Arc::clone(&a) as Arc<dyn DataSource>),
            ("b", Arc::clone(&b) as Arc<dyn DataSource>),
        ]);
        let (conn, mut rx) = connection();

        QuerySession::start(&registry, conn, Query::new("q1", "x"), DEFAULT_TARGET_TIMEOUT).await;
        let messages = collect_until_terminal(&mut rx, 2).await;

        let item_sources: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Item { source_name, .. } => Some(source_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(item_sources.len(), 2);
        assert!(item_sources.contains(&"a".to_string()));
        assert!(item_sources.contains(&"b".to_string()));
        assert!(a.invoked.load(Ordering::SeqCst));
        assert!(b.invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_before_first_item_forwards_nothing() {
        let registry = registry(vec![("slow", Arc::new(StuckSource) as Arc<dyn DataSource>)]);
        let (conn, mut rx) = connection();

        let query = Query::new("q1", "x").with_sources(["slow"]);
        let session =
            QuerySession::start(&registry, conn.clone(), query, DEFAULT_TARGET_TIMEOUT).await;
        assert!(conn.cancel_session("q1").await);

        // give workers time to observe the cancellation
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.state() == SessionState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(session.items_emitted(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_replacement_cancels_superseded_session() {
        let registry = registry(vec![("slow", Arc::new(StuckSource) as Arc<dyn DataSource>)]);
        let (conn, mut rx) = connection();

        let first = QuerySession::start(
            &registry,
            conn.clone(),
            Query::new("q1", "x").with_sources(["slow"]),
            DEFAULT_TARGET_TIMEOUT,
        )
        .await;
        let second = QuerySession::start(
            &registry,
            conn.clone(),
            Query::new("q1", "x").with_sources(["nope"]),
            DEFAULT_TARGET_TIMEOUT,
        )
        .await;

        // the replacement fails to resolve, but still displaces q1
        assert!(first.is_cancelled());
        assert_eq!(second.state(), SessionState::Failed);
        match rx.recv().await.unwrap() {
            ServerMessage::Error { query_id, error, .. } => {
                assert_eq!(query_id, "q1");
                assert_eq!(error.kind, "unknown_data_source");
            }
            other => panic!("expected error, got {other:?}"),
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.active_sessions().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn supersession_cancels_old_before_new_forwards() {
        let fast = StaticSource::new(vec![item("fast", "F1")]);
        let registry = registry(vec![
            ("slow", Arc::new(StuckSource) as Arc<dyn DataSource>),
            ("fast", Arc::clone(&fast) as Arc<dyn DataSource>),
        ]);
        let (conn, mut rx) = connection();

        let first = QuerySession::start(
            &registry,
            conn.clone(),
            Query::new("q1", "x").with_sources(["slow"]),
            DEFAULT_TARGET_TIMEOUT,
        )
        .await;
        let _second = QuerySession::start(
            &registry,
            conn.clone(),
            Query::new("q1", "x").with_sources(["fast"]),
            DEFAULT_TARGET_TIMEOUT,
        )
        .await;

        assert!(first.is_cancelled());

        let messages = collect_until_terminal(&mut rx, 1).await;
        for msg in &messages {
            match msg {
                ServerMessage::Item { source_name, .. } => assert_eq!(source_name, "fast"),
                ServerMessage::Status { source_name, .. } => {
                    assert_eq!(source_name.as_deref(), Some("fast"));
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        // the replacement stays in the session map until it drains
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.active_sessions().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stuck_target_times_out_with_scoped_error() {
        let registry = registry(vec![("slow", Arc::new(StuckSource) as Arc<dyn DataSource>)]);
        let (conn, mut rx) = connection();

        let query = Query::new("q1", "x").with_sources(["slow"]);
        QuerySession::start(&registry, conn, query, Duration::from_millis(50)).await;

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            ServerMessage::Error {
                source_name, error, ..
            } => {
                assert_eq!(source_name.as_deref(), Some("slow"));
                assert_eq!(error.kind, "timeout");
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_leaves_other_connections_untouched() {
        let a = StaticSource::new(vec![item("a", "1")]);
        let registry = registry(vec![
            ("slow", Arc::new(StuckSource) as Arc<dyn DataSource>),
            ("a", Arc::clone(&a) as Arc<dyn DataSource>),
        ]);
        let (doomed, _doomed_rx) = connection();
        let (healthy, mut healthy_rx) = connection();

        let doomed_session = QuerySession::start(
            &registry,
            doomed.clone(),
            Query::new("q1", "x").with_sources(["slow"]),
            DEFAULT_TARGET_TIMEOUT,
        )
        .await;
        QuerySession::start(
            &registry,
            healthy.clone(),
            Query::new("q1", "x").with_sources(["a"]),
            DEFAULT_TARGET_TIMEOUT,
        )
        .await;

        doomed.close().await;
        assert!(doomed_session.is_cancelled());

        let messages = collect_until_terminal(&mut healthy_rx, 1).await;
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::Item { item, .. } if item.id() == "1")));
    }
}
