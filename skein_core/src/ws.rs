//! WebSocket transport: upgrade entry point, per-connection read loop, and
//! the serialized writer task draining the outbound queue.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{Connection, OUTBOUND_QUEUE_DEPTH};
use crate::hub::Hub;
use crate::proto::ServerMessage;

/// Interval between liveness pings on an otherwise idle connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Router exposing the connection-upgrade entry point at `/ws`.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(hub)
}

async fn ws_handler(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_connection(hub, socket))
}

/// Bridge one upgraded socket to the hub: register, announce the configured
/// sources, pump frames both ways, and tear everything down once either
/// side goes away.
pub async fn serve_connection(hub: Arc<Hub>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_DEPTH);
    let connection = Arc::new(Connection::new(Uuid::new_v4().to_string(), tx));

    hub.register(Arc::clone(&connection)).await;
    connection.notify(ServerMessage::Sources {
        sources: hub.registry().infos(),
    });

    // All outbound writes go through this task, so frames are never
    // interleaved on the socket.
    let writer_conn = connection.id().to_string();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(conn = %writer_conn, error = %err, "failed to serialize outbound message");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(conn = %writer_conn, "writer task finished");
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.dispatch_text(&connection, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            // pings are answered by the transport layer, pongs just prove
            // liveness, binary frames are not part of the protocol
            Ok(_) => {}
            Err(err) => {
                debug!(conn = %connection.id(), error = %err, "read failed");
                break;
            }
        }
    }

    connection.close().await;
    hub.unregister(connection.id()).await;
    writer.abort();
}
