//! WebSocket signaling transport.
//!
//! One socket per client. Inbound frames are decoded and forwarded to the
//! registry in arrival order; outbound messages flow through a bounded
//! channel so a slow client cannot pin memory. A ping/pong probe detects
//! dead sockets and reports them as closures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use solocast_sfu::channel::MessageSender;
use solocast_sfu::error::{Error, Result};
use solocast_sfu::message::{ClientMessage, ServerMessage};
use solocast_sfu::types::ConnectionId;

use super::AppState;

/// Outbound queue depth per connection. If a client cannot drain this many
/// signaling messages it is effectively gone.
const OUTBOUND_BUFFER: usize = 256;

/// Signaling messages are small; anything larger is garbage.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// `MessageSender` backed by the per-connection outbound queue.
struct WebSocketSender {
    tx: mpsc::Sender<String>,
}

impl MessageSender for WebSocketSender {
    fn send(&self, message: ServerMessage) -> Result<()> {
        let text = serde_json::to_string(&message)?;
        // try_send keeps the registry task from ever blocking on one
        // slow client.
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Internal("outbound buffer full; client too slow".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed,
        })
    }
}

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn = ConnectionId::generate();
    info!(conn = %conn, "signaling connection established");

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    state
        .registry
        .connected(conn.clone(), Arc::new(WebSocketSender { tx }));

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Millis since `started`, updated by the reader on every pong.
    let started = Instant::now();
    let last_pong = Arc::new(AtomicU64::new(0));

    // Outbound pump: registry -> socket, plus the liveness probe.
    let pong_seen = last_pong.clone();
    let keepalive = state.keepalive;
    let probe_conn = conn.clone();
    let outbound = tokio::spawn(async move {
        let mut probe = tokio::time::interval(keepalive);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(text) => {
                        if ws_sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = probe.tick() => {
                    let silent_for = started.elapsed().as_millis() as u64
                        - pong_seen.load(Ordering::Relaxed);
                    if silent_for > 2 * keepalive.as_millis() as u64 {
                        warn!(conn = %probe_conn, "liveness probe timed out");
                        break;
                    }
                    if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Nudge the reader loop to observe the closure.
        let _ = ws_sink.close().await;
    });

    // Inbound loop: strictly in-order decode and dispatch.
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(message) => state.registry.message(conn.clone(), message),
                Err(e) => {
                    // Malformed input is dropped; the connection lives on.
                    debug!(conn = %conn, error = %e, "dropping malformed signaling message");
                }
            },
            Ok(Message::Pong(_)) => {
                last_pong.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary frames and pings are not part of the protocol
            Err(e) => {
                debug!(conn = %conn, error = %e, "socket error");
                break;
            }
        }
    }

    info!(conn = %conn, "signaling connection closed");
    state.registry.closed(conn);
    outbound.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use solocast_sfu::message::ClientRole;

    #[tokio::test]
    async fn test_sender_serializes_to_wire_json() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = WebSocketSender { tx };

        sender
            .send(ServerMessage::ViewerCount { count: 3 })
            .expect("queued");
        let text = rx.recv().await.expect("one message");
        let value: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(value["type"], "viewerCount");
        assert_eq!(value["count"], 3);
    }

    #[tokio::test]
    async fn test_sender_reports_backpressure_and_closure() {
        let (tx, rx) = mpsc::channel(1);
        let sender = WebSocketSender { tx };

        assert!(sender.send(ServerMessage::ViewerCount { count: 1 }).is_ok());
        // Queue full: the message is dropped, not blocked on.
        assert!(sender.send(ServerMessage::ViewerCount { count: 2 }).is_err());

        drop(rx);
        let result = sender.send(ServerMessage::Registered {
            role: ClientRole::Viewer,
            viewer_id: None,
            viewer_count: None,
        });
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }
}
