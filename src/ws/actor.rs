use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::protocol::{self, ServerEvent};
use crate::ws::next_connection_id;

/// Server sends a WebSocket ping every 30 seconds to detect abrupt
/// disconnects that never produce a close frame.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// If no pong arrives within 10 seconds after a ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code sent to a connection that lost a session-takeover race.
pub const CLOSE_SUPERSEDED: u16 = 4002;

/// Run the actor-per-connection pattern for an admitted WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: processes incoming frames, dispatches to protocol handlers
///
/// The mpsc channel allows any part of the system to push messages to this
/// client by cloning the sender.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let connection_id = next_connection_id();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Register presence. If the user already held a live connection, tell the
    // old one it lost the takeover race, then close it. Notice failures are
    // logged by the send path and never escalate.
    if let Some(notice) = state.presence.register(&user_id, connection_id, tx.clone()) {
        tracing::info!(
            user_id = %user_id,
            old_connection = notice.old_connection,
            new_connection = connection_id,
            "session takeover"
        );
        protocol::send_event(
            &notice.old_sender,
            &ServerEvent::SessionSuperseded {
                reason: "new session started from another location".to_string(),
            },
        );
        let _ = notice.old_sender.send(Message::Close(Some(CloseFrame {
            code: CLOSE_SUPERSEDED,
            reason: "session superseded".into(),
        })));
    }

    tracing::info!(
        user_id = %user_id,
        connection_id = connection_id,
        "connection actor started"
    );

    // Writer task: forwards mpsc messages to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception for the keepalive task
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died, connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: any inbound frame counts as activity for the reaper.
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    state.presence.touch(&user_id, connection_id);
                    protocol::handle_text(text.as_str(), &tx, &state, &user_id, connection_id)
                        .await;
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        user_id = %user_id,
                        "received binary frame (expected text JSON)"
                    );
                }
                Message::Ping(data) => {
                    state.presence.touch(&user_id, connection_id);
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Pong(_) => {
                    state.presence.touch(&user_id, connection_id);
                    let _ = pong_tx.send(());
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user_id,
                        connection_id = connection_id,
                        reason = ?frame,
                        "client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    connection_id = connection_id,
                    error = %e,
                    "websocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(
                    user_id = %user_id,
                    connection_id = connection_id,
                    "websocket stream ended"
                );
                break;
            }
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    // Remove presence only if this is still the user's current connection; a
    // superseded connection's disconnect must not evict its successor. Clear
    // rate-limit accounting only when the user actually went offline.
    if let Some(user) = state.presence.unregister(connection_id) {
        state.limiter.clear(&user);
    }

    tracing::info!(
        user_id = %user_id,
        connection_id = connection_id,
        "connection actor stopped"
    );
}

/// Writer task: receives messages from the mpsc channel and forwards them to
/// the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed, connection is broken
            break;
        }
    }
}
