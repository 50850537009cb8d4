use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::actor;

/// Handshake query parameters. The user id is supplied pre-verified by the
/// upstream auth layer; this core only checks presence/absence.
#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    pub user_id: Option<String>,
}

/// Close code for a handshake with no identity: the connection is refused
/// and never registered.
const CLOSE_MISSING_IDENTITY: u16 = 4001;

/// GET /ws?user_id=...
/// WebSocket admission gate. A missing or empty identity upgrades and then
/// immediately closes with 4001 so the client sees an explicit refusal
/// rather than a silent drop. On success, spawns the connection actor.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match params.user_id.filter(|id| !id.trim().is_empty()) {
        Some(user_id) => {
            tracing::info!(user_id = %user_id, "websocket handshake admitted");
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, user_id))
        }
        None => {
            tracing::warn!("websocket handshake rejected: missing identity");
            ws.on_upgrade(reject_unidentified)
        }
    }
}

async fn reject_unidentified(mut socket: WebSocket) {
    let close_frame = CloseFrame {
        code: CLOSE_MISSING_IDENTITY,
        reason: "identity required".into(),
    };
    let _ = socket.send(Message::Close(Some(close_frame))).await;
}
