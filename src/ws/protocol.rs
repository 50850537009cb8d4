//! JSON event envelope: inbound decode + dispatch, outbound encode.
//!
//! Every frame is `{"event": "...", "data": {...}}`. Event names follow the
//! client contract: `send-direct`, `send-channel`, `add-channel-notify`,
//! `ping` inbound; `message-received`, `channel-message-received`,
//! `session-superseded`, `rate-limited`, `channel-added-notify`, `error`,
//! `pong` outbound.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{self, DispatchError, OutboundChannelMessage, OutboundMessage};
use crate::state::AppState;
use crate::store::{ChannelSnapshot, StoredMessage};
use crate::ws::{ConnectionId, ConnectionSender};

/// Events a client may send over an admitted connection.
#[derive(Debug, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    SendDirect(OutboundMessage),
    SendChannel(OutboundChannelMessage),
    AddChannelNotify { channel_id: String },
    Ping,
}

/// Events the server pushes to clients.
#[derive(Debug, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    MessageReceived {
        message: StoredMessage,
    },
    ChannelMessageReceived {
        message: StoredMessage,
        channel_id: String,
    },
    ChannelAddedNotify {
        channel: ChannelSnapshot,
    },
    SessionSuperseded {
        reason: String,
    },
    RateLimited,
    Error {
        kind: String,
        context: String,
        timestamp: DateTime<Utc>,
    },
    Pong,
}

/// Encode an outbound event as a text WebSocket message.
pub fn encode(event: &ServerEvent) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(event)?.into()))
}

/// Encode and push an event to one connection. Best-effort: a closed
/// connection is a normal race, not an error.
pub fn send_event(tx: &ConnectionSender, event: &ServerEvent) {
    match encode(event) {
        Ok(msg) => {
            let _ = tx.send(msg);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server event");
        }
    }
}

/// Push an `error` event to the connection that caused it.
pub fn send_error(tx: &ConnectionSender, kind: &str, context: &str) {
    send_event(
        tx,
        &ServerEvent::Error {
            kind: kind.to_string(),
            context: context.to_string(),
            timestamp: Utc::now(),
        },
    );
}

/// Handle one inbound text frame: decode the envelope and dispatch.
pub async fn handle_text(
    text: &str,
    tx: &ConnectionSender,
    state: &AppState,
    user_id: &str,
    connection_id: ConnectionId,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                user_id = %user_id,
                error = %e,
                "failed to decode client event"
            );
            send_error(tx, "bad-request", "invalid event payload");
            return;
        }
    };

    match event {
        ClientEvent::Ping => {
            state.presence.touch(user_id, connection_id);
            send_event(tx, &ServerEvent::Pong);
        }
        ClientEvent::SendDirect(message) => {
            if message.sender != user_id {
                send_error(tx, "bad-request", "sender does not match connection identity");
                return;
            }
            if let Err(e) = dispatch::dispatch_direct(state, message).await {
                report_dispatch_error(tx, user_id, "send-direct", e);
            }
        }
        ClientEvent::SendChannel(message) => {
            if message.sender != user_id {
                send_error(tx, "bad-request", "sender does not match connection identity");
                return;
            }
            if let Err(e) = dispatch::dispatch_channel(state, message).await {
                report_dispatch_error(tx, user_id, "send-channel", e);
            }
        }
        ClientEvent::AddChannelNotify { channel_id } => {
            if let Err(e) = dispatch::announce_channel(state, &channel_id).await {
                report_dispatch_error(tx, user_id, "add-channel-notify", e);
            }
        }
    }
}

/// Map a dispatch failure to the event the initiating connection sees.
fn report_dispatch_error(
    tx: &ConnectionSender,
    user_id: &str,
    context: &str,
    error: DispatchError,
) {
    match error {
        DispatchError::RateLimited => {
            send_event(tx, &ServerEvent::RateLimited);
        }
        DispatchError::ChannelNotFound(channel_id) => {
            send_error(tx, "not-found", &format!("channel {} not found", channel_id));
        }
        DispatchError::Store(e) => {
            tracing::error!(
                user_id = %user_id,
                context = context,
                error = %e,
                "dispatch failed on store"
            );
            send_error(tx, "store-unavailable", context);
        }
    }
}
