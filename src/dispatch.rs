//! Message dispatch: validate, rate-limit, persist, resolve recipients,
//! fan out.
//!
//! Both dispatch paths persist before any fan-out, so a live recipient never
//! observes a message that is absent from the durable log. Fan-out is
//! best-effort per recipient: a failed delivery is logged and never aborts
//! delivery to others or rolls back persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::state::AppState;
use crate::store::{
    ChannelSnapshot, ChannelStore, MessageStore, MessageType, NewMessage, StoreError,
    StoredMessage,
};
use crate::ws::{protocol, protocol::ServerEvent, ConnectionId, ConnectionSender};

/// A direct (point-to-point) outbound message. The recipient is always a
/// concrete user identity, never a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A channel broadcast. `channel_id` must resolve to an existing channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChannelMessage {
    pub sender: String,
    pub channel_id: String,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Terminal failures of a dispatch operation, reported to the initiating
/// connection only.
#[derive(Debug)]
pub enum DispatchError {
    /// Sender exceeded its send budget; message dropped, nothing persisted.
    RateLimited,
    /// Channel id did not resolve; dispatch aborted, nothing persisted.
    ChannelNotFound(String),
    /// The persistence/membership collaborator failed; dispatch fails
    /// closed — the message is not considered sent, no fan-out occurs.
    Store(StoreError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limit exceeded"),
            Self::ChannelNotFound(id) => write!(f, "channel {} not found", id),
            Self::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Observable result of one delivery attempt. Failures are logged, never
/// escalated.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub delivered: bool,
}

/// Dispatch a direct message: rate-gate, persist, then deliver the persisted
/// message to whichever of {recipient, sender} hold a live connection. The
/// sender receives its own echo for multi-tab sync; an offline recipient is
/// a silent non-delivery, not an error.
pub async fn dispatch_direct(
    state: &AppState,
    message: OutboundMessage,
) -> Result<StoredMessage, DispatchError> {
    if !state.limiter.allow(&message.sender) {
        tracing::debug!(sender = %message.sender, "direct send rejected by rate limiter");
        return Err(DispatchError::RateLimited);
    }

    let stored = persist(
        state.messages.clone(),
        NewMessage {
            sender: message.sender.clone(),
            recipient: Some(message.recipient.clone()),
            content: message.content,
            message_type: message.message_type,
            file_url: message.file_url,
            timestamp: message.timestamp,
        },
    )
    .await?;

    // De-duplicated target set: a self-send gets exactly one copy.
    let mut targets = BTreeSet::new();
    targets.insert(message.recipient);
    targets.insert(message.sender);

    let event = ServerEvent::MessageReceived {
        message: stored.clone(),
    };
    let outcomes = fan_out(state, targets, &event);
    log_outcomes("direct", stored.id, &outcomes);

    Ok(stored)
}

/// Dispatch a channel broadcast: rate-gate, resolve the membership snapshot
/// (absent channel aborts with nothing persisted), persist, append to the
/// channel's message list, then fan out to every present member and the
/// admin — de-duplicated, so each live connection receives at most one copy.
pub async fn dispatch_channel(
    state: &AppState,
    message: OutboundChannelMessage,
) -> Result<StoredMessage, DispatchError> {
    if !state.limiter.allow(&message.sender) {
        tracing::debug!(sender = %message.sender, "channel send rejected by rate limiter");
        return Err(DispatchError::RateLimited);
    }

    let snapshot = fetch_snapshot(state.channels.clone(), &message.channel_id)
        .await?
        .ok_or_else(|| DispatchError::ChannelNotFound(message.channel_id.clone()))?;

    let stored = persist(
        state.messages.clone(),
        NewMessage {
            sender: message.sender.clone(),
            recipient: None,
            content: message.content,
            message_type: message.message_type,
            file_url: message.file_url,
            timestamp: message.timestamp,
        },
    )
    .await?;

    append_to_channel(state.channels.clone(), &message.channel_id, stored.id).await?;

    let mut targets: BTreeSet<String> = snapshot.member_ids.into_iter().collect();
    targets.insert(snapshot.admin_id);

    let event = ServerEvent::ChannelMessageReceived {
        message: stored.clone(),
        channel_id: message.channel_id.clone(),
    };
    let outcomes = fan_out(state, targets, &event);
    log_outcomes("channel", stored.id, &outcomes);

    Ok(stored)
}

/// Announce a newly created channel to its present members.
pub async fn announce_channel(
    state: &AppState,
    channel_id: &str,
) -> Result<usize, DispatchError> {
    let snapshot = fetch_snapshot(state.channels.clone(), channel_id)
        .await?
        .ok_or_else(|| DispatchError::ChannelNotFound(channel_id.to_string()))?;

    let targets: BTreeSet<String> = snapshot.member_ids.iter().cloned().collect();
    let event = ServerEvent::ChannelAddedNotify { channel: snapshot };
    let outcomes = fan_out(state, targets, &event);

    let delivered = outcomes.iter().filter(|o| o.delivered).count();
    tracing::debug!(
        channel_id = %channel_id,
        delivered = delivered,
        "channel announcement fanned out"
    );
    Ok(delivered)
}

/// Deliver an event to every target user that holds a live connection,
/// recording one outcome per attempt. Deliveries are independent pushes onto
/// per-connection queues: one broken connection never blocks the rest.
fn fan_out(
    state: &AppState,
    targets: BTreeSet<String>,
    event: &ServerEvent,
) -> Vec<DeliveryOutcome> {
    let payload = match protocol::encode(event) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound event, skipping fan-out");
            return Vec::new();
        }
    };

    targets
        .into_iter()
        .filter_map(|user_id| {
            let (connection_id, sender) = state.presence.lookup(&user_id)?;
            Some(deliver(user_id, connection_id, &sender, payload.clone()))
        })
        .collect()
}

fn deliver(
    user_id: String,
    connection_id: ConnectionId,
    sender: &ConnectionSender,
    payload: axum::extract::ws::Message,
) -> DeliveryOutcome {
    let delivered = sender.send(payload).is_ok();
    if !delivered {
        tracing::warn!(
            user_id = %user_id,
            connection_id = connection_id,
            "delivery failed: connection channel closed"
        );
    }
    DeliveryOutcome {
        user_id,
        connection_id,
        delivered,
    }
}

fn log_outcomes(kind: &str, message_id: i64, outcomes: &[DeliveryOutcome]) {
    let delivered = outcomes.iter().filter(|o| o.delivered).count();
    tracing::debug!(
        kind = kind,
        message_id = message_id,
        attempted = outcomes.len(),
        delivered = delivered,
        "fan-out complete"
    );
}

// --- Store calls. The only suspension points of a dispatch; no registry or
// limiter lock is held across them. ---

async fn persist(
    store: Arc<dyn MessageStore>,
    message: NewMessage,
) -> Result<StoredMessage, DispatchError> {
    tokio::task::spawn_blocking(move || store.create(message))
        .await
        .map_err(|e| DispatchError::Store(StoreError::Unavailable(e.to_string())))?
        .map_err(DispatchError::from)
}

async fn fetch_snapshot(
    store: Arc<dyn ChannelStore>,
    channel_id: &str,
) -> Result<Option<ChannelSnapshot>, DispatchError> {
    let channel_id = channel_id.to_string();
    tokio::task::spawn_blocking(move || store.snapshot(&channel_id))
        .await
        .map_err(|e| DispatchError::Store(StoreError::Unavailable(e.to_string())))?
        .map_err(DispatchError::from)
}

async fn append_to_channel(
    store: Arc<dyn ChannelStore>,
    channel_id: &str,
    message_id: i64,
) -> Result<(), DispatchError> {
    let channel_id = channel_id.to_string();
    tokio::task::spawn_blocking(move || store.append_message(&channel_id, message_id))
        .await
        .map_err(|e| DispatchError::Store(StoreError::Unavailable(e.to_string())))?
        .map_err(DispatchError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{RateLimitSettings, RateLimiter};
    use axum::extract::ws::Message;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct MemoryMessages {
        rows: Mutex<Vec<StoredMessage>>,
        unavailable: AtomicBool,
    }

    impl MessageStore for MemoryMessages {
        fn create(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("store offline".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            let stored = StoredMessage {
                id: rows.len() as i64 + 1,
                sender: message.sender,
                recipient: message.recipient,
                content: message.content,
                message_type: message.message_type,
                file_url: message.file_url,
                timestamp: message.timestamp.unwrap_or_else(Utc::now),
            };
            rows.push(stored.clone());
            Ok(stored)
        }
    }

    #[derive(Default)]
    struct MemoryChannels {
        channels: Mutex<HashMap<String, ChannelSnapshot>>,
        appends: Mutex<Vec<(String, i64)>>,
    }

    impl ChannelStore for MemoryChannels {
        fn append_message(&self, channel_id: &str, message_id: i64) -> Result<(), StoreError> {
            self.appends
                .lock()
                .unwrap()
                .push((channel_id.to_string(), message_id));
            Ok(())
        }

        fn snapshot(&self, channel_id: &str) -> Result<Option<ChannelSnapshot>, StoreError> {
            Ok(self.channels.lock().unwrap().get(channel_id).cloned())
        }
    }

    struct Harness {
        state: AppState,
        messages: Arc<MemoryMessages>,
        channels: Arc<MemoryChannels>,
    }

    fn harness(budget: u32) -> Harness {
        let messages = Arc::new(MemoryMessages::default());
        let channels = Arc::new(MemoryChannels::default());
        let state = AppState::new(
            RateLimiter::new(RateLimitSettings {
                budget,
                window: Duration::from_secs(60),
            }),
            messages.clone(),
            channels.clone(),
        );
        Harness {
            state,
            messages,
            channels,
        }
    }

    fn connect(state: &AppState, user: &str, conn: ConnectionId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(state.presence.register(user, conn, tx).is_none());
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                events.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        events
    }

    fn direct(sender: &str, recipient: &str) -> OutboundMessage {
        OutboundMessage {
            sender: sender.into(),
            recipient: recipient.into(),
            content: "hello".into(),
            message_type: MessageType::Text,
            file_url: None,
            timestamp: None,
        }
    }

    fn channel_msg(sender: &str, channel_id: &str) -> OutboundChannelMessage {
        OutboundChannelMessage {
            sender: sender.into(),
            channel_id: channel_id.into(),
            content: "hello channel".into(),
            message_type: MessageType::Text,
            file_url: None,
            timestamp: None,
        }
    }

    fn seed_channel(channels: &MemoryChannels, id: &str, members: &[&str], admin: &str) {
        channels.channels.lock().unwrap().insert(
            id.to_string(),
            ChannelSnapshot {
                channel_id: id.to_string(),
                name: "general".into(),
                member_ids: members.iter().map(|m| m.to_string()).collect(),
                admin_id: admin.to_string(),
            },
        );
    }

    #[tokio::test]
    async fn direct_send_delivers_to_recipient_and_sender_echo() {
        let h = harness(30);
        let mut bob_rx = connect(&h.state, "bob", 1);
        let mut carol_rx = connect(&h.state, "carol", 2);

        let stored = dispatch_direct(&h.state, direct("bob", "carol"))
            .await
            .expect("dispatch ok");
        assert_eq!(stored.recipient.as_deref(), Some("carol"));

        let bob_events = drain(&mut bob_rx);
        let carol_events = drain(&mut carol_rx);
        assert_eq!(bob_events.len(), 1, "sender gets its own echo");
        assert_eq!(carol_events.len(), 1);
        assert_eq!(carol_events[0]["event"], "message-received");
        assert_eq!(carol_events[0]["data"]["message"]["content"], "hello");
    }

    #[tokio::test]
    async fn direct_send_to_offline_recipient_persists_without_delivery() {
        let h = harness(30);
        // nobody connected at all
        let stored = dispatch_direct(&h.state, direct("bob", "carol"))
            .await
            .expect("dispatch ok");
        assert_eq!(stored.id, 1);
        assert_eq!(h.messages.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_send_persists_nothing() {
        let h = harness(2);
        assert!(dispatch_direct(&h.state, direct("bob", "carol")).await.is_ok());
        assert!(dispatch_direct(&h.state, direct("bob", "carol")).await.is_ok());

        match dispatch_direct(&h.state, direct("bob", "carol")).await {
            Err(DispatchError::RateLimited) => {}
            other => panic!("expected RateLimited, got {:?}", other.map(|m| m.id)),
        }
        assert_eq!(h.messages.rows.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn channel_send_fans_out_to_members_and_admin() {
        let h = harness(30);
        seed_channel(&h.channels, "ch-1", &["alice", "bob", "carol"], "dana");

        let mut rxs: Vec<_> = ["alice", "bob", "carol", "dana"]
            .iter()
            .enumerate()
            .map(|(i, user)| connect(&h.state, user, i as u64 + 1))
            .collect();

        dispatch_channel(&h.state, channel_msg("alice", "ch-1"))
            .await
            .expect("dispatch ok");

        for rx in &mut rxs {
            let events = drain(rx);
            assert_eq!(events.len(), 1, "each of members + admin gets one copy");
            assert_eq!(events[0]["event"], "channel-message-received");
            assert_eq!(events[0]["data"]["channelId"], "ch-1");
        }
        assert_eq!(h.channels.appends.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn admin_who_is_also_member_gets_one_copy() {
        let h = harness(30);
        seed_channel(&h.channels, "ch-1", &["alice", "dana"], "dana");
        let mut dana_rx = connect(&h.state, "dana", 1);

        dispatch_channel(&h.state, channel_msg("alice", "ch-1"))
            .await
            .expect("dispatch ok");

        assert_eq!(drain(&mut dana_rx).len(), 1, "delivery is de-duplicated");
    }

    #[tokio::test]
    async fn unknown_channel_aborts_with_nothing_persisted() {
        let h = harness(30);
        match dispatch_channel(&h.state, channel_msg("alice", "missing")).await {
            Err(DispatchError::ChannelNotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("expected ChannelNotFound, got {:?}", other.map(|m| m.id)),
        }
        assert!(h.messages.rows.lock().unwrap().is_empty());
        assert!(h.channels.appends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let h = harness(30);
        h.messages.unavailable.store(true, Ordering::SeqCst);
        let mut carol_rx = connect(&h.state, "carol", 1);

        match dispatch_direct(&h.state, direct("bob", "carol")).await {
            Err(DispatchError::Store(_)) => {}
            other => panic!("expected Store error, got {:?}", other.map(|m| m.id)),
        }
        assert!(drain(&mut carol_rx).is_empty(), "no fan-out on store failure");
    }

    #[tokio::test]
    async fn failed_delivery_does_not_abort_others() {
        let h = harness(30);
        seed_channel(&h.channels, "ch-1", &["alice", "bob"], "dana");

        // alice's receiver is dropped: her connection ends mid-flight
        let alice_rx = connect(&h.state, "alice", 1);
        drop(alice_rx);
        let mut bob_rx = connect(&h.state, "bob", 2);

        dispatch_channel(&h.state, channel_msg("bob", "ch-1"))
            .await
            .expect("dispatch still succeeds");

        assert_eq!(drain(&mut bob_rx).len(), 1, "bob's delivery is unaffected");
    }

    #[tokio::test]
    async fn announce_channel_reaches_present_members_only() {
        let h = harness(30);
        seed_channel(&h.channels, "ch-1", &["alice", "bob"], "dana");
        let mut alice_rx = connect(&h.state, "alice", 1);
        // bob offline, dana (admin, not a member) online
        let mut dana_rx = connect(&h.state, "dana", 2);

        let delivered = announce_channel(&h.state, "ch-1").await.expect("announce ok");
        assert_eq!(delivered, 1);

        let alice_events = drain(&mut alice_rx);
        assert_eq!(alice_events.len(), 1);
        assert_eq!(alice_events[0]["event"], "channel-added-notify");
        assert!(drain(&mut dana_rx).is_empty(), "announcement targets members");
    }
}
