//! Collaborator interfaces for durable message and channel-membership storage.
//!
//! The dispatch core never owns persistence — it talks to these traits and
//! fails closed when they are unavailable. The production implementation is
//! `db::sqlite::SqliteStore`; tests substitute in-memory doubles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of message payload, matching the client's `messageType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// A message handed to the store for persistence. `recipient` is `None` for
/// channel broadcasts. The store assigns the timestamp when absent.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A persisted message with its durable identity, as fanned out to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of a channel's membership, fetched fresh per dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub name: String,
    pub member_ids: Vec<String>,
    pub admin_id: String,
}

/// Errors surfaced by the store collaborators.
#[derive(Debug)]
pub enum StoreError {
    /// The backing store could not be reached (poisoned lock, task join, ...).
    Unavailable(String),
    /// A query or statement failed.
    Query(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "store unavailable: {}", e),
            Self::Query(e) => write!(f, "store query failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable append-only message log.
///
/// Synchronous by design: the SQLite implementation runs under
/// `tokio::task::spawn_blocking`, which is the dispatcher's only suspension
/// point on the persistence path.
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message, assigning its durable id and timestamp if absent.
    fn create(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;
}

/// Channel membership lookups and the channel's message list.
pub trait ChannelStore: Send + Sync + 'static {
    /// Append a persisted message id to the channel's message list.
    fn append_message(&self, channel_id: &str, message_id: i64) -> Result<(), StoreError>;

    /// Fetch the current membership snapshot, or `None` if the channel
    /// does not exist.
    fn snapshot(&self, channel_id: &str) -> Result<Option<ChannelSnapshot>, StoreError>;
}
