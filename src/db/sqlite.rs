//! SQLite-backed implementation of the message and channel stores.

use chrono::Utc;
use rusqlite::params;

use crate::db::DbPool;
use crate::store::{
    ChannelSnapshot, ChannelStore, MessageStore, NewMessage, StoreError, StoredMessage,
};

pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Create a channel with its admin and member set. Channel CRUD proper
    /// lives in the REST layer upstream; this exists for the boot path and
    /// tests that need membership to dispatch against.
    pub fn create_channel(
        &self,
        channel_id: &str,
        name: &str,
        admin_id: &str,
        member_ids: &[&str],
    ) -> Result<(), StoreError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        conn.execute(
            "INSERT INTO channels (id, name, admin_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![channel_id, name, admin_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;

        for member in member_ids {
            conn.execute(
                "INSERT OR IGNORE INTO channel_members (channel_id, user_id) VALUES (?1, ?2)",
                params![channel_id, member],
            )
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        Ok(())
    }

    /// Total persisted messages. Used by tests to assert fail-closed paths
    /// persisted nothing.
    pub fn message_count(&self) -> Result<i64, StoreError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

impl MessageStore for SqliteStore {
    fn create(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let timestamp = message.timestamp.unwrap_or_else(Utc::now);

        conn.execute(
            "INSERT INTO messages (sender, recipient, content, message_type, file_url, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.sender,
                message.recipient,
                message.content,
                message.message_type.as_str(),
                message.file_url,
                timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            sender: message.sender,
            recipient: message.recipient,
            content: message.content,
            message_type: message.message_type,
            file_url: message.file_url,
            timestamp,
        })
    }
}

impl ChannelStore for SqliteStore {
    fn append_message(&self, channel_id: &str, message_id: i64) -> Result<(), StoreError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        conn.execute(
            "INSERT OR IGNORE INTO channel_messages (channel_id, message_id) VALUES (?1, ?2)",
            params![channel_id, message_id],
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    fn snapshot(&self, channel_id: &str) -> Result<Option<ChannelSnapshot>, StoreError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let header = conn
            .query_row(
                "SELECT name, admin_id FROM channels WHERE id = ?1",
                params![channel_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Query(other.to_string())),
            })?;

        let (name, admin_id) = match header {
            Some(pair) => pair,
            None => return Ok(None),
        };

        let mut stmt = conn
            .prepare("SELECT user_id FROM channel_members WHERE channel_id = ?1")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let member_ids: Vec<String> = stmt
            .query_map(params![channel_id], |row| row.get(0))
            .map_err(|e| StoreError::Query(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(ChannelSnapshot {
            channel_id: channel_id.to_string(),
            name,
            member_ids,
            admin_id,
        }))
    }
}
