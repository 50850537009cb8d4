//! Authoritative mapping of user identity to live connection.
//!
//! One entry per user; registering a second connection for the same user
//! atomically replaces the old entry and hands the caller a takeover notice
//! so the superseded connection can be told it lost before it is closed.
//! Storage is a DashMap keyed by user id — shard locking gives per-key
//! atomicity without serializing unrelated users.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Instant;

use crate::ws::{ConnectionId, ConnectionSender};

/// A live session: the entry the registry owns per user.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub sender: ConnectionSender,
    /// Last-activity timestamp, refreshed by any inbound frame (the reaper's
    /// idle clock, not the wall-clock connect time).
    pub last_activity: Instant,
}

/// Handed back by `register` when the user already held a different live
/// connection. The caller notifies and closes the old connection.
#[derive(Debug)]
pub struct TakeoverNotice {
    pub old_connection: ConnectionId,
    pub old_sender: ConnectionSender,
}

/// Per-entry-consistent view used by the stale-session reaper.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub sender: ConnectionSender,
    pub idle_for: std::time::Duration,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<String, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `connection_id` as the user's current connection.
    ///
    /// Last writer wins: an existing entry with a different connection id is
    /// replaced and returned as a `TakeoverNotice`. Re-registering the same
    /// connection id is a no-op with no notice. Atomic with respect to
    /// concurrent registrations for the same user (two tabs racing).
    pub fn register(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        sender: ConnectionSender,
    ) -> Option<TakeoverNotice> {
        let entry = PresenceEntry {
            user_id: user_id.to_string(),
            connection_id,
            sender,
            last_activity: Instant::now(),
        };
        match self.entries.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().connection_id == connection_id {
                    return None;
                }
                let old = occupied.insert(entry);
                Some(TakeoverNotice {
                    old_connection: old.connection_id,
                    old_sender: old.sender,
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                None
            }
        }
    }

    /// Remove the entry whose *current* connection id matches.
    ///
    /// Returns the user id when an entry was actually removed, so the caller
    /// can clear per-user rate-limit state. A superseded connection finds a
    /// different current id and removes nothing — safe to call once per
    /// physical disconnect.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<String> {
        let user_id = self
            .entries
            .iter()
            .find(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())?;

        // Re-check under the shard lock: the entry may have been replaced
        // between the scan and the removal.
        self.entries
            .remove_if(&user_id, |_, entry| entry.connection_id == connection_id)
            .map(|(user_id, _)| user_id)
    }

    /// The user's live connection, or `None` if offline.
    pub fn lookup(&self, user_id: &str) -> Option<(ConnectionId, ConnectionSender)> {
        self.entries
            .get(user_id)
            .map(|entry| (entry.connection_id, entry.sender.clone()))
    }

    /// Refresh last-activity iff `connection_id` is still the user's current
    /// connection. Called on every inbound frame, including ping/pong.
    pub fn touch(&self, user_id: &str, connection_id: ConnectionId) {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            if entry.connection_id == connection_id {
                entry.last_activity = Instant::now();
            }
        }
    }

    /// Consistent per-entry view for the reaper: no entry is observed twice
    /// and no entry is seen mid-replacement.
    pub fn snapshot(&self) -> Vec<SessionView> {
        let now = Instant::now();
        self.entries
            .iter()
            .map(|entry| SessionView {
                user_id: entry.key().clone(),
                connection_id: entry.value().connection_id,
                sender: entry.value().sender.clone(),
                idle_for: now.saturating_duration_since(entry.value().last_activity),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Test hook: age a user's last-activity so reaper sweeps can be
    /// exercised without waiting out the idle threshold. Ages are kept small
    /// because the monotonic clock cannot be rewound past its origin.
    #[cfg(test)]
    pub(crate) fn backdate(&self, user_id: &str, age: std::time::Duration) {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            entry.last_activity = Instant::now()
                .checked_sub(age)
                .expect("backdate age within monotonic clock range");
        }
    }
}
