pub mod actor;
pub mod handler;
pub mod protocol;

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Opaque, process-unique handle to one live client connection.
pub type ConnectionId = u64;

/// Sender half of a connection's outbound channel. Any part of the system
/// can clone this to push messages to that specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a connection id. Ids are never reused within a process, so no
/// two users can ever map to the same live handle.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}
