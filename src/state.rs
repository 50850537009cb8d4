use std::sync::Arc;

use crate::limiter::RateLimiter;
use crate::presence::PresenceRegistry;
use crate::store::{ChannelStore, MessageStore};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Authoritative user -> live connection mapping
    pub presence: Arc<PresenceRegistry>,
    /// Per-user send-rate accounting
    pub limiter: Arc<RateLimiter>,
    /// Durable append-only message log (external collaborator)
    pub messages: Arc<dyn MessageStore>,
    /// Channel membership store (external collaborator)
    pub channels: Arc<dyn ChannelStore>,
}

impl AppState {
    pub fn new(
        limiter: RateLimiter,
        messages: Arc<dyn MessageStore>,
        channels: Arc<dyn ChannelStore>,
    ) -> Self {
        Self {
            presence: Arc::new(PresenceRegistry::new()),
            limiter: Arc::new(limiter),
            messages,
            channels,
        }
    }
}
