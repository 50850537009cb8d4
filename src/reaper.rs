//! Periodic eviction of stale sessions.
//!
//! A connection that has shown no activity (frames, pings, pongs) within the
//! idle threshold is forcibly closed, unregistered, and its rate-limit state
//! cleared. Reaping is advisory cleanup: a missed cycle delays memory
//! reclamation but never corrupts state, so per-entry failures are logged
//! and the sweep continues.

use axum::extract::ws::{CloseFrame, Message};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::limiter::RateLimiter;
use crate::presence::PresenceRegistry;
use crate::state::AppState;

/// Close code sent to a connection evicted for idleness.
const CLOSE_IDLE: u16 = 4008;

/// Sweep schedule: period between sweeps and the idle threshold past which
/// a session is considered stale.
#[derive(Debug, Clone, Copy)]
pub struct ReaperSettings {
    pub sweep_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        // sweep every 5 minutes, evict after 1 hour idle
        Self {
            sweep_interval: Duration::from_secs(300),
            idle_threshold: Duration::from_secs(3600),
        }
    }
}

/// Handle to the running reaper task. Dropping it without calling
/// `shutdown` leaves the task running for the process lifetime.
pub struct Reaper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Stop the sweep loop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawn the periodic sweep tied to the service lifetime.
pub fn spawn(state: AppState, settings: ReaperSettings) -> Reaper {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = interval(settings.sweep_interval);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = sweep(&state.presence, &state.limiter, settings.idle_threshold);
                    if evicted > 0 {
                        tracing::info!(evicted = evicted, "stale session sweep evicted sessions");
                    } else {
                        tracing::debug!("stale session sweep: nothing to evict");
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("stale session reaper stopped");
                    break;
                }
            }
        }
    });

    Reaper {
        shutdown: shutdown_tx,
        handle,
    }
}

/// One sweep pass: close, unregister, and clear rate state for every session
/// idle past `idle_threshold`. Returns the number of evicted sessions.
pub fn sweep(
    presence: &PresenceRegistry,
    limiter: &RateLimiter,
    idle_threshold: Duration,
) -> usize {
    let mut evicted = 0;

    for session in presence.snapshot() {
        if session.idle_for <= idle_threshold {
            continue;
        }

        tracing::info!(
            user_id = %session.user_id,
            connection_id = session.connection_id,
            idle_secs = session.idle_for.as_secs(),
            "evicting stale session"
        );

        // Best-effort close; the connection may already be gone.
        let _ = session.sender.send(Message::Close(Some(CloseFrame {
            code: CLOSE_IDLE,
            reason: "idle timeout".into(),
        })));

        if presence.unregister(session.connection_id).is_some() {
            limiter.clear(&session.user_id);
            evicted += 1;
        }
    }

    evicted
}
