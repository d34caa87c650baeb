//! Periodic sweep for state that no event will ever clean up: searches that
//! waited past the timeout, and sessions whose members both vanished without
//! a disconnect event.

use crate::protocol::ServerMessage;
use crate::websocket::AppState;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(state.config.reap_interval_seconds);
        let mut ticker = tokio::time::interval(interval);
        debug!(interval_seconds = state.config.reap_interval_seconds, "reaper started");
        loop {
            ticker.tick().await;
            sweep(&state).await;
        }
    })
}

/// One sweep pass. Public so tests can drive it without waiting for the
/// interval.
pub async fn sweep(state: &AppState) {
    let timeout = Duration::from_secs(state.config.wait_timeout_seconds);

    let expired = state.matchmaker.reap_stale_waiters(timeout);
    for entry in &expired {
        state
            .registry
            .send(&entry.connection_id, ServerMessage::SearchCancelled);
        info!(
            connection_id = %entry.connection_id,
            mode = %entry.mode,
            "search timed out"
        );
    }

    let orphaned = state.matchmaker.reap_orphaned_sessions();
    for session in &orphaned {
        for member in &session.members {
            state.transports.close_all(member).await;
        }
        info!(room_id = %session.room_id, "removed orphaned session");
    }

    if !expired.is_empty() || !orphaned.is_empty() {
        debug!(
            expired_waiters = expired.len(),
            orphaned_sessions = orphaned.len(),
            "reaper sweep finished"
        );
    }
}
