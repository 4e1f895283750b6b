//! Session window logic and the background sweeper that closes stale
//! sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::Session;
use crate::storage::Storage;

/// Sliding inactivity window after which a session is considered over.
pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 30 * 60;

/// What an incoming event does to the device's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    /// No open session, start a new one.
    Start,
    /// The open session is still inside the window, extend it.
    Reuse,
    /// The open session went stale, close it and start a new one.
    Rotate,
}

/// Judge an event at `now` against the device's open session. The window
/// slides on activity: it is measured from `last_seen_at`, and an event
/// landing exactly on the boundary rotates.
pub fn assess(open: Option<&Session>, now: i64, timeout_secs: i64) -> SessionVerdict {
    match open {
        None => SessionVerdict::Start,
        Some(session) if now - session.last_seen_at < timeout_secs => SessionVerdict::Reuse,
        Some(_) => SessionVerdict::Rotate,
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Periodically close sessions whose window elapsed without another event.
/// Stops when the shutdown signal flips.
pub fn spawn_session_sweeper(
    storage: Arc<dyn Storage>,
    timeout_secs: i64,
    sweep_interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately, skip it.
        interval.tick().await;

        info!(
            interval_secs = sweep_interval_secs,
            timeout_secs, "session sweeper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now().timestamp();
                    match storage.close_stale_sessions(now, timeout_secs).await {
                        Ok(0) => debug!("session sweep found nothing to close"),
                        Ok(closed) => info!(closed, "session sweep closed stale sessions"),
                        Err(e) => error!("session sweep failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("session sweeper shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_session(started_at: i64, last_seen_at: i64) -> Session {
        Session {
            id: "s-1".to_string(),
            device_id: 7,
            user_id: None,
            started_at,
            last_seen_at,
            ended_at: None,
            duration_secs: None,
        }
    }

    #[test]
    fn test_no_open_session_starts() {
        assert_eq!(assess(None, 1_000, 1800), SessionVerdict::Start);
    }

    #[test]
    fn test_inside_window_reuses() {
        let session = open_session(1_000, 1_000);
        assert_eq!(assess(Some(&session), 1_000 + 300, 1800), SessionVerdict::Reuse);
        assert_eq!(assess(Some(&session), 1_000 + 1799, 1800), SessionVerdict::Reuse);
    }

    #[test]
    fn test_window_slides_on_activity() {
        // started long ago, but last event keeps it alive
        let session = open_session(1_000, 10_000);
        assert_eq!(assess(Some(&session), 10_000 + 1700, 1800), SessionVerdict::Reuse);
    }

    #[test]
    fn test_exactly_at_boundary_rotates() {
        let session = open_session(1_000, 1_000);
        assert_eq!(assess(Some(&session), 1_000 + 1800, 1800), SessionVerdict::Rotate);
    }

    #[test]
    fn test_past_boundary_rotates() {
        let session = open_session(1_000, 1_000);
        assert_eq!(assess(Some(&session), 1_000 + 86_400, 1800), SessionVerdict::Rotate);
    }

    #[test]
    fn test_future_last_seen_reuses() {
        // Clock skew between writers must not rotate a live session.
        let session = open_session(1_000, 2_000);
        assert_eq!(assess(Some(&session), 1_500, 1800), SessionVerdict::Reuse);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
