//! Session window tests
//!
//! Drive `record_event` directly with controlled timestamps: the sliding
//! window, the rotation at the timeout boundary and the background sweep.

use hoplink::models::{EventKind, GeoLocation, NewDevice, NewEvent, UtmParams};
use hoplink::storage::{SqliteStorage, Storage};
use std::sync::Arc;

const TIMEOUT: i64 = 1800;
const T0: i64 = 1_700_000_000;

async fn create_test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn device(fingerprint: &str) -> NewDevice {
    NewDevice {
        fingerprint: fingerprint.to_string(),
        ..Default::default()
    }
}

fn visit_at(occurred_at: i64) -> NewEvent {
    NewEvent {
        kind: EventKind::Visit,
        link_id: None,
        occurred_at,
        user_id: None,
        ip: None,
        user_agent: None,
        browser: None,
        os: None,
        device_type: None,
        geo: GeoLocation::default(),
        referrer: None,
        referrer_domain: None,
        utm: UtmParams::default(),
        page_url: None,
    }
}

#[tokio::test]
async fn test_first_event_opens_a_session() {
    let storage = create_test_storage().await;

    let outcome = storage
        .record_event(&device("fp-first"), &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.new_session);

    let session = storage
        .open_session_for_device(outcome.device_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.id, outcome.session_id);
    assert_eq!(session.started_at, T0);
    assert_eq!(session.last_seen_at, T0);
    assert!(session.ended_at.is_none());
    assert!(session.duration_secs.is_none());
}

#[tokio::test]
async fn test_event_within_window_reuses_the_session() {
    let storage = create_test_storage().await;
    let dev = device("fp-reuse");

    let first = storage
        .record_event(&dev, &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    let second = storage
        .record_event(&dev, &visit_at(T0 + 300), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(second.session_id, first.session_id);
    assert!(!second.new_session);

    let session = storage
        .open_session_for_device(first.device_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.started_at, T0);
    assert_eq!(session.last_seen_at, T0 + 300);
}

#[tokio::test]
async fn test_event_after_window_rotates_and_closes_the_old_session() {
    let storage = create_test_storage().await;
    let dev = device("fp-rotate");

    let first = storage
        .record_event(&dev, &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    let rotated_at = T0 + TIMEOUT + 60;
    let second = storage
        .record_event(&dev, &visit_at(rotated_at), TIMEOUT)
        .await
        .unwrap();

    assert_ne!(second.session_id, first.session_id);
    assert!(second.new_session);

    let sessions = storage
        .sessions_for_device(first.device_id, 10)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 2);

    let old = sessions.iter().find(|s| s.id == first.session_id).unwrap();
    assert_eq!(old.ended_at, Some(rotated_at));
    assert_eq!(old.duration_secs, Some(rotated_at - T0));

    let new = sessions.iter().find(|s| s.id == second.session_id).unwrap();
    assert_eq!(new.started_at, rotated_at);
    assert!(new.ended_at.is_none());
}

#[tokio::test]
async fn test_exactly_at_timeout_rotates() {
    let storage = create_test_storage().await;
    let dev = device("fp-boundary");

    let first = storage
        .record_event(&dev, &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    let second = storage
        .record_event(&dev, &visit_at(T0 + TIMEOUT), TIMEOUT)
        .await
        .unwrap();

    assert_ne!(second.session_id, first.session_id);

    let sessions = storage
        .sessions_for_device(first.device_id, 10)
        .await
        .unwrap();
    let old = sessions.iter().find(|s| s.id == first.session_id).unwrap();
    assert_eq!(old.duration_secs, Some(TIMEOUT));
}

#[tokio::test]
async fn test_just_under_timeout_reuses() {
    let storage = create_test_storage().await;
    let dev = device("fp-under");

    let first = storage
        .record_event(&dev, &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    let second = storage
        .record_event(&dev, &visit_at(T0 + TIMEOUT - 1), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(second.session_id, first.session_id);
}

#[tokio::test]
async fn test_window_slides_with_each_event() {
    let storage = create_test_storage().await;
    let dev = device("fp-slide");

    // Each gap stays under the timeout even though the total span exceeds
    // it, the window slides from the last event.
    let first = storage
        .record_event(&dev, &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    let second = storage
        .record_event(&dev, &visit_at(T0 + 1700), TIMEOUT)
        .await
        .unwrap();
    let third = storage
        .record_event(&dev, &visit_at(T0 + 3400), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(second.session_id, first.session_id);
    assert_eq!(third.session_id, first.session_id);
}

#[tokio::test]
async fn test_clock_skew_still_reuses() {
    let storage = create_test_storage().await;
    let dev = device("fp-skew");

    let first = storage
        .record_event(&dev, &visit_at(T0 + 100), TIMEOUT)
        .await
        .unwrap();
    // An event observed before the session's last activity stays inside
    // the window.
    let second = storage
        .record_event(&dev, &visit_at(T0), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(second.session_id, first.session_id);
}

#[tokio::test]
async fn test_sweep_closes_only_stale_sessions() {
    let storage = create_test_storage().await;

    let stale = storage
        .record_event(&device("fp-stale"), &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    let fresh = storage
        .record_event(&device("fp-fresh"), &visit_at(T0 + 1791), TIMEOUT)
        .await
        .unwrap();

    let now = T0 + 1801;
    let closed = storage.close_stale_sessions(now, TIMEOUT).await.unwrap();
    assert_eq!(closed, 1);

    let stale_session = storage
        .sessions_for_device(stale.device_id, 10)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(stale_session.ended_at, Some(now));
    assert_eq!(stale_session.duration_secs, Some(now - T0));

    let fresh_session = storage
        .open_session_for_device(fresh.device_id)
        .await
        .unwrap();
    assert!(fresh_session.is_some());

    // Nothing left to close.
    let closed = storage.close_stale_sessions(now, TIMEOUT).await.unwrap();
    assert_eq!(closed, 0);
}

#[tokio::test]
async fn test_event_after_sweep_starts_a_fresh_session() {
    let storage = create_test_storage().await;
    let dev = device("fp-resume");

    let first = storage
        .record_event(&dev, &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    storage
        .close_stale_sessions(T0 + 2000, TIMEOUT)
        .await
        .unwrap();

    let second = storage
        .record_event(&dev, &visit_at(T0 + 2000), TIMEOUT)
        .await
        .unwrap();
    assert!(second.new_session);
    assert_ne!(second.session_id, first.session_id);
}

#[tokio::test]
async fn test_devices_hold_independent_sessions() {
    let storage = create_test_storage().await;

    let a = storage
        .record_event(&device("fp-ind-a"), &visit_at(T0), TIMEOUT)
        .await
        .unwrap();
    let b = storage
        .record_event(&device("fp-ind-b"), &visit_at(T0), TIMEOUT)
        .await
        .unwrap();

    assert_ne!(a.session_id, b.session_id);
    assert!(storage
        .open_session_for_device(a.device_id)
        .await
        .unwrap()
        .is_some());
    assert!(storage
        .open_session_for_device(b.device_id)
        .await
        .unwrap()
        .is_some());
}
