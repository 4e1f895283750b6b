//! Integration tests for the storage layer
//!
//! Covers link CRUD against SQLite, full-capture event rows, the stats
//! rollup, and the caching wrapper's read-through and click-buffer
//! behavior.

use hoplink::models::{EventKind, GeoLocation, NewDevice, NewEvent, UtmParams};
use hoplink::storage::{CachedStorage, SqliteStorage, Storage, StorageError};
use std::sync::Arc;

const TIMEOUT: i64 = 1800;
const T0: i64 = 1_700_000_000;

async fn create_test_storage() -> Arc<dyn Storage> {
    // One connection so every handle sees the same in-memory database.
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

fn click_at(link_id: i64, occurred_at: i64) -> NewEvent {
    NewEvent {
        kind: EventKind::Click,
        link_id: Some(link_id),
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
async fn test_create_link_persists_all_fields() {
    let storage = create_test_storage().await;

    let created = storage
        .create_link("promo", "https://example.com/spring", 301, Some(T0 + 86400), Some("ops"))
        .await
        .unwrap();
    assert!(created.id > 0);

    let link = storage.link_by_alias("promo").await.unwrap().unwrap();
    assert_eq!(link.alias, "promo");
    assert_eq!(link.target_url, "https://example.com/spring");
    assert_eq!(link.redirect_status, 301);
    assert_eq!(link.expires_at, Some(T0 + 86400));
    assert_eq!(link.created_by.as_deref(), Some("ops"));
    assert!(link.is_active);
    assert_eq!(link.clicks, 0);
}

#[tokio::test]
async fn test_duplicate_alias_is_a_conflict() {
    let storage = create_test_storage().await;

    storage
        .create_link("taken", "https://example.com/a", 302, None, None)
        .await
        .unwrap();

    let result = storage
        .create_link("taken", "https://example.com/b", 302, None, None)
        .await;
    assert!(matches!(result, Err(StorageError::Conflict)));

    // The original target survives the failed insert.
    let link = storage.link_by_alias("taken").await.unwrap().unwrap();
    assert_eq!(link.target_url, "https://example.com/a");
}

#[tokio::test]
async fn test_deactivate_and_reactivate_flip_the_flag() {
    let storage = create_test_storage().await;
    storage
        .create_link("toggle", "https://example.com", 302, None, None)
        .await
        .unwrap();

    assert!(storage.deactivate_link("toggle").await.unwrap());
    let link = storage.link_by_alias("toggle").await.unwrap().unwrap();
    assert!(!link.is_active);

    assert!(storage.reactivate_link("toggle").await.unwrap());
    let link = storage.link_by_alias("toggle").await.unwrap().unwrap();
    assert!(link.is_active);

    assert!(!storage.deactivate_link("no-such-alias").await.unwrap());
}

#[tokio::test]
async fn test_increment_clicks_accumulates() {
    let storage = create_test_storage().await;
    storage
        .create_link("counter", "https://example.com", 302, None, None)
        .await
        .unwrap();

    storage.increment_clicks("counter", 2).await.unwrap();
    storage.increment_clicks("counter", 3).await.unwrap();

    let link = storage.link_by_alias("counter").await.unwrap().unwrap();
    assert_eq!(link.clicks, 5);
}

#[tokio::test]
async fn test_list_links_newest_first_with_creator_filter() {
    let storage = create_test_storage().await;
    storage
        .create_link("a1", "https://example.com/1", 302, None, Some("alice"))
        .await
        .unwrap();
    storage
        .create_link("b1", "https://example.com/2", 302, None, Some("bob"))
        .await
        .unwrap();
    storage
        .create_link("a2", "https://example.com/3", 302, None, Some("alice"))
        .await
        .unwrap();

    let all = storage.list_links(10, 0, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].alias, "a2");
    assert_eq!(all[2].alias, "a1");

    let alices = storage.list_links(10, 0, Some("alice")).await.unwrap();
    assert_eq!(alices.len(), 2);
    assert_eq!(alices[0].alias, "a2");
    assert_eq!(alices[1].alias, "a1");

    let paged = storage.list_links(1, 1, Some("alice")).await.unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].alias, "a1");
}

#[tokio::test]
async fn test_event_row_persists_the_full_capture() {
    let storage = create_test_storage().await;
    let link = storage
        .create_link("rich", "https://example.com", 302, None, None)
        .await
        .unwrap();

    let event = NewEvent {
        kind: EventKind::Click,
        link_id: Some(link.id),
        occurred_at: T0,
        user_id: Some("u1".to_string()),
        ip: Some("203.0.113.9".to_string()),
        user_agent: Some("Mozilla/5.0".to_string()),
        browser: Some("Firefox".to_string()),
        os: Some("Linux".to_string()),
        device_type: Some("desktop".to_string()),
        geo: GeoLocation {
            country_code: Some("US".to_string()),
            city: Some("Seattle".to_string()),
            latitude: Some(47.6),
            longitude: Some(-122.3),
        },
        referrer: Some("https://news.example.org/today".to_string()),
        referrer_domain: Some("news.example.org".to_string()),
        utm: UtmParams {
            source: Some("newsletter".to_string()),
            medium: Some("email".to_string()),
            campaign: Some("spring".to_string()),
            term: Some("shoes".to_string()),
            content: Some("cta".to_string()),
        },
        page_url: Some("https://example.com/landing?utm_source=newsletter".to_string()),
    };

    let outcome = storage
        .record_event(&device("fp-rich"), &event, TIMEOUT)
        .await
        .unwrap();

    let rows = storage.events_for_link(link.id, 10, 0).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.kind, "click");
    assert_eq!(row.link_id, Some(link.id));
    assert_eq!(row.device_id, Some(outcome.device_id));
    assert_eq!(row.session_id.as_deref(), Some(outcome.session_id.as_str()));
    assert_eq!(row.user_id.as_deref(), Some("u1"));
    assert_eq!(row.occurred_at, T0);
    assert_eq!(row.ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(row.browser.as_deref(), Some("Firefox"));
    assert_eq!(row.os.as_deref(), Some("Linux"));
    assert_eq!(row.device_type.as_deref(), Some("desktop"));
    assert_eq!(row.country_code.as_deref(), Some("US"));
    assert_eq!(row.city.as_deref(), Some("Seattle"));
    assert_eq!(row.latitude, Some(47.6));
    assert_eq!(row.longitude, Some(-122.3));
    assert_eq!(row.referrer_domain.as_deref(), Some("news.example.org"));
    assert_eq!(row.utm_source.as_deref(), Some("newsletter"));
    assert_eq!(row.utm_medium.as_deref(), Some("email"));
    assert_eq!(row.utm_campaign.as_deref(), Some("spring"));
    assert_eq!(row.utm_term.as_deref(), Some("shoes"));
    assert_eq!(row.utm_content.as_deref(), Some("cta"));
    assert!(row.page_url.is_some());
    // The core never writes conversion metadata, only the columns exist.
    assert_eq!(row.conversion_type, None);
    assert_eq!(row.conversion_value, None);
}

#[tokio::test]
async fn test_visit_event_needs_no_link() {
    let storage = create_test_storage().await;

    let visit = NewEvent {
        kind: EventKind::Visit,
        link_id: None,
        occurred_at: T0,
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
        page_url: Some("https://example.com/pricing".to_string()),
    };

    let outcome = storage
        .record_event(&device("fp-visit"), &visit, TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.event_id > 0);

    let open = storage
        .open_session_for_device(outcome.device_id)
        .await
        .unwrap();
    assert!(open.is_some());
}

#[tokio::test]
async fn test_link_event_stats_count_distinct_devices_and_sessions() {
    let storage = create_test_storage().await;
    let link = storage
        .create_link("stats", "https://example.com", 302, None, None)
        .await
        .unwrap();

    // Device A clicks twice inside one session, device B once.
    storage
        .record_event(&device("fp-a"), &click_at(link.id, T0), TIMEOUT)
        .await
        .unwrap();
    storage
        .record_event(&device("fp-a"), &click_at(link.id, T0 + 10), TIMEOUT)
        .await
        .unwrap();
    storage
        .record_event(&device("fp-b"), &click_at(link.id, T0), TIMEOUT)
        .await
        .unwrap();

    let stats = storage.link_event_stats(link.id).await.unwrap();
    assert_eq!(stats.events, 3);
    assert_eq!(stats.devices, 2);
    assert_eq!(stats.sessions, 2);
}

#[tokio::test]
async fn test_cached_lookup_reads_through_once() {
    let backend = create_test_storage().await;
    let cached = CachedStorage::new(Arc::clone(&backend), 10_000, 3600);

    backend
        .create_link("hot", "https://example.com", 302, None, None)
        .await
        .unwrap();

    let first = cached.link_with_metadata("hot").await.unwrap();
    assert!(first.link.is_some());
    assert!(!first.metadata.cache_hit);
    assert!(first.metadata.db_duration.is_some());

    let second = cached.link_with_metadata("hot").await.unwrap();
    assert!(second.link.is_some());
    assert!(second.metadata.cache_hit);
    assert!(second.metadata.db_duration.is_none());
}

#[tokio::test]
async fn test_buffered_clicks_fold_into_authoritative_reads() {
    let backend = create_test_storage().await;
    let cached = CachedStorage::new(Arc::clone(&backend), 10_000, 3600);

    cached
        .create_link("buffered", "https://example.com", 302, None, None)
        .await
        .unwrap();

    cached.increment_clicks("buffered", 3).await.unwrap();

    // The plain cached read serves the cached row, buffered clicks are
    // invisible there.
    let cached_view = cached.link_by_alias("buffered").await.unwrap().unwrap();
    assert_eq!(cached_view.clicks, 0);

    // The authoritative read folds the buffer in.
    let authoritative = cached
        .link_by_alias_authoritative("buffered")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(authoritative.clicks, 3);

    // Listing folds the buffer too.
    let listed = cached.list_links(10, 0, None).await.unwrap();
    assert_eq!(listed[0].clicks, 3);
}

#[tokio::test]
async fn test_deactivation_invalidates_the_cache() {
    let backend = create_test_storage().await;
    let cached = CachedStorage::new(Arc::clone(&backend), 10_000, 3600);

    cached
        .create_link("gone-soon", "https://example.com", 302, None, None)
        .await
        .unwrap();

    // Warm the cache with the active row.
    assert!(cached.link_by_alias("gone-soon").await.unwrap().unwrap().is_active);

    cached.deactivate_link("gone-soon").await.unwrap();

    // The next read must see the deactivation immediately.
    let link = cached.link_by_alias("gone-soon").await.unwrap().unwrap();
    assert!(!link.is_active);
}

#[tokio::test]
async fn test_create_overwrites_a_negative_cache_entry() {
    let backend = create_test_storage().await;
    let cached = CachedStorage::new(Arc::clone(&backend), 10_000, 3600);

    // Miss first, which caches the absence.
    assert!(cached.link_by_alias("later").await.unwrap().is_none());

    cached
        .create_link("later", "https://example.com", 302, None, None)
        .await
        .unwrap();

    // The stale negative entry must not shadow the new link.
    assert!(cached.link_by_alias("later").await.unwrap().is_some());
}
