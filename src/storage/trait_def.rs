use crate::models::{Device, EventRecord, Link, NewDevice, NewEvent, RecordOutcome, Session};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("alias already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// How a lookup was served, surfaced as response headers on the hot path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupMetadata {
    pub cache_hit: bool,
    pub db_duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct LookupResult {
    pub link: Option<Link>,
    pub metadata: LookupMetadata,
}

/// Aggregate event counts for one link.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LinkEventStats {
    pub events: i64,
    pub devices: i64,
    pub sessions: i64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create tables and indexes).
    async fn init(&self) -> Result<()>;

    /// Create a link with a caller-provided alias.
    async fn create_link(
        &self,
        alias: &str,
        target_url: &str,
        redirect_status: i64,
        expires_at: Option<i64>,
        created_by: Option<&str>,
    ) -> StorageResult<Link>;

    /// Get a link by alias.
    async fn link_by_alias(&self, alias: &str) -> Result<Option<Link>>;

    /// Lookup with cache metadata for the redirect hot path.
    async fn link_with_metadata(&self, alias: &str) -> Result<LookupResult> {
        let started = Instant::now();
        let link = self.link_by_alias(alias).await?;
        Ok(LookupResult {
            link,
            metadata: LookupMetadata {
                cache_hit: false,
                db_duration: Some(started.elapsed()),
            },
        })
    }

    /// Read a link straight from the database, bypassing any cache. The
    /// cached wrapper folds buffered clicks into the returned count.
    async fn link_by_alias_authoritative(&self, alias: &str) -> Result<Option<Link>> {
        self.link_by_alias(alias).await
    }

    /// Deactivate a link (soft delete).
    async fn deactivate_link(&self, alias: &str) -> Result<bool>;

    /// Reactivate a link.
    async fn reactivate_link(&self, alias: &str) -> Result<bool>;

    /// Add to the denormalized click counter. The counter moves
    /// independently of recorded click events and may lag them.
    async fn increment_clicks(&self, alias: &str, amount: u64) -> Result<()>;

    /// List links, newest first, optionally filtered by creator.
    async fn list_links(
        &self,
        limit: i64,
        offset: i64,
        created_by: Option<&str>,
    ) -> Result<Vec<Link>>;

    /// Persist one analytics event, resolving the device row and session
    /// window inside a single transaction.
    async fn record_event(
        &self,
        device: &NewDevice,
        event: &NewEvent,
        session_timeout_secs: i64,
    ) -> StorageResult<RecordOutcome>;

    /// Close every open session whose inactivity window elapsed before
    /// `now`. Returns how many were closed.
    async fn close_stale_sessions(&self, now: i64, timeout_secs: i64) -> Result<u64>;

    /// Find the device row for an exact identity key.
    async fn device_by_identity(
        &self,
        fingerprint: &str,
        client_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Option<Device>>;

    /// All device rows sharing a fingerprint (different client or user ids).
    async fn devices_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<Device>>;

    /// The device's open session, if any. At most one exists.
    async fn open_session_for_device(&self, device_id: i64) -> Result<Option<Session>>;

    /// Recent sessions for a device, newest first.
    async fn sessions_for_device(&self, device_id: i64, limit: i64) -> Result<Vec<Session>>;

    /// Recent events for a link, newest first.
    async fn events_for_link(&self, link_id: i64, limit: i64, offset: i64)
        -> Result<Vec<EventRecord>>;

    /// Event, device and session counts for a link.
    async fn link_event_stats(&self, link_id: i64) -> Result<LinkEventStats>;
}

/// True when the error is a unique constraint violation, used to detect a
/// lost race on the one-open-session-per-device index.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
