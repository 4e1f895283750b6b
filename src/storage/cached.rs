use crate::models::{Device, EventRecord, Link, NewDevice, NewEvent, RecordOutcome, Session};
use crate::storage::{
    LinkEventStats, LookupMetadata, LookupResult, Storage, StorageResult,
};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time;

/// Storage wrapper that adds read caching for link lookups and write
/// buffering for the click counter.
pub struct CachedStorage {
    inner: Arc<dyn Storage>,
    /// Read cache for link lookups (Moka cache)
    read_cache: Cache<String, Option<Link>>,
    /// Write buffer for click increments (DashMap)
    click_buffer: Arc<DashMap<String, u64>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn Storage>, max_cache_entries: u64, flush_interval_secs: u64) -> Self {
        let read_cache = Cache::builder()
            .max_capacity(max_cache_entries)
            .time_to_live(Duration::from_secs(300)) // 5 minutes TTL
            .build();

        let click_buffer = Arc::new(DashMap::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        // Background task flushes buffered clicks periodically and once more
        // on shutdown.
        let storage = Arc::clone(&inner);
        let buffer = Arc::clone(&click_buffer);
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(flush_interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = flush_click_buffer(&storage, &buffer).await {
                            tracing::error!("Failed to flush click buffer: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Shutdown signal received, flushing click buffer...");
                            if let Err(e) = flush_click_buffer(&storage, &buffer).await {
                                tracing::error!("Failed to flush click buffer on shutdown: {}", e);
                            } else {
                                tracing::info!("Click buffer flushed successfully on shutdown");
                            }
                            break;
                        }
                    }
                }
            }
        });

        Self {
            inner,
            read_cache,
            click_buffer,
            shutdown_tx,
        }
    }

    /// Signal shutdown to flush buffered data
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn buffered_clicks(&self, alias: &str) -> u64 {
        self.click_buffer
            .get(alias)
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    async fn invalidate_cache(&self, alias: &str) {
        self.read_cache.invalidate(alias).await;
    }
}

/// Flush accumulated clicks to the underlying storage.
async fn flush_click_buffer(
    storage: &Arc<dyn Storage>,
    buffer: &Arc<DashMap<String, u64>>,
) -> Result<()> {
    // Collect increments while zeroing counts so concurrent writers can continue
    let pending_updates = buffer
        .iter_mut()
        .filter_map(|mut entry| {
            let count = *entry.value();
            if count == 0 {
                return None;
            }

            *entry.value_mut() = 0;
            Some((entry.key().clone(), count))
        })
        .collect::<Vec<(String, u64)>>();

    // Remove empty entries in case no new clicks were buffered meanwhile
    buffer.retain(|_, v| *v > 0);

    for (alias, count) in pending_updates {
        storage.increment_clicks(&alias, count).await?;
    }

    Ok(())
}

#[async_trait]
impl Storage for CachedStorage {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn create_link(
        &self,
        alias: &str,
        target_url: &str,
        redirect_status: i64,
        expires_at: Option<i64>,
        created_by: Option<&str>,
    ) -> StorageResult<Link> {
        let link = self
            .inner
            .create_link(alias, target_url, redirect_status, expires_at, created_by)
            .await?;

        // Cache the newly created link, overwriting a stale negative entry.
        self.read_cache
            .insert(alias.to_string(), Some(link.clone()))
            .await;

        Ok(link)
    }

    async fn link_by_alias(&self, alias: &str) -> Result<Option<Link>> {
        if let Some(cached) = self.read_cache.get(alias).await {
            return Ok(cached);
        }

        let link = self.inner.link_by_alias(alias).await?;

        // Cache the database value, misses included.
        self.read_cache.insert(alias.to_string(), link.clone()).await;

        Ok(link)
    }

    async fn link_with_metadata(&self, alias: &str) -> Result<LookupResult> {
        if let Some(cached) = self.read_cache.get(alias).await {
            return Ok(LookupResult {
                link: cached,
                metadata: LookupMetadata {
                    cache_hit: true,
                    db_duration: None,
                },
            });
        }

        let started = Instant::now();
        let link = self.inner.link_by_alias(alias).await?;
        let db_duration = started.elapsed();

        self.read_cache.insert(alias.to_string(), link.clone()).await;

        Ok(LookupResult {
            link,
            metadata: LookupMetadata {
                cache_hit: false,
                db_duration: Some(db_duration),
            },
        })
    }

    async fn link_by_alias_authoritative(&self, alias: &str) -> Result<Option<Link>> {
        let db_value = self.inner.link_by_alias_authoritative(alias).await?;

        // Keep cache in sync with the latest database read
        self.read_cache
            .insert(alias.to_string(), db_value.clone())
            .await;

        let mut link = db_value;
        if let Some(ref mut link) = link {
            link.clicks += self.buffered_clicks(alias) as i64;
        }

        Ok(link)
    }

    async fn deactivate_link(&self, alias: &str) -> Result<bool> {
        let result = self.inner.deactivate_link(alias).await?;

        if result {
            self.invalidate_cache(alias).await;
        }

        Ok(result)
    }

    async fn reactivate_link(&self, alias: &str) -> Result<bool> {
        let result = self.inner.reactivate_link(alias).await?;

        if result {
            self.invalidate_cache(alias).await;
        }

        Ok(result)
    }

    async fn increment_clicks(&self, alias: &str, amount: u64) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }

        // Buffer the increment in memory, the background task persists it.
        self.click_buffer
            .entry(alias.to_string())
            .and_modify(|count| *count += amount)
            .or_insert(amount);

        Ok(())
    }

    async fn list_links(
        &self,
        limit: i64,
        offset: i64,
        created_by: Option<&str>,
    ) -> Result<Vec<Link>> {
        let mut links = self.inner.list_links(limit, offset, created_by).await?;

        // Fold buffered clicks into each link
        for link in &mut links {
            link.clicks += self.buffered_clicks(&link.alias) as i64;
        }

        Ok(links)
    }

    async fn record_event(
        &self,
        device: &NewDevice,
        event: &NewEvent,
        session_timeout_secs: i64,
    ) -> StorageResult<RecordOutcome> {
        self.inner.record_event(device, event, session_timeout_secs).await
    }

    async fn close_stale_sessions(&self, now: i64, timeout_secs: i64) -> Result<u64> {
        self.inner.close_stale_sessions(now, timeout_secs).await
    }

    async fn device_by_identity(
        &self,
        fingerprint: &str,
        client_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Option<Device>> {
        self.inner
            .device_by_identity(fingerprint, client_id, user_id)
            .await
    }

    async fn devices_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<Device>> {
        self.inner.devices_for_fingerprint(fingerprint).await
    }

    async fn open_session_for_device(&self, device_id: i64) -> Result<Option<Session>> {
        self.inner.open_session_for_device(device_id).await
    }

    async fn sessions_for_device(&self, device_id: i64, limit: i64) -> Result<Vec<Session>> {
        self.inner.sessions_for_device(device_id, limit).await
    }

    async fn events_for_link(
        &self,
        link_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<EventRecord>> {
        self.inner.events_for_link(link_id, limit, offset).await
    }

    async fn link_event_stats(&self, link_id: i64) -> Result<LinkEventStats> {
        self.inner.link_event_stats(link_id).await
    }
}
