use crate::analytics::session::{self, SessionVerdict};
use crate::models::{Device, EventRecord, Link, NewDevice, NewEvent, RecordOutcome, Session};
use crate::storage::trait_def::is_unique_violation;
use crate::storage::{LinkEventStats, Storage, StorageError, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Bounded busy wait so a stuck writer fails fast instead of piling
        // up transactions behind it.
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// One attempt at the record transaction. A unique violation on the
    /// open-session index bubbles up so the caller can retry against the
    /// winner's session.
    async fn record_event_once(
        &self,
        device: &NewDevice,
        event: &NewEvent,
        session_timeout_secs: i64,
    ) -> Result<RecordOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let now = event.occurred_at;
        let client_id = device.client_id.as_deref().unwrap_or("");
        let user_id = device.user_id.as_deref().unwrap_or("");

        // Upsert the device row. Concurrent first-time inserts for the same
        // identity collapse into the DO UPDATE arm.
        sqlx::query(
            r#"
            INSERT INTO devices (fingerprint, client_id, user_id, user_agent, browser,
                                 device_type, screen_width, screen_height, device_memory,
                                 platform, timezone, language, ip, created_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (fingerprint, client_id, user_id) DO UPDATE SET
                user_agent = COALESCE(excluded.user_agent, devices.user_agent),
                browser = COALESCE(excluded.browser, devices.browser),
                device_type = COALESCE(excluded.device_type, devices.device_type),
                screen_width = COALESCE(excluded.screen_width, devices.screen_width),
                screen_height = COALESCE(excluded.screen_height, devices.screen_height),
                device_memory = COALESCE(excluded.device_memory, devices.device_memory),
                platform = COALESCE(excluded.platform, devices.platform),
                timezone = COALESCE(excluded.timezone, devices.timezone),
                language = COALESCE(excluded.language, devices.language),
                ip = COALESCE(excluded.ip, devices.ip),
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(&device.fingerprint)
        .bind(client_id)
        .bind(user_id)
        .bind(&device.user_agent)
        .bind(&device.browser)
        .bind(&device.device_type)
        .bind(device.screen_width)
        .bind(device.screen_height)
        .bind(device.device_memory)
        .bind(&device.platform)
        .bind(&device.timezone)
        .bind(&device.language)
        .bind(&device.ip)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let device_row = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, fingerprint, NULLIF(client_id, '') AS client_id,
                   NULLIF(user_id, '') AS user_id, user_agent, browser, device_type,
                   screen_width, screen_height, device_memory, platform, timezone,
                   language, ip, created_at, last_seen_at
            FROM devices
            WHERE fingerprint = ? AND client_id = ? AND user_id = ?
            "#,
        )
        .bind(&device.fingerprint)
        .bind(client_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        let open = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, device_id, user_id, started_at, last_seen_at, ended_at, duration_secs
            FROM sessions
            WHERE device_id = ? AND ended_at IS NULL
            "#,
        )
        .bind(device_row.id)
        .fetch_optional(&mut *tx)
        .await?;

        let verdict = session::assess(open.as_ref(), now, session_timeout_secs);
        let (session_id, new_session) = match (verdict, open) {
            (SessionVerdict::Reuse, Some(current)) => {
                sqlx::query("UPDATE sessions SET last_seen_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(&current.id)
                    .execute(&mut *tx)
                    .await?;
                (current.id, false)
            }
            (SessionVerdict::Rotate, Some(current)) => {
                sqlx::query(
                    "UPDATE sessions SET ended_at = ?, duration_secs = ? - started_at WHERE id = ?",
                )
                .bind(now)
                .bind(now)
                .bind(&current.id)
                .execute(&mut *tx)
                .await?;
                (insert_session(&mut tx, device_row.id, event, now).await?, true)
            }
            _ => (insert_session(&mut tx, device_row.id, event, now).await?, true),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO events (kind, link_id, device_id, session_id, user_id, occurred_at,
                                ip, user_agent, browser, os, device_type,
                                country_code, city, latitude, longitude,
                                referrer, referrer_domain,
                                utm_source, utm_medium, utm_campaign, utm_term, utm_content,
                                page_url)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.kind.as_str())
        .bind(event.link_id)
        .bind(device_row.id)
        .bind(&session_id)
        .bind(&event.user_id)
        .bind(event.occurred_at)
        .bind(&event.ip)
        .bind(&event.user_agent)
        .bind(&event.browser)
        .bind(&event.os)
        .bind(&event.device_type)
        .bind(&event.geo.country_code)
        .bind(&event.geo.city)
        .bind(event.geo.latitude)
        .bind(event.geo.longitude)
        .bind(&event.referrer)
        .bind(&event.referrer_domain)
        .bind(&event.utm.source)
        .bind(&event.utm.medium)
        .bind(&event.utm.campaign)
        .bind(&event.utm.term)
        .bind(&event.utm.content)
        .bind(&event.page_url)
        .execute(&mut *tx)
        .await?;

        let event_id = result.last_insert_rowid();

        tx.commit().await?;

        Ok(RecordOutcome {
            event_id,
            device_id: device_row.id,
            device_key: device_row.device_key().to_string(),
            session_id,
            new_session,
        })
    }
}

async fn insert_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    device_id: i64,
    event: &NewEvent,
    now: i64,
) -> Result<String, sqlx::Error> {
    let id = session::new_session_id();
    sqlx::query(
        r#"
        INSERT INTO sessions (id, device_id, user_id, started_at, last_seen_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(device_id)
    .bind(&event.user_id)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alias TEXT NOT NULL UNIQUE,
                target_url TEXT NOT NULL,
                redirect_status INTEGER NOT NULL DEFAULT 302,
                is_active INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER,
                clicks INTEGER NOT NULL DEFAULT 0,
                created_by TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_alias ON links(alias)")
            .execute(self.pool.as_ref())
            .await?;

        // Anonymous client and user ids are stored as '' so the identity
        // key stays unique across rows.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL,
                client_id TEXT NOT NULL DEFAULT '',
                user_id TEXT NOT NULL DEFAULT '',
                user_agent TEXT,
                browser TEXT,
                device_type TEXT,
                screen_width INTEGER,
                screen_height INTEGER,
                device_memory REAL,
                platform TEXT,
                timezone TEXT,
                language TEXT,
                ip TEXT,
                created_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                UNIQUE (fingerprint, client_id, user_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_fingerprint ON devices(fingerprint)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                device_id INTEGER NOT NULL REFERENCES devices(id),
                user_id TEXT,
                started_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                ended_at INTEGER,
                duration_secs INTEGER
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // At most one open session per device.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_device
            ON sessions(device_id) WHERE ended_at IS NULL
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_stale
            ON sessions(last_seen_at) WHERE ended_at IS NULL
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                link_id INTEGER REFERENCES links(id),
                device_id INTEGER REFERENCES devices(id),
                session_id TEXT REFERENCES sessions(id),
                user_id TEXT,
                occurred_at INTEGER NOT NULL,
                ip TEXT,
                user_agent TEXT,
                browser TEXT,
                os TEXT,
                device_type TEXT,
                country_code TEXT,
                city TEXT,
                latitude REAL,
                longitude REAL,
                referrer TEXT,
                referrer_domain TEXT,
                utm_source TEXT,
                utm_medium TEXT,
                utm_campaign TEXT,
                utm_term TEXT,
                utm_content TEXT,
                page_url TEXT,
                conversion_type TEXT,
                conversion_value REAL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_link ON events(link_id, occurred_at)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn create_link(
        &self,
        alias: &str,
        target_url: &str,
        redirect_status: i64,
        expires_at: Option<i64>,
        created_by: Option<&str>,
    ) -> StorageResult<Link> {
        let created_at = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO links (alias, target_url, redirect_status, is_active, expires_at,
                               created_by, created_at)
            VALUES (?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT(alias) DO NOTHING
            "#,
        )
        .bind(alias)
        .bind(target_url)
        .bind(redirect_status)
        .bind(expires_at)
        .bind(created_by)
        .bind(created_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }

        let link = sqlx::query_as::<_, Link>(
            r#"
            SELECT id, alias, target_url, redirect_status, is_active, expires_at, clicks,
                   created_by, created_at
            FROM links
            WHERE alias = ?
            "#,
        )
        .bind(alias)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        Ok(link)
    }

    async fn link_by_alias(&self, alias: &str) -> Result<Option<Link>> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            SELECT id, alias, target_url, redirect_status, is_active, expires_at, clicks,
                   created_by, created_at
            FROM links
            WHERE alias = ?
            "#,
        )
        .bind(alias)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(link)
    }

    async fn deactivate_link(&self, alias: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE links SET is_active = 0 WHERE alias = ?")
            .bind(alias)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reactivate_link(&self, alias: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE links SET is_active = 1 WHERE alias = ?")
            .bind(alias)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_clicks(&self, alias: &str, amount: u64) -> Result<()> {
        sqlx::query("UPDATE links SET clicks = clicks + ? WHERE alias = ?")
            .bind(amount as i64)
            .bind(alias)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn list_links(
        &self,
        limit: i64,
        offset: i64,
        created_by: Option<&str>,
    ) -> Result<Vec<Link>> {
        let links = if let Some(creator) = created_by {
            sqlx::query_as::<_, Link>(
                r#"
                SELECT id, alias, target_url, redirect_status, is_active, expires_at, clicks,
                       created_by, created_at
                FROM links
                WHERE created_by = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(creator)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool.as_ref())
            .await?
        } else {
            sqlx::query_as::<_, Link>(
                r#"
                SELECT id, alias, target_url, redirect_status, is_active, expires_at, clicks,
                       created_by, created_at
                FROM links
                ORDER BY created_at DESC, id DESC
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool.as_ref())
            .await?
        };

        Ok(links)
    }

    async fn record_event(
        &self,
        device: &NewDevice,
        event: &NewEvent,
        session_timeout_secs: i64,
    ) -> StorageResult<RecordOutcome> {
        match self.record_event_once(device, event, session_timeout_secs).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_unique_violation(&e) => {
                // Lost the race to open this device's session, the retry
                // finds the winner's session and reuses it.
                self.record_event_once(device, event, session_timeout_secs)
                    .await
                    .map_err(|e| StorageError::Other(e.into()))
            }
            Err(e) => Err(StorageError::Other(e.into())),
        }
    }

    async fn close_stale_sessions(&self, now: i64, timeout_secs: i64) -> Result<u64> {
        let cutoff = now - timeout_secs;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET ended_at = ?, duration_secs = ? - started_at
            WHERE ended_at IS NULL AND last_seen_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    async fn device_by_identity(
        &self,
        fingerprint: &str,
        client_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, fingerprint, NULLIF(client_id, '') AS client_id,
                   NULLIF(user_id, '') AS user_id, user_agent, browser, device_type,
                   screen_width, screen_height, device_memory, platform, timezone,
                   language, ip, created_at, last_seen_at
            FROM devices
            WHERE fingerprint = ? AND client_id = ? AND user_id = ?
            "#,
        )
        .bind(fingerprint)
        .bind(client_id.unwrap_or(""))
        .bind(user_id.unwrap_or(""))
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(device)
    }

    async fn devices_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, fingerprint, NULLIF(client_id, '') AS client_id,
                   NULLIF(user_id, '') AS user_id, user_agent, browser, device_type,
                   screen_width, screen_height, device_memory, platform, timezone,
                   language, ip, created_at, last_seen_at
            FROM devices
            WHERE fingerprint = ?
            ORDER BY id
            "#,
        )
        .bind(fingerprint)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(devices)
    }

    async fn open_session_for_device(&self, device_id: i64) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, device_id, user_id, started_at, last_seen_at, ended_at, duration_secs
            FROM sessions
            WHERE device_id = ? AND ended_at IS NULL
            "#,
        )
        .bind(device_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(session)
    }

    async fn sessions_for_device(&self, device_id: i64, limit: i64) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, device_id, user_id, started_at, last_seen_at, ended_at, duration_secs
            FROM sessions
            WHERE device_id = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(sessions)
    }

    async fn events_for_link(
        &self,
        link_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<EventRecord>> {
        let events = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, kind, link_id, device_id, session_id, user_id, occurred_at,
                   ip, user_agent, browser, os, device_type,
                   country_code, city, latitude, longitude,
                   referrer, referrer_domain,
                   utm_source, utm_medium, utm_campaign, utm_term, utm_content, page_url,
                   conversion_type, conversion_value
            FROM events
            WHERE link_id = ?
            ORDER BY occurred_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(link_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(events)
    }

    async fn link_event_stats(&self, link_id: i64) -> Result<LinkEventStats> {
        let stats = sqlx::query_as::<_, LinkEventStats>(
            r#"
            SELECT COUNT(*) AS events,
                   COUNT(DISTINCT device_id) AS devices,
                   COUNT(DISTINCT session_id) AS sessions
            FROM events
            WHERE link_id = ?
            "#,
        )
        .bind(link_id)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(stats)
    }
}
