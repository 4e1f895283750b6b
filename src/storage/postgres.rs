use crate::analytics::session::{self, SessionVerdict};
use crate::models::{Device, EventRecord, Link, NewDevice, NewEvent, RecordOutcome, Session};
use crate::storage::trait_def::is_unique_violation;
use crate::storage::{LinkEventStats, Storage, StorageError, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;

pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Bounded statement time so a stuck analytics write cannot hold a
        // connection indefinitely.
        let options = PgConnectOptions::from_str(database_url)?
            .options([("statement_timeout", "5s")]);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

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

        let device_row = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (fingerprint, client_id, user_id, user_agent, browser,
                                 device_type, screen_width, screen_height, device_memory,
                                 platform, timezone, language, ip, created_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
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
            RETURNING id, fingerprint, NULLIF(client_id, '') AS client_id,
                      NULLIF(user_id, '') AS user_id, user_agent, browser, device_type,
                      screen_width, screen_height, device_memory, platform, timezone,
                      language, ip, created_at, last_seen_at
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
        .fetch_one(&mut *tx)
        .await?;

        // Lock the open session row so same-device writers serialize.
        let open = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, device_id, user_id, started_at, last_seen_at, ended_at, duration_secs
            FROM sessions
            WHERE device_id = $1 AND ended_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(device_row.id)
        .fetch_optional(&mut *tx)
        .await?;

        let verdict = session::assess(open.as_ref(), now, session_timeout_secs);
        let (session_id, new_session) = match (verdict, open) {
            (SessionVerdict::Reuse, Some(current)) => {
                sqlx::query("UPDATE sessions SET last_seen_at = $1 WHERE id = $2")
                    .bind(now)
                    .bind(&current.id)
                    .execute(&mut *tx)
                    .await?;
                (current.id, false)
            }
            (SessionVerdict::Rotate, Some(current)) => {
                sqlx::query(
                    r#"
                    UPDATE sessions
                    SET ended_at = $1, duration_secs = $1 - started_at
                    WHERE id = $2
                    "#,
                )
                .bind(now)
                .bind(&current.id)
                .execute(&mut *tx)
                .await?;
                (insert_session(&mut tx, device_row.id, event, now).await?, true)
            }
            _ => (insert_session(&mut tx, device_row.id, event, now).await?, true),
        };

        let event_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO events (kind, link_id, device_id, session_id, user_id, occurred_at,
                                ip, user_agent, browser, os, device_type,
                                country_code, city, latitude, longitude,
                                referrer, referrer_domain,
                                utm_source, utm_medium, utm_campaign, utm_term, utm_content,
                                page_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23)
            RETURNING id
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
        .fetch_one(&mut *tx)
        .await?;

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
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    device_id: i64,
    event: &NewEvent,
    now: i64,
) -> Result<String, sqlx::Error> {
    let id = session::new_session_id();
    sqlx::query(
        r#"
        INSERT INTO sessions (id, device_id, user_id, started_at, last_seen_at)
        VALUES ($1, $2, $3, $4, $5)
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
impl Storage for PostgresStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                id BIGSERIAL PRIMARY KEY,
                alias TEXT NOT NULL UNIQUE,
                target_url TEXT NOT NULL,
                redirect_status BIGINT NOT NULL DEFAULT 302,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                expires_at BIGINT,
                clicks BIGINT NOT NULL DEFAULT 0,
                created_by TEXT,
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_alias ON links(alias)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id BIGSERIAL PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                client_id TEXT NOT NULL DEFAULT '',
                user_id TEXT NOT NULL DEFAULT '',
                user_agent TEXT,
                browser TEXT,
                device_type TEXT,
                screen_width BIGINT,
                screen_height BIGINT,
                device_memory DOUBLE PRECISION,
                platform TEXT,
                timezone TEXT,
                language TEXT,
                ip TEXT,
                created_at BIGINT NOT NULL,
                last_seen_at BIGINT NOT NULL,
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
                device_id BIGINT NOT NULL REFERENCES devices(id),
                user_id TEXT,
                started_at BIGINT NOT NULL,
                last_seen_at BIGINT NOT NULL,
                ended_at BIGINT,
                duration_secs BIGINT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

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
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                link_id BIGINT REFERENCES links(id),
                device_id BIGINT REFERENCES devices(id),
                session_id TEXT REFERENCES sessions(id),
                user_id TEXT,
                occurred_at BIGINT NOT NULL,
                ip TEXT,
                user_agent TEXT,
                browser TEXT,
                os TEXT,
                device_type TEXT,
                country_code TEXT,
                city TEXT,
                latitude DOUBLE PRECISION,
                longitude DOUBLE PRECISION,
                referrer TEXT,
                referrer_domain TEXT,
                utm_source TEXT,
                utm_medium TEXT,
                utm_campaign TEXT,
                utm_term TEXT,
                utm_content TEXT,
                page_url TEXT,
                conversion_type TEXT,
                conversion_value DOUBLE PRECISION
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

        let link = sqlx::query_as::<_, Link>(
            r#"
            INSERT INTO links (alias, target_url, redirect_status, is_active, expires_at,
                               created_by, created_at)
            VALUES ($1, $2, $3, TRUE, $4, $5, $6)
            ON CONFLICT (alias) DO NOTHING
            RETURNING id, alias, target_url, redirect_status, is_active, expires_at, clicks,
                      created_by, created_at
            "#,
        )
        .bind(alias)
        .bind(target_url)
        .bind(redirect_status)
        .bind(expires_at)
        .bind(created_by)
        .bind(created_at)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        link.ok_or(StorageError::Conflict)
    }

    async fn link_by_alias(&self, alias: &str) -> Result<Option<Link>> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            SELECT id, alias, target_url, redirect_status, is_active, expires_at, clicks,
                   created_by, created_at
            FROM links
            WHERE alias = $1
            "#,
        )
        .bind(alias)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(link)
    }

    async fn deactivate_link(&self, alias: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE links SET is_active = FALSE WHERE alias = $1")
            .bind(alias)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reactivate_link(&self, alias: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE links SET is_active = TRUE WHERE alias = $1")
            .bind(alias)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_clicks(&self, alias: &str, amount: u64) -> Result<()> {
        sqlx::query("UPDATE links SET clicks = clicks + $1 WHERE alias = $2")
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
                WHERE created_by = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2 OFFSET $3
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
                LIMIT $1 OFFSET $2
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
            SET ended_at = $1, duration_secs = $1 - started_at
            WHERE ended_at IS NULL AND last_seen_at <= $2
            "#,
        )
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
            WHERE fingerprint = $1 AND client_id = $2 AND user_id = $3
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
            WHERE fingerprint = $1
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
            WHERE device_id = $1 AND ended_at IS NULL
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
            WHERE device_id = $1
            ORDER BY started_at DESC
            LIMIT $2
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
            WHERE link_id = $1
            ORDER BY occurred_at DESC, id DESC
            LIMIT $2 OFFSET $3
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
            WHERE link_id = $1
            "#,
        )
        .bind(link_id)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(stats)
    }
}
