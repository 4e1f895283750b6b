use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A device row keyed by (fingerprint, client id, user id). The anonymous
/// marker for the two optional keys is the empty string at the storage layer,
/// surfaced here as `None`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: i64,
    pub fingerprint: String,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub browser: Option<String>,
    pub device_type: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub device_memory: Option<f64>,
    pub platform: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub ip: Option<String>,
    pub created_at: i64,
    pub last_seen_at: i64,
}

impl Device {
    /// Stable identifier reported to callers: the client-provided device id
    /// when one exists, the fingerprint otherwise.
    pub fn device_key(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.fingerprint)
    }
}

/// Profile captured from one request, used to create or refresh a device row.
#[derive(Debug, Clone, Default)]
pub struct NewDevice {
    pub fingerprint: String,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub browser: Option<String>,
    pub device_type: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub device_memory: Option<f64>,
    pub platform: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub ip: Option<String>,
}

impl NewDevice {
    pub fn device_key(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.fingerprint)
    }
}
