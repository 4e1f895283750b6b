use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A redirect through a short link.
    Click,
    /// A page view reported by the tracking endpoint.
    Visit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Click => "click",
            EventKind::Visit => "visit",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl GeoLocation {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none()
            && self.city.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

/// Enriched event handed to storage. Session and device resolution happen
/// there, inside one transaction.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: EventKind,
    pub link_id: Option<i64>,
    pub occurred_at: i64,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub geo: GeoLocation,
    pub referrer: Option<String>,
    pub referrer_domain: Option<String>,
    pub utm: UtmParams,
    pub page_url: Option<String>,
}

/// Persisted event row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub kind: String,
    pub link_id: Option<i64>,
    pub device_id: Option<i64>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub occurred_at: i64,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub referrer: Option<String>,
    pub referrer_domain: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub page_url: Option<String>,
    /// Conversion metadata is attached by other subsystems after the fact,
    /// this core only ever writes NULL here.
    pub conversion_type: Option<String>,
    pub conversion_value: Option<f64>,
}

/// What a recorded event resolved to: the ids a tracking response reports
/// back to the client.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub event_id: i64,
    pub device_id: i64,
    pub device_key: String,
    pub session_id: String,
    /// True when this event opened a fresh session rather than reusing one.
    pub new_session: bool,
}
