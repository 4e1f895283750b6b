use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Redirect policy for a link, controls the HTTP status of the redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    Permanent,
    #[default]
    Temporary,
}

impl RedirectMode {
    pub fn status(&self) -> StatusCode {
        match self {
            RedirectMode::Permanent => StatusCode::MOVED_PERMANENTLY,
            RedirectMode::Temporary => StatusCode::FOUND,
        }
    }

    pub fn status_i64(&self) -> i64 {
        self.status().as_u16() as i64
    }

    pub fn from_status(status: i64) -> Option<Self> {
        match status {
            301 => Some(RedirectMode::Permanent),
            302 => Some(RedirectMode::Temporary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Link {
    pub id: i64,
    pub alias: String,
    pub target_url: String,
    /// HTTP status used for the redirect, 301 or 302.
    pub redirect_status: i64,
    pub is_active: bool,
    pub expires_at: Option<i64>,
    pub clicks: i64,
    pub created_by: Option<String>,
    pub created_at: i64,
}

impl Link {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    /// A link resolves only while it is active and not past its expiry.
    pub fn is_resolvable(&self, now: i64) -> bool {
        self.is_active && !self.is_expired(now)
    }

    pub fn redirect_mode(&self) -> RedirectMode {
        RedirectMode::from_status(self.redirect_status).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub url: String,
    pub alias: Option<String>,
    #[serde(default)]
    pub redirect: Option<RedirectMode>,
    pub expires_at: Option<i64>,
    pub created_by: Option<String>,
}
