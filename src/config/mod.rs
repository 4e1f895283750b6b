use serde::{Deserialize, Serialize};

use crate::models::RedirectMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api_server: ServerConfig,
    pub redirect_server: ServerConfig,
    pub cache: CacheConfig,
    pub analytics: AnalyticsConfig,
    pub auth: AuthConfig,
    pub fanout: FanoutConfig,
    /// Redirect status for links created without an explicit mode.
    #[serde(default)]
    pub default_redirect: RedirectMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub click_flush_interval_secs: u64,
}

/// How far to trust proxy-supplied client address headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Use the socket peer address only.
    None,
    /// Walk Forwarded / X-Forwarded-For.
    Standard,
    /// Cloudflare fronts the service, cf-connecting-ip wins.
    Cloudflare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    pub geoip_city_db_path: Option<String>,
    pub ip_anonymization: bool,
    pub trusted_proxy_mode: TrustedProxyMode,
    /// CIDR ranges (or bare addresses) considered proxy infrastructure.
    pub trusted_proxies: Vec<String>,
    /// Fixed proxy-hop count, takes precedence over trusted_proxies.
    pub num_trusted_proxies: Option<usize>,
    pub session_timeout_secs: i64,
    pub session_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    pub api_keys: Vec<String>,
    /// HS256 secret for resolving visitor bearer tokens to user ids.
    pub identity_jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            _ => DatabaseBackend::Sqlite,
        };

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./hoplink.db".to_string());
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()?;

        let api_host = std::env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let api_port = std::env::var("API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()?;

        let redirect_host =
            std::env::var("REDIRECT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let redirect_port = std::env::var("REDIRECT_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()?;

        let cache_max_entries = std::env::var("CACHE_MAX_ENTRIES")
            .unwrap_or_else(|_| "10000".to_string())
            .parse::<u64>()?;
        let click_flush_interval_secs = std::env::var("CLICK_FLUSH_INTERVAL_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()?;

        let analytics_enabled = std::env::var("ANALYTICS_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(true);
        let geoip_city_db_path = std::env::var("GEOIP_CITY_DB_PATH").ok();
        let ip_anonymization = std::env::var("IP_ANONYMIZATION")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let proxy_mode_str = std::env::var("TRUSTED_PROXY_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase();
        let trusted_proxy_mode = match proxy_mode_str.as_str() {
            "none" => TrustedProxyMode::None,
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let trusted_proxies = std::env::var("TRUSTED_PROXIES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let num_trusted_proxies = std::env::var("NUM_TRUSTED_PROXIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok());

        let session_timeout_secs = match std::env::var("SESSION_TIMEOUT_SECS") {
            Ok(v) => v.parse::<i64>()?,
            Err(_) => crate::analytics::DEFAULT_SESSION_TIMEOUT_SECS,
        };
        let session_sweep_interval_secs = std::env::var("SESSION_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()?;

        let auth_enabled = std::env::var("AUTH_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(true);
        let api_keys = std::env::var("API_KEYS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let identity_jwt_secret = std::env::var("IDENTITY_JWT_SECRET").ok();

        let webhook_url = std::env::var("WEBHOOK_URL").ok();
        let webhook_secret = std::env::var("WEBHOOK_SECRET").ok();
        let queue_capacity = std::env::var("FANOUT_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse::<usize>()?;

        let default_redirect_str = std::env::var("DEFAULT_REDIRECT")
            .unwrap_or_else(|_| "temporary".to_string())
            .to_lowercase();
        let default_redirect = match default_redirect_str.as_str() {
            "permanent" | "301" => RedirectMode::Permanent,
            "temporary" | "302" => RedirectMode::Temporary,
            other => {
                tracing::warn!(
                    "Unknown DEFAULT_REDIRECT '{other}', falling back to 'temporary'. Supported values: permanent, temporary"
                );
                RedirectMode::Temporary
            }
        };

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            redirect_server: ServerConfig {
                host: redirect_host,
                port: redirect_port,
            },
            cache: CacheConfig {
                max_entries: cache_max_entries,
                click_flush_interval_secs,
            },
            analytics: AnalyticsConfig {
                enabled: analytics_enabled,
                geoip_city_db_path,
                ip_anonymization,
                trusted_proxy_mode,
                trusted_proxies,
                num_trusted_proxies,
                session_timeout_secs,
                session_sweep_interval_secs,
            },
            auth: AuthConfig {
                enabled: auth_enabled,
                api_keys,
                identity_jwt_secret,
            },
            fanout: FanoutConfig {
                webhook_url,
                webhook_secret,
                queue_capacity,
            },
            default_redirect,
        })
    }
}
