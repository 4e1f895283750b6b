use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hoplink::analytics::session::spawn_session_sweeper;
use hoplink::analytics::GeoIpService;
use hoplink::api::{self, AppState};
use hoplink::auth::{AuthService, IdentityResolver};
use hoplink::config::{Config, DatabaseBackend};
use hoplink::fanout::{spawn_fanout, LogNotifier, Notifier, WebhookNotifier};
use hoplink::redirect::{self, RedirectState};
use hoplink::storage::{CachedStorage, PostgresStorage, SqliteStorage, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    // Initialize storage
    let backend: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.database.url);
            Arc::new(SqliteStorage::new(&config.database.url, config.database.max_connections).await?)
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL storage: {}", config.database.url);
            Arc::new(
                PostgresStorage::new(&config.database.url, config.database.max_connections).await?,
            )
        }
    };

    info!("Initializing database...");
    backend.init().await?;
    info!("Database initialized successfully");

    let cached = Arc::new(CachedStorage::new(
        backend,
        config.cache.max_entries,
        config.cache.click_flush_interval_secs,
    ));
    let storage: Arc<dyn Storage> = Arc::clone(&cached) as Arc<dyn Storage>;

    // Shared shutdown signal for the background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Auth and identity
    let auth_service = Arc::new(AuthService::new(
        config.auth.enabled,
        config.auth.api_keys.clone(),
    ));
    if config.auth.enabled && !config.auth.api_keys.is_empty() {
        info!("🔐 API key authentication enabled");
    } else {
        info!("🔓 Authentication is disabled - all API requests are allowed");
    }
    let identity = Arc::new(IdentityResolver::new(
        config.auth.identity_jwt_secret.as_deref(),
    ));

    // GeoIP
    let geoip = GeoIpService::new(config.analytics.geoip_city_db_path.as_deref())?;
    if config.analytics.geoip_city_db_path.is_some() {
        info!("🌍 GeoIP city database loaded");
    }

    // Event fan-out
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = config.fanout.webhook_url.clone() {
        info!("📣 Webhook fan-out enabled: {}", url);
        notifiers.push(Arc::new(WebhookNotifier::new(
            url,
            config.fanout.webhook_secret.clone(),
        )?));
    }
    let (fanout, fanout_task) = spawn_fanout(
        notifiers,
        config.fanout.queue_capacity,
        shutdown_rx.clone(),
    );

    // Session sweeper closes windows left open by idle devices
    let sweeper_task = spawn_session_sweeper(
        Arc::clone(&storage),
        config.analytics.session_timeout_secs,
        config.analytics.session_sweep_interval_secs,
        shutdown_rx,
    );

    // Create routers
    let api_state = Arc::new(AppState {
        storage: Arc::clone(&storage),
        default_redirect: config.default_redirect,
    });
    let api_router = api::create_api_router(api_state, auth_service);

    let redirect_state = Arc::new(RedirectState {
        storage: Arc::clone(&storage),
        geoip,
        fanout,
        identity,
        analytics: config.analytics.clone(),
    });
    let redirect_router = redirect::create_redirect_router(redirect_state);

    // Start API server
    let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("🚀 API server listening on http://{}", api_addr);

    // Start redirect server
    let redirect_addr = format!(
        "{}:{}",
        config.redirect_server.host, config.redirect_server.port
    );
    let redirect_listener = tokio::net::TcpListener::bind(&redirect_addr).await?;
    info!("🚀 Redirect server listening on http://{}", redirect_addr);

    // Run both servers until one fails or a shutdown signal arrives
    let servers = async {
        tokio::try_join!(
            axum::serve(api_listener, api_router),
            axum::serve(
                redirect_listener,
                redirect_router.into_make_service_with_connect_info::<SocketAddr>(),
            ),
        )
    };

    tokio::select! {
        result = servers => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Stop background tasks, flush buffered clicks, drain the fan-out queue
    let _ = shutdown_tx.send(true);
    cached.shutdown();
    let _ = tokio::join!(fanout_task, sweeper_task);

    Ok(())
}
