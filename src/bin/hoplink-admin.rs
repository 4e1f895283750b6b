use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use hoplink::config::{Config, DatabaseBackend};
use hoplink::models::RedirectMode;
use hoplink::storage::{PostgresStorage, SqliteStorage, Storage, StorageError};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "hoplink-admin")]
#[command(about = "Hoplink admin management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a link
    CreateLink {
        /// Target URL (absolute http or https)
        url: String,
        /// Custom alias, generated when omitted
        #[arg(long)]
        alias: Option<String>,
        /// Redirect mode (permanent, temporary)
        #[arg(long, default_value = "temporary")]
        redirect: String,
        /// Expiry as epoch seconds
        #[arg(long)]
        expires_at: Option<i64>,
        /// Creator recorded on the link
        #[arg(long)]
        created_by: Option<String>,
    },
    /// List links, newest first
    ListLinks {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Deactivate a link
    Deactivate { alias: String },
    /// Reactivate a link
    Reactivate { alias: String },
    /// Show counter and event aggregates for a link
    Stats { alias: String },
    /// Close sessions whose inactivity window has elapsed
    SweepSessions,
}

fn random_alias() -> String {
    use rand::RngExt;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..7)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let storage: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => Arc::new(
            SqliteStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
        DatabaseBackend::Postgres => Arc::new(
            PostgresStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
    };

    // Ensure database is initialized
    storage.init().await?;

    match cli.command {
        Commands::CreateLink {
            url,
            alias,
            redirect,
            expires_at,
            created_by,
        } => {
            let mode = match redirect.to_lowercase().as_str() {
                "permanent" | "301" => RedirectMode::Permanent,
                _ => RedirectMode::Temporary,
            };
            let alias = alias.unwrap_or_else(random_alias);
            match storage
                .create_link(
                    &alias,
                    &url,
                    mode.status_i64(),
                    expires_at,
                    created_by.as_deref(),
                )
                .await
            {
                Ok(link) => println!("✓ Created link '{}' -> {}", link.alias, link.target_url),
                Err(StorageError::Conflict) => {
                    println!("⚠ Alias '{}' already exists", alias);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::ListLinks { limit, created_by } => {
            let links = storage.list_links(limit, 0, created_by.as_deref()).await?;
            if links.is_empty() {
                println!("No links found.");
            } else {
                println!("{:<22} {:<7} {:<8} {:<8} Target", "Alias", "Status", "Active", "Clicks");
                println!("{}", "-".repeat(80));
                for link in links {
                    println!(
                        "{:<22} {:<7} {:<8} {:<8} {}",
                        link.alias,
                        link.redirect_status,
                        link.is_active,
                        link.clicks,
                        link.target_url
                    );
                }
            }
        }
        Commands::Deactivate { alias } => {
            if storage.deactivate_link(&alias).await? {
                println!("✓ Deactivated link '{}'", alias);
            } else {
                println!("⚠ Link '{}' not found", alias);
            }
        }
        Commands::Reactivate { alias } => {
            if storage.reactivate_link(&alias).await? {
                println!("✓ Reactivated link '{}'", alias);
            } else {
                println!("⚠ Link '{}' not found", alias);
            }
        }
        Commands::Stats { alias } => match storage.link_by_alias(&alias).await? {
            Some(link) => {
                let stats = storage.link_event_stats(link.id).await?;
                println!("Link '{}' -> {}", link.alias, link.target_url);
                println!("  clicks counter: {}", link.clicks);
                println!("  recorded events: {}", stats.events);
                println!("  distinct devices: {}", stats.devices);
                println!("  distinct sessions: {}", stats.sessions);
            }
            None => println!("⚠ Link '{}' not found", alias),
        },
        Commands::SweepSessions => {
            let now = Utc::now().timestamp();
            let closed = storage
                .close_stale_sessions(now, config.analytics.session_timeout_secs)
                .await?;
            println!("✓ Closed {} stale session(s)", closed);
        }
    }

    Ok(())
}
