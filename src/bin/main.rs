use std::path::PathBuf;

use anyhow::{Result, bail};
use authgate::auth::{CredentialStore, SubjectStore};
use authgate::types::{ApiKeyPrefix, Username};
use authgate::config::lifetime;
use authgate::{DatabaseConfig, Db, GatewayConfig, IdentityConfig};
use clap::{Parser, Subcommand};
use surrealdb::sql::Datetime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "authgate")]
#[command(about = "Authenticating API gateway and identity service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the authenticating gateway (stateless)
    Gateway {
        /// Bind address, overrides GATEWAY_BIND
        #[arg(long)]
        bind: Option<String>,
        /// JSON route table, overrides GATEWAY_ROUTES_FILE
        #[arg(long)]
        routes_file: Option<PathBuf>,
    },
    /// Run the identity service (login, sessions, API keys, verification)
    Identity {
        /// Bind address, overrides IDENTITY_BIND
        #[arg(long)]
        bind: Option<String>,
        #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
        db_url: String,
    },
    /// Initialize the database
    Init {
        #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
        db_url: String,
    },
    /// Create a new API key for an existing user
    CreateApiKey {
        /// Owner of the key
        #[arg(long)]
        username: String,
        /// Human-readable name for this key
        #[arg(long)]
        name: String,
        /// Number of days until the key expires (defaults to API_KEY_TTL_DAYS)
        #[arg(long)]
        expires_days: Option<u32>,
        #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
        db_url: String,
    },
    /// List a user's API keys
    ListApiKeys {
        #[arg(long)]
        username: String,
        #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
        db_url: String,
        /// Show only active keys
        #[arg(long, default_value_t = false)]
        active_only: bool,
    },
    /// Revoke an API key by its prefix
    RevokeApiKey {
        /// The key prefix to revoke (e.g., "sk_abc12345")
        key_prefix: String,
        #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
        db_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG, when set, replaces these defaults entirely
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("authgate=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gateway { bind, routes_file } => {
            let mut config = GatewayConfig::from_env()?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if routes_file.is_some() {
                config.routes_file = routes_file;
            }

            info!("Starting gateway on {}", config.bind);
            authgate::start_gateway(config).await?;
        }
        Commands::Identity { bind, db_url } => {
            let mut config = IdentityConfig::from_env()?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            let db_config = DatabaseConfig {
                url: db_url,
                ..Default::default()
            };

            info!("Starting identity service on {}", config.bind);
            authgate::start_identity(config, db_config).await?;
        }
        Commands::Init { db_url } => {
            info!("Using database url for initialization: {}", db_url);

            info!("Initializing database...");
            connect(db_url).await?;
            info!("Database initialized successfully");
        }
        Commands::CreateApiKey {
            username,
            name,
            expires_days,
            db_url,
        } => {
            let db = connect(db_url).await?;
            let subject = find_subject(&db, &username).await?;

            let ttl = match expires_days {
                Some(days) => lifetime("--expires-days", i64::from(days), chrono::Duration::try_days)?,
                None => IdentityConfig::from_env()?.api_key_ttl,
            };

            let issued = CredentialStore::new(db)
                .create_api_key(&subject, &name, ttl)
                .await?;
            let expires_at = display_time(&issued.record.expires_at);

            println!("API Key created successfully!");
            println!();
            println!("  Key:     {}", issued.key);
            println!("  Prefix:  {}", issued.record.key_prefix);
            println!("  Name:    {}", issued.record.name);
            println!("  Owner:   {}", username);
            println!("  Expires: {}", expires_at);
            println!();
            println!("IMPORTANT: Save this key now. It cannot be retrieved later.");
            println!("Use with: -H 'X-API-Key: {}'", issued.key);
        }
        Commands::ListApiKeys {
            username,
            db_url,
            active_only,
        } => {
            let db = connect(db_url).await?;
            let subject = find_subject(&db, &username).await?;

            let api_keys: Vec<_> = CredentialStore::new(db)
                .list_api_keys(&subject)
                .await?
                .into_iter()
                .filter(|key| !active_only || key.is_active)
                .collect();

            if api_keys.is_empty() {
                println!("No API keys found.");
                return Ok(());
            }

            println!(
                "{:<20} {:<20} {:<10} {:<25} {:<25}",
                "PREFIX", "NAME", "STATUS", "EXPIRES", "LAST USED"
            );
            println!("{}", "-".repeat(100));

            for key in api_keys {
                let status = if key.is_active { "Active" } else { "Revoked" };
                let last_used = key
                    .last_used_at
                    .as_ref()
                    .map(display_time)
                    .unwrap_or_else(|| "Never".to_string());

                println!(
                    "{:<20} {:<20} {:<10} {:<25} {:<25}",
                    key.key_prefix.as_str(),
                    key.name,
                    status,
                    display_time(&key.expires_at),
                    last_used
                );
            }
        }
        Commands::RevokeApiKey { key_prefix, db_url } => {
            let db = connect(db_url).await?;

            let revoked = CredentialStore::new(db)
                .revoke_api_key_by_prefix(&ApiKeyPrefix::new(key_prefix.clone()))
                .await?;

            if revoked {
                println!("API key '{}' has been revoked.", key_prefix);
            } else {
                println!("No API key found with prefix '{}'.", key_prefix);
            }
        }
    }

    Ok(())
}

/// Open the database and make sure the schema exists.
async fn connect(db_url: String) -> Result<Db> {
    let db_config = DatabaseConfig {
        url: db_url,
        ..Default::default()
    };
    let db = authgate::create_connection(db_config).await?;
    authgate::ensure_schema(&db).await?;
    Ok(db)
}

async fn find_subject(db: &Db, username: &str) -> Result<authgate::types::SubjectId> {
    match SubjectStore::new(db.clone())
        .get_by_username(&Username::new(username))
        .await?
    {
        Some(subject) => Ok(subject.subject_id),
        None => bail!("No user named '{}'", username),
    }
}

fn display_time(dt: &Datetime) -> String {
    chrono::DateTime::<chrono::Utc>::from(dt.clone())
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}
