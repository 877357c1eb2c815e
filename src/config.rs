use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::time::Duration;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,

    /// Public base URL used when composing access links sent by email.
    pub base_url: String,

    /// Secret key for signing time-limited download URLs.
    pub url_signing_key: String,

    /// Validity window of a signed download URL, in seconds.
    pub link_ttl_secs: u64,

    /// Interval between periodic dispatch runs, in seconds.
    pub dispatch_interval_secs: u64,

    /// Delay before re-querying after a change notification or a productive
    /// run, letting storage consistency settle.
    pub settle_delay_ms: u64,

    pub smtp: SmtpConfig,
}

/// Outbound SMTP settings. When `host` is empty the mail transport reports
/// a missing-credential rejection instead of attempting a connection.
#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Scheduled file delivery service")]
pub struct Args {
    /// Host to bind to (overrides SEND_LATER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SEND_LATER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded files are stored (overrides SEND_LATER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SEND_LATER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for access links (overrides SEND_LATER_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("SEND_LATER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env_u16("SEND_LATER_PORT", 3000)?;
        let env_storage =
            env::var("SEND_LATER_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_db = env::var("SEND_LATER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/send_later.db".into());
        let env_base_url =
            env::var("SEND_LATER_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".into());

        let url_signing_key = env::var("SEND_LATER_URL_SIGNING_KEY")
            .unwrap_or_else(|_| "insecure-dev-signing-key".into());
        let link_ttl_secs = parse_env_u64("SEND_LATER_LINK_TTL_SECS", 86_400)?;
        let dispatch_interval_secs = parse_env_u64("SEND_LATER_DISPATCH_INTERVAL_SECS", 30)?;
        let settle_delay_ms = parse_env_u64("SEND_LATER_SETTLE_DELAY_MS", 1_000)?;

        let smtp = SmtpConfig {
            host: env::var("SEND_LATER_SMTP_HOST").unwrap_or_default(),
            port: parse_env_u16("SEND_LATER_SMTP_PORT", 587)?,
            username: env::var("SEND_LATER_SMTP_USERNAME").unwrap_or_default(),
            password: env::var("SEND_LATER_SMTP_PASSWORD").unwrap_or_default(),
            from: env::var("SEND_LATER_SMTP_FROM").unwrap_or_default(),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            base_url: args
                .base_url
                .unwrap_or(env_base_url)
                .trim_end_matches('/')
                .to_string(),
            url_signing_key,
            link_ttl_secs,
            dispatch_interval_secs,
            settle_delay_ms,
            smtp,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }
}

fn parse_env_u16(key: &str, default: u16) -> Result<u16> {
    match env::var(key) {
        Ok(value) => value
            .parse::<u16>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {}", key)),
    }
}

fn parse_env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {}", key)),
    }
}
