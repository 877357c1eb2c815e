use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod testutil;

use services::{
    AppContext,
    clock::{Clock, SystemClock},
    dispatch::Dispatcher,
    mail::{MailTransport, SmtpMailer},
    object_store::ObjectStore,
    schedule_store::ScheduleStore,
    trigger::{TriggerCoordinator, spawn_change_listener, spawn_periodic},
};

/// Upper bound on a single outbound mail call.
const MAIL_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    // Config carries SMTP credentials and the signing key; log the shape,
    // not the values.
    tracing::info!(
        "Starting send-later on {} (storage: {}, db: {})",
        cfg.addr(),
        cfg.storage_dir,
        cfg.database_url
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx does not create the database file itself; touch it first
    match fs::OpenOptions::new().create(true).write(true).open(db_path) {
        Ok(_) => tracing::debug!("File can be created/opened successfully."),
        Err(e) => tracing::warn!("Failed to open file manually: {}", e),
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let store = Arc::new(ScheduleStore::new(db));
    let objects = Arc::new(ObjectStore::new(
        cfg.storage_dir.clone(),
        cfg.base_url.clone(),
        cfg.url_signing_key.clone().into_bytes(),
    ));
    let mailer: Arc<dyn MailTransport> = Arc::new(SmtpMailer::new(cfg.smtp.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        mailer.clone(),
        clock.clone(),
        cfg.base_url.clone(),
        cfg.link_ttl_secs,
        MAIL_TIMEOUT,
    ));
    let (trigger, wake_rx) = TriggerCoordinator::new(dispatcher, cfg.settle_delay());

    // --- Background dispatch: change-driven + periodic backstop ---
    spawn_change_listener(trigger.clone(), wake_rx);
    spawn_periodic(trigger.clone(), cfg.dispatch_interval());

    let ctx = AppContext {
        store,
        objects,
        trigger,
        clock,
        link_ttl_secs: cfg.link_ttl_secs,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(ctx);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run SQLite migrations manually from the embedded SQL file.
async fn run_migrations(db: &Arc<sqlx::Pool<sqlx::Sqlite>>) -> Result<()> {
    let path = "migrations/0001_init.sql";

    if !Path::new(path).exists() {
        anyhow::bail!("Migration file not found: {}", path);
    }

    let sql = fs::read_to_string(path)?;
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}
