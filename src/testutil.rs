//! Shared test fixtures: in-memory stores and a recording mail double.

use crate::services::mail::{MailError, MailTransport, looks_like_email};
use crate::services::schedule_store::NewDelivery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fresh in-memory SQLite pool with the schema applied. A single connection
/// keeps every handle on the same database.
pub(crate) async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    let sql = include_str!("../migrations/0001_init.sql");
    for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(&pool).await.expect("migration");
    }
    Arc::new(pool)
}

pub(crate) fn new_delivery(
    owner_id: Uuid,
    recipient: &str,
    scheduled_at: DateTime<Utc>,
) -> NewDelivery {
    NewDelivery {
        owner_id,
        file_name: "report.pdf".into(),
        file_size: 1024,
        file_type: Some("application/pdf".into()),
        storage_ref: format!("{}/report.pdf", Uuid::new_v4()),
        recipient: recipient.into(),
        scheduled_at,
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SentMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Recording mail transport. Rejects recipients that do not look like an
/// email address, mirroring the SMTP mailer's pre-send mailbox parse.
#[derive(Default)]
pub(crate) struct MockMailer {
    sent: Mutex<Vec<SentMail>>,
    calls: AtomicUsize,
    fail_all: bool,
    delay: Option<Duration>,
}

impl MockMailer {
    /// Every send fails with a transport error.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Every send sleeps before completing.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }

    /// Total send invocations, including rejected ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for MockMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), MailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !looks_like_email(to) {
            return Err(MailError::InvalidRecipient(to.to_string()));
        }
        if self.fail_all {
            return Err(MailError::Transport("simulated outage".into()));
        }
        self.sent.lock().await.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}
