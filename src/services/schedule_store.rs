//! src/services/schedule_store.rs
//!
//! ScheduleStore — durable record of scheduled deliveries backed by SQLite.
//! Holds metadata and routing state only; file payloads live in the object
//! store. Status transitions are guarded conditional updates so that
//! overlapping dispatch runs can never move a record backwards: writing
//! `sent` twice is a no-op, and a stale run can never clobber a fresh
//! `sent` with `failed`.

use crate::errors::{DeliveryError, DeliveryResult};
use crate::models::delivery::{DeliveryStatus, ScheduledDelivery};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Fields required to create a new scheduled delivery. Everything else
/// (id, token, status, timestamps) is store-assigned.
#[derive(Clone, Debug)]
pub struct NewDelivery {
    pub owner_id: Uuid,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: Option<String>,
    pub storage_ref: String,
    pub recipient: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Mutable fields of a pending delivery.
#[derive(Clone, Debug, Default)]
pub struct ScheduleUpdate {
    pub recipient: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

const SELECT_COLUMNS: &str = "id, owner_id, file_name, file_size, file_type, storage_ref, \
     recipient, scheduled_at, access_token, status, last_error, \
     created_at, updated_at, sent_at";

#[derive(Clone)]
pub struct ScheduleStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl ScheduleStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a new delivery with `status = pending` and a fresh access
    /// token. Retries token generation on the (vanishingly unlikely) unique
    /// collision so a token is never reused across records.
    pub async fn insert(&self, new: NewDelivery) -> DeliveryResult<ScheduledDelivery> {
        let now = Utc::now();
        for _ in 0..3 {
            let token = generate_access_token();
            let result = sqlx::query_as::<_, ScheduledDelivery>(&format!(
                "INSERT INTO scheduled_deliveries (
                    id, owner_id, file_name, file_size, file_type, storage_ref,
                    recipient, scheduled_at, access_token, status, last_error,
                    created_at, updated_at, sent_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, ?, ?, NULL)
                RETURNING {SELECT_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(new.owner_id)
            .bind(&new.file_name)
            .bind(new.file_size)
            .bind(new.file_type.clone())
            .bind(&new.storage_ref)
            .bind(&new.recipient)
            .bind(new.scheduled_at)
            .bind(&token)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await;

            match result {
                Ok(record) => return Ok(record),
                Err(err) if is_unique_violation(&err) => continue,
                Err(err) => return Err(DeliveryError::Sqlx(err)),
            }
        }
        Err(DeliveryError::Unknown(
            "could not allocate a unique access token".into(),
        ))
    }

    /// Fetch a delivery by id.
    pub async fn get(&self, id: Uuid) -> DeliveryResult<ScheduledDelivery> {
        sqlx::query_as::<_, ScheduledDelivery>(&format!(
            "SELECT {SELECT_COLUMNS} FROM scheduled_deliveries WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => {
                DeliveryError::NotFound(format!("delivery `{}` not found", id))
            }
            other => DeliveryError::Sqlx(other),
        })
    }

    /// Look up the unique record holding `token`.
    ///
    /// Unknown and malformed tokens fail identically, so the response gives
    /// no token-enumeration signal.
    pub async fn get_by_token(&self, token: &str) -> DeliveryResult<ScheduledDelivery> {
        sqlx::query_as::<_, ScheduledDelivery>(&format!(
            "SELECT {SELECT_COLUMNS} FROM scheduled_deliveries WHERE access_token = ?"
        ))
        .bind(token)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => DeliveryError::NotFound("unknown access token".into()),
            other => DeliveryError::Sqlx(other),
        })
    }

    /// All deliveries belonging to `owner_id`, newest first.
    pub async fn list_by_owner(&self, owner_id: Uuid) -> DeliveryResult<Vec<ScheduledDelivery>> {
        let rows = sqlx::query_as::<_, ScheduledDelivery>(&format!(
            "SELECT {SELECT_COLUMNS} FROM scheduled_deliveries
             WHERE owner_id = ? ORDER BY created_at DESC, id DESC"
        ))
        .bind(owner_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Records eligible for a dispatch run: `pending` and due at `now`.
    ///
    /// `failed` records are deliberately excluded; they only become eligible
    /// again through an explicit [`reset_to_pending`](Self::reset_to_pending).
    pub async fn list_due(&self, now: DateTime<Utc>) -> DeliveryResult<Vec<ScheduledDelivery>> {
        let rows = sqlx::query_as::<_, ScheduledDelivery>(&format!(
            "SELECT {SELECT_COLUMNS} FROM scheduled_deliveries
             WHERE status = 'pending' AND scheduled_at <= ?
             ORDER BY scheduled_at ASC"
        ))
        .bind(now)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Update recipient and/or scheduled time, permitted only while the
    /// record is still `pending`.
    pub async fn update_schedule(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
    ) -> DeliveryResult<ScheduledDelivery> {
        let current = self.get(id).await?;
        if current.status != DeliveryStatus::Pending {
            return Err(DeliveryError::PreconditionFailed);
        }

        let recipient = update.recipient.unwrap_or(current.recipient);
        let scheduled_at = update.scheduled_at.unwrap_or(current.scheduled_at);

        let result = sqlx::query(
            "UPDATE scheduled_deliveries
             SET recipient = ?, scheduled_at = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&recipient)
        .bind(scheduled_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            // The record advanced between our read and the write.
            return Err(DeliveryError::PreconditionFailed);
        }
        self.get(id).await
    }

    /// Guarded `-> sent` transition used by the dispatcher.
    ///
    /// Matches `pending` and `failed` rows only, so a slow duplicate run can
    /// never regress a record and marking `sent` twice is harmless. Returns
    /// `false` when the conditional update matched zero rows (another runner
    /// already advanced the record) — callers treat that as success.
    pub async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> DeliveryResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_deliveries
             SET status = 'sent', sent_at = ?, last_error = NULL, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'failed')",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lazy `pending -> sent` transition taken when a recipient uses the
    /// access link. Narrower guard than [`mark_sent`](Self::mark_sent): link
    /// use proves delivery only for records still awaiting it.
    pub async fn mark_accessed(&self, id: Uuid, now: DateTime<Utc>) -> DeliveryResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_deliveries
             SET status = 'sent', sent_at = ?, last_error = NULL, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Guarded `pending -> failed` transition with the failure reason.
    ///
    /// Only `pending` rows match: once a record is `sent` no delivery error
    /// may overwrite it, and repeated failure of a `failed` record is a
    /// no-op.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> DeliveryResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_deliveries
             SET status = 'failed', last_error = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Explicit owner-driven retry: move a `failed` record back to
    /// `pending` so the next dispatch run reconsiders it.
    pub async fn reset_to_pending(&self, id: Uuid) -> DeliveryResult<ScheduledDelivery> {
        // Existence check first so an unknown id reports NotFound rather
        // than a precondition failure.
        self.get(id).await?;

        let result = sqlx::query(
            "UPDATE scheduled_deliveries
             SET status = 'pending', last_error = NULL, updated_at = ?
             WHERE id = ? AND status = 'failed'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeliveryError::PreconditionFailed);
        }
        self.get(id).await
    }

    /// Remove a delivery record, returning it so the caller can release the
    /// backing object.
    pub async fn delete(&self, id: Uuid) -> DeliveryResult<ScheduledDelivery> {
        let record = self.get(id).await?;
        sqlx::query("DELETE FROM scheduled_deliveries WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(record)
    }
}

/// 32 random bytes, hex-encoded: the sole credential for unauthenticated
/// recipient access, so it must be unguessable.
fn generate_access_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
