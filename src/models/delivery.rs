//! Represents a file scheduled for delayed delivery to a recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of a scheduled delivery.
///
/// Transitions: `pending -> sent` (delivery succeeded or the recipient
/// opened the access link), `pending -> failed` (delivery attempt failed),
/// `failed -> sent` (explicit retry succeeded). `sent` is terminal and is
/// never re-entered.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    /// Parse the lowercase wire/query form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// A single scheduled delivery.
///
/// The row stores file metadata and routing information, not the file bytes.
/// Payloads live in the object store under `storage_ref`; the recipient
/// reaches them only through `access_token`, which is the sole credential
/// for unauthenticated access.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ScheduledDelivery {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owner who created the delivery. Immutable.
    pub owner_id: Uuid,

    /// Original filename of the uploaded file.
    pub file_name: String,

    /// Size in bytes.
    pub file_size: i64,

    /// Content type (MIME type), when the client supplied one.
    pub file_type: Option<String>,

    /// Opaque locator into the object store. Immutable.
    pub storage_ref: String,

    /// Destination email address. Mutable while `status == pending`.
    pub recipient: String,

    /// Target delivery instant, UTC. Mutable while `status == pending`.
    pub scheduled_at: DateTime<Utc>,

    /// Unguessable token generated at creation; unique across all records.
    pub access_token: String,

    /// Current lifecycle status.
    pub status: DeliveryStatus,

    /// Most recent delivery error, if any attempt failed.
    pub last_error: Option<String>,

    /// Timestamp when the record was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,

    /// When the delivery was confirmed sent.
    pub sent_at: Option<DateTime<Utc>>,
}
