//! src/services/access.rs
//!
//! Access resolution: turn an opaque token from a delivery email into a
//! live, time-bounded download link.

use crate::errors::DeliveryResult;
use crate::models::delivery::DeliveryStatus;
use crate::services::object_store::ObjectStore;
use crate::services::schedule_store::ScheduleStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// What a recipient gets back for a valid token.
#[derive(Serialize, Debug)]
pub struct AccessGrant {
    pub file_name: String,
    pub file_type: Option<String>,
    pub download_url: String,
}

/// Resolve `token` to a fresh signed download URL.
///
/// Unknown and malformed tokens fail identically (`NotFound`), so responses
/// carry no token-enumeration signal. A `pending` record is opportunistically
/// marked `sent` — link use is proof of delivery — but that bookkeeping
/// write is non-fatal: the recipient still gets their download URL if it
/// fails. The URL is minted fresh on every call and never persisted.
pub async fn resolve_by_token(
    store: &ScheduleStore,
    objects: &ObjectStore,
    token: &str,
    ttl_secs: u64,
    now: DateTime<Utc>,
) -> DeliveryResult<AccessGrant> {
    let record = store.get_by_token(token).await?;

    if record.status == DeliveryStatus::Pending {
        if let Err(err) = store.mark_accessed(record.id, now).await {
            warn!(
                "delivery {}: access-driven status write failed: {}",
                record.id, err
            );
        }
    }

    Ok(AccessGrant {
        file_name: record.file_name,
        file_type: record.file_type,
        download_url: objects.signed_url(&record.storage_ref, ttl_secs, now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeliveryError;
    use crate::testutil::{memory_pool, new_delivery};
    use chrono::Duration;
    use uuid::Uuid;

    fn objects(dir: &tempfile::TempDir) -> ObjectStore {
        ObjectStore::new(dir.path(), "http://localhost:3000", "test-signing-key")
    }

    #[tokio::test]
    async fn resolving_pending_record_grants_url_and_marks_sent() {
        let store = ScheduleStore::new(memory_pool().await);
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now + Duration::hours(1),
            ))
            .await
            .unwrap();

        let grant = resolve_by_token(&store, &objects(&dir), &record.access_token, 3600, now)
            .await
            .unwrap();
        assert_eq!(grant.file_name, record.file_name);
        assert!(grant.download_url.contains("/download/"));
        assert!(grant.download_url.contains("sig="));

        let current = store.get(record.id).await.unwrap();
        assert_eq!(current.status, DeliveryStatus::Sent);
        assert!(current.sent_at.is_some());
    }

    #[tokio::test]
    async fn resolving_sent_record_leaves_it_sent_and_mints_fresh_urls() {
        let store = ScheduleStore::new(memory_pool().await);
        let dir = tempfile::tempdir().unwrap();
        let objects = objects(&dir);
        let now = Utc::now();

        let record = store
            .insert(new_delivery(Uuid::new_v4(), "a@b.com", now))
            .await
            .unwrap();
        store.mark_sent(record.id, now).await.unwrap();

        let first = resolve_by_token(&store, &objects, &record.access_token, 3600, now)
            .await
            .unwrap();
        let later = resolve_by_token(
            &store,
            &objects,
            &record.access_token,
            3600,
            now + Duration::seconds(30),
        )
        .await
        .unwrap();

        // Each resolution signs anew; the expiry moves with the call.
        assert_ne!(first.download_url, later.download_url);
        assert_eq!(
            store.get(record.id).await.unwrap().status,
            DeliveryStatus::Sent
        );
    }

    #[tokio::test]
    async fn unknown_and_malformed_tokens_fail_identically() {
        let store = ScheduleStore::new(memory_pool().await);
        let dir = tempfile::tempdir().unwrap();
        let objects = objects(&dir);
        let now = Utc::now();

        let unknown = resolve_by_token(&store, &objects, &"f".repeat(64), 3600, now)
            .await
            .unwrap_err();
        let malformed = resolve_by_token(&store, &objects, "???", 3600, now)
            .await
            .unwrap_err();

        assert!(matches!(unknown, DeliveryError::NotFound(_)));
        assert_eq!(unknown.to_string(), malformed.to_string());
    }

    #[tokio::test]
    async fn failed_record_still_resolves_without_status_change() {
        let store = ScheduleStore::new(memory_pool().await);
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        let record = store
            .insert(new_delivery(Uuid::new_v4(), "a@b.com", now))
            .await
            .unwrap();
        store.mark_failed(record.id, "smtp down", now).await.unwrap();

        let grant = resolve_by_token(&store, &objects(&dir), &record.access_token, 3600, now)
            .await
            .unwrap();
        assert!(!grant.download_url.is_empty());
        assert_eq!(
            store.get(record.id).await.unwrap().status,
            DeliveryStatus::Failed
        );
    }
}
