#![allow(dead_code)]
//! src/services/sync.rs
//!
//! Client-side view reconciliation. A `DeliveryView` mirrors one owner's
//! deliveries and refreshes by re-fetching the full set from the store —
//! change notifications and batch results are treated purely as "re-query
//! now" signals, never as authoritative data, since pushed payloads can be
//! stale relative to a concurrent dispatch write.
//!
//! Filtering is a pure function over the fetched set: same inputs, same
//! output, no external effects.

use crate::errors::DeliveryResult;
use crate::models::delivery::{DeliveryStatus, ScheduledDelivery};
use crate::services::schedule_store::ScheduleStore;
use crate::services::trigger::TriggerCoordinator;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Tab selection in the owner's delivery listing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ViewTab {
    /// Everything.
    All,
    /// Still waiting to go out.
    Upcoming,
    /// Already resolved, one way or the other.
    History,
}

/// One owner's reconciled view of their scheduled deliveries.
pub struct DeliveryView {
    store: Arc<ScheduleStore>,
    owner_id: Uuid,
    deliveries: RwLock<Vec<ScheduledDelivery>>,
}

impl DeliveryView {
    pub fn new(store: Arc<ScheduleStore>, owner_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            store,
            owner_id,
            deliveries: RwLock::new(Vec::new()),
        })
    }

    /// Re-fetch the owner's full delivery set and replace local state
    /// wholesale. No incremental patching.
    pub async fn refresh(&self) -> DeliveryResult<()> {
        let fresh = self.store.list_by_owner(self.owner_id).await?;
        *self.deliveries.write().await = fresh;
        Ok(())
    }

    /// Current local copy of the delivery set.
    pub async fn snapshot(&self) -> Vec<ScheduledDelivery> {
        self.deliveries.read().await.clone()
    }

    /// Re-fetch whenever the coordinator finishes a run. The batch result
    /// itself is ignored; only its arrival matters.
    pub async fn follow(self: &Arc<Self>, coordinator: &TriggerCoordinator) {
        let view = Arc::clone(self);
        coordinator
            .subscribe(Box::new(move |_batch| {
                let view = Arc::clone(&view);
                tokio::spawn(async move {
                    if let Err(err) = view.refresh().await {
                        warn!("delivery view refresh failed: {}", err);
                    }
                });
            }))
            .await;
    }
}

/// Filter a delivery set for display.
///
/// Derivable from `(deliveries, query, statuses, tab)` alone. The status
/// set and the free-text query (matched case-insensitively against file
/// name and recipient) both narrow the tab's selection; an empty status
/// set means "any status".
pub fn filter_deliveries(
    deliveries: &[ScheduledDelivery],
    query: &str,
    statuses: &[DeliveryStatus],
    tab: ViewTab,
) -> Vec<ScheduledDelivery> {
    let needle = query.trim().to_lowercase();
    deliveries
        .iter()
        .filter(|d| match tab {
            ViewTab::All => true,
            ViewTab::Upcoming => d.status == DeliveryStatus::Pending,
            ViewTab::History => d.status != DeliveryStatus::Pending,
        })
        .filter(|d| statuses.is_empty() || statuses.contains(&d.status))
        .filter(|d| {
            needle.is_empty()
                || d.file_name.to_lowercase().contains(&needle)
                || d.recipient.to_lowercase().contains(&needle)
        })
        .cloned()
        .collect()
}
