//! src/services/trigger.rs
//!
//! TriggerCoordinator — the single idempotent "run dispatch now" entry
//! point. Three callers feed it: direct user action (manual run, or a
//! schedule/reschedule that is already due), change notifications from the
//! store (debounced through a settle delay), and a periodic interval timer
//! as a backstop against missed notifications.
//!
//! Concurrent and repeated calls are safe: there is no run-level lock, and
//! the store's guarded conditional updates keep overlapping runs from
//! regressing any record.

use crate::errors::DeliveryResult;
use crate::models::batch::BatchResult;
use crate::services::dispatch::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Observer invoked with the outcome of every dispatch run.
pub type BatchObserver = Box<dyn Fn(&BatchResult) + Send + Sync>;

pub struct TriggerCoordinator {
    dispatcher: Arc<Dispatcher>,

    /// Delay before re-querying after a change notification or a productive
    /// run, letting storage consistency settle.
    settle_delay: Duration,

    /// Wake-up signals from change notifications. Payloads are never
    /// trusted; a signal only means "re-query soon".
    wake_tx: mpsc::UnboundedSender<()>,

    observers: RwLock<Vec<BatchObserver>>,
}

impl TriggerCoordinator {
    /// Build the coordinator plus the receiving end of its wake-up channel.
    /// Pass the receiver to [`spawn_change_listener`].
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        settle_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                dispatcher,
                settle_delay,
                wake_tx,
                observers: RwLock::new(Vec::new()),
            }),
            wake_rx,
        )
    }

    /// Register an observer called after every run, including follow-up
    /// re-checks. Observers re-query state themselves; the result is a
    /// signal, not authoritative data.
    pub async fn subscribe(&self, observer: BatchObserver) {
        self.observers.write().await.push(observer);
    }

    /// Run a dispatch batch now and report its aggregate outcome.
    ///
    /// If the run did work, one follow-up re-check fires after the settle
    /// delay to catch records that became due during processing. The
    /// follow-up itself does not chain further re-checks.
    pub async fn run_now(self: &Arc<Self>) -> DeliveryResult<BatchResult> {
        let result = self.run_once().await?;

        if result.did_work() {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(coordinator.settle_delay).await;
                if let Err(err) = coordinator.run_once().await {
                    warn!("follow-up dispatch re-check failed: {}", err);
                }
            });
        }

        Ok(result)
    }

    /// Signal that some other process altered the store. Coalesced with any
    /// other signals arriving within the same settle window.
    pub fn notify_change(&self) {
        if self.wake_tx.send(()).is_err() {
            warn!("change listener is gone; wake-up dropped");
        }
    }

    /// One dispatch run plus observer notification, with no re-check.
    async fn run_once(&self) -> DeliveryResult<BatchResult> {
        let result = self.dispatcher.run().await?;

        if result.did_work() {
            info!(
                "dispatch run: {} processed, {} sent, {} failed",
                result.processed, result.success, result.failed
            );
        } else {
            debug!("dispatch run: nothing due");
        }

        for observer in self.observers.read().await.iter() {
            observer(&result);
        }
        Ok(result)
    }
}

/// Drain change wake-ups: wait for a signal, let consistency settle, fold
/// any further signals from the same window into one run.
pub fn spawn_change_listener(
    coordinator: Arc<TriggerCoordinator>,
    mut wake_rx: mpsc::UnboundedReceiver<()>,
) {
    tokio::spawn(async move {
        while wake_rx.recv().await.is_some() {
            tokio::time::sleep(coordinator.settle_delay).await;
            while wake_rx.try_recv().is_ok() {}
            if let Err(err) = coordinator.run_now().await {
                warn!("change-driven dispatch failed: {}", err);
            }
        }
        debug!("change listener stopped");
    });
}

/// Periodic backstop: re-check for due records on a fixed interval so a
/// missed change notification delays delivery by at most one period.
pub fn spawn_periodic(coordinator: Arc<TriggerCoordinator>, interval: Duration) {
    info!("periodic dispatch started (every {:?})", interval);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = coordinator.run_now().await {
                warn!("periodic dispatch failed: {}", err);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::FixedClock;
    use crate::services::schedule_store::ScheduleStore;
    use crate::testutil::{MockMailer, memory_pool, new_delivery};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    async fn coordinator_with(
        mailer: Arc<MockMailer>,
        settle: Duration,
    ) -> (
        Arc<TriggerCoordinator>,
        mpsc::UnboundedReceiver<()>,
        Arc<ScheduleStore>,
    ) {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let clock = Arc::new(FixedClock::at(Utc::now()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            mailer,
            clock,
            "http://localhost:3000",
            86_400,
            Duration::from_millis(250),
        ));
        let (coordinator, wake_rx) = TriggerCoordinator::new(dispatcher, settle);
        (coordinator, wake_rx, store)
    }

    #[tokio::test]
    async fn run_now_reports_batch_and_notifies_observers() {
        let mailer = Arc::new(MockMailer::default());
        let (coordinator, _wake_rx, store) =
            coordinator_with(mailer, Duration::from_millis(10)).await;

        store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                Utc::now() - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_observer = seen.clone();
        coordinator
            .subscribe(Box::new(move |batch| {
                seen_in_observer.fetch_add(batch.processed, Ordering::SeqCst);
            }))
            .await;

        let result = coordinator.run_now().await.unwrap();
        assert_eq!(result.success, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn change_signals_within_one_window_coalesce() {
        let mailer = Arc::new(MockMailer::default());
        let (coordinator, wake_rx, store) =
            coordinator_with(mailer.clone(), Duration::from_millis(50)).await;

        store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                Utc::now() - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        spawn_change_listener(coordinator.clone(), wake_rx);
        coordinator.notify_change();
        coordinator.notify_change();
        coordinator.notify_change();

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Three signals in one settle window produce a single send.
        assert_eq!(mailer.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn productive_run_schedules_one_follow_up_recheck() {
        let mailer = Arc::new(MockMailer::default());
        let (coordinator, _wake_rx, store) =
            coordinator_with(mailer, Duration::from_millis(20)).await;

        store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                Utc::now() - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_observer = runs.clone();
        coordinator
            .subscribe(Box::new(move |_| {
                runs_in_observer.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        coordinator.run_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The productive run plus exactly one re-check; the idle re-check
        // does not chain another.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_run_schedules_no_follow_up() {
        let mailer = Arc::new(MockMailer::default());
        let (coordinator, _wake_rx, _store) =
            coordinator_with(mailer, Duration::from_millis(20)).await;

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_observer = runs.clone();
        coordinator
            .subscribe(Box::new(move |_| {
                runs_in_observer.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        coordinator.run_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
