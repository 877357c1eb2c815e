//! src/services/dispatch.rs
//!
//! Dispatcher — selects due pending deliveries, emails each recipient an
//! access link, and applies the guarded status transition. One email attempt
//! per record per run; a record that fails stays `failed` until an explicit
//! retry resets it.
//!
//! Mail send and status write are two non-transactional phases. If the
//! process dies between "mail sent" and "status persisted" the record stays
//! `pending` and the next run emails it again: delivery is at-least-once,
//! never exactly-once.

use crate::errors::DeliveryResult;
use crate::models::batch::{BatchResult, DispatchDetail};
use crate::models::delivery::ScheduledDelivery;
use crate::services::clock::Clock;
use crate::services::mail::MailTransport;
use crate::services::schedule_store::ScheduleStore;
use futures::{StreamExt, stream};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Records processed concurrently within one run. Affects throughput only.
const DISPATCH_CONCURRENCY: usize = 8;

pub struct Dispatcher {
    store: Arc<ScheduleStore>,
    mailer: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,

    /// Public base URL the access links are composed against.
    base_url: String,

    /// Validity window of a download link, stated in the email body.
    link_ttl_secs: u64,

    /// Upper bound on a single mail-send call. A hung transport counts as
    /// that record's failure, never as a stalled run.
    mail_timeout: Duration,

    /// Records currently being processed by some run in this process.
    /// Overlapping runs that observe the same due record yield to the one
    /// already working on it instead of double-sending.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ScheduleStore>,
        mailer: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        base_url: impl Into<String>,
        link_ttl_secs: u64,
        mail_timeout: Duration,
    ) -> Self {
        Self {
            store,
            mailer,
            clock,
            base_url: base_url.into(),
            link_ttl_secs,
            mail_timeout,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run one dispatch batch.
    ///
    /// Selects `pending` records with `scheduled_at <= now` and processes
    /// them concurrently, each independently of the others. Returns the
    /// aggregate outcome; an empty selection short-circuits before the mail
    /// transport is touched. Only the due-record query itself can fail —
    /// per-record collaborator errors become that record's `failed` outcome
    /// in the details and never abort the batch.
    pub async fn run(&self) -> DeliveryResult<BatchResult> {
        let now = self.clock.now();
        let due = self.store.list_due(now).await?;
        if due.is_empty() {
            return Ok(BatchResult::default());
        }

        debug!("dispatching {} due deliveries", due.len());
        let details: Vec<DispatchDetail> = stream::iter(due)
            .map(|record| self.process(record))
            .buffer_unordered(DISPATCH_CONCURRENCY)
            .filter_map(|detail| async { detail })
            .collect()
            .await;

        let success = details.iter().filter(|d| d.success).count();
        let failed = details.len() - success;
        Ok(BatchResult {
            processed: details.len(),
            success,
            failed,
            details,
        })
    }

    /// Process a single due record. Returns `None` when a concurrent run in
    /// this process already claimed it.
    async fn process(&self, record: ScheduledDelivery) -> Option<DispatchDetail> {
        if !self.in_flight.lock().await.insert(record.id) {
            debug!("delivery {} already claimed by a concurrent run", record.id);
            return None;
        }
        let detail = self.attempt(&record).await;
        self.in_flight.lock().await.remove(&record.id);
        Some(detail)
    }

    /// One email attempt plus the guarded status transition.
    async fn attempt(&self, record: &ScheduledDelivery) -> DispatchDetail {
        let access_url = format!("{}/access/{}", self.base_url, record.access_token);
        let (subject, body) = render_message(record, &access_url, self.link_ttl_secs);

        let send_result = tokio::time::timeout(
            self.mail_timeout,
            self.mailer.send(&record.recipient, &subject, &body),
        )
        .await;

        match send_result {
            Ok(Ok(())) => self.record_sent(record).await,
            Ok(Err(mail_err)) => self.record_failed(record, mail_err.to_string()).await,
            Err(_) => {
                self.record_failed(record, "mail send timed out".to_string())
                    .await
            }
        }
    }

    /// The email went out; persist `sent`.
    ///
    /// A write failure here is the partial-success anomaly: the recipient
    /// has the email, so the record is surfaced as a success with a note,
    /// never re-reported as failed. The next run must re-check stored status
    /// before re-sending — which it does implicitly, because `list_due` will
    /// see whatever status actually persisted.
    async fn record_sent(&self, record: &ScheduledDelivery) -> DispatchDetail {
        match self.store.mark_sent(record.id, self.clock.now()).await {
            Ok(true) => DispatchDetail {
                id: record.id,
                success: true,
                error: None,
            },
            Ok(false) => {
                // Another runner already advanced the record. Benign.
                debug!("delivery {} was already marked sent", record.id);
                DispatchDetail {
                    id: record.id,
                    success: true,
                    error: None,
                }
            }
            Err(err) => {
                error!(
                    "delivery {}: email sent but status write failed: {}",
                    record.id, err
                );
                DispatchDetail {
                    id: record.id,
                    success: true,
                    error: Some(format!("email sent but status update failed: {err}")),
                }
            }
        }
    }

    /// The attempt failed; persist `failed` plus the reason.
    async fn record_failed(&self, record: &ScheduledDelivery, reason: String) -> DispatchDetail {
        warn!("delivery {} failed: {}", record.id, reason);
        match self.store.mark_failed(record.id, &reason, self.clock.now()).await {
            Ok(_) => {}
            Err(err) => {
                // Secondary failure: the record stays pending and will be
                // retried by a later run.
                error!(
                    "delivery {}: could not persist failure status: {}",
                    record.id, err
                );
            }
        }
        DispatchDetail {
            id: record.id,
            success: false,
            error: Some(reason),
        }
    }
}

/// Render the delivery email: subject plus HTML body carrying the access
/// link and its validity window.
fn render_message(
    record: &ScheduledDelivery,
    access_url: &str,
    link_ttl_secs: u64,
) -> (String, String) {
    let hours = link_ttl_secs.div_ceil(3600);
    let subject = format!("A file is waiting for you: {}", record.file_name);
    let body = format!(
        "<html><body>\
         <p>You have received the file <strong>{}</strong>.</p>\
         <p><a href=\"{}\">Download it here</a>.</p>\
         <p>The link is valid for {} hours.</p>\
         </body></html>",
        record.file_name, access_url, hours
    );
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::delivery::DeliveryStatus;
    use crate::services::clock::FixedClock;
    use crate::testutil::{MockMailer, memory_pool, new_delivery};
    use chrono::{Duration as ChronoDuration, Utc};

    fn dispatcher(
        store: Arc<ScheduleStore>,
        mailer: Arc<MockMailer>,
        clock: Arc<FixedClock>,
    ) -> Dispatcher {
        Dispatcher::new(
            store,
            mailer,
            clock,
            "http://localhost:3000",
            86_400,
            Duration::from_millis(250),
        )
    }

    #[tokio::test]
    async fn due_pending_record_is_sent() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let result = dispatcher(store.clone(), mailer.clone(), clock).run().await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.success, 1);
        assert_eq!(result.failed, 0);

        let sent = mailer.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@b.com");
        assert!(sent[0].subject.contains("report.pdf"));
        assert!(sent[0].html.contains(&record.access_token));
        assert!(sent[0].html.contains("24 hours"));

        let current = store.get(record.id).await.unwrap();
        assert_eq!(current.status, DeliveryStatus::Sent);
        assert!(current.sent_at.is_some());
    }

    #[tokio::test]
    async fn record_becomes_due_when_clock_advances() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now + ChronoDuration::minutes(30),
            ))
            .await
            .unwrap();

        let d = dispatcher(store, mailer.clone(), clock.clone());
        assert_eq!(d.run().await.unwrap().processed, 0);

        clock.set(now + ChronoDuration::hours(1));
        let result = d.run().await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.success, 1);
        assert_eq!(mailer.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn future_records_are_untouched() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now + ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let result = dispatcher(store.clone(), mailer.clone(), clock).run().await.unwrap();
        assert_eq!(result.processed, 0);
        assert!(mailer.sent().await.is_empty());
        assert_eq!(
            store.get(record.id).await.unwrap().status,
            DeliveryStatus::Pending
        );
    }

    #[tokio::test]
    async fn empty_selection_short_circuits_before_the_mailer() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let clock = Arc::new(FixedClock::at(Utc::now()));

        let result = dispatcher(store, mailer.clone(), clock).run().await.unwrap();
        assert_eq!(result.processed, 0);
        assert_eq!(mailer.calls(), 0);
    }

    #[tokio::test]
    async fn bad_recipient_marks_record_failed() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "not-an-email",
                now - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let result = dispatcher(store.clone(), mailer, clock).run().await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.success, 0);
        assert_eq!(result.failed, 1);
        assert!(result.details[0].error.is_some());

        let current = store.get(record.id).await.unwrap();
        assert_eq!(current.status, DeliveryStatus::Failed);
        assert!(current.last_error.is_some());
    }

    #[tokio::test]
    async fn transport_outage_marks_record_failed() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::failing());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let result = dispatcher(store.clone(), mailer, clock).run().await.unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(
            store.get(record.id).await.unwrap().status,
            DeliveryStatus::Failed
        );
    }

    #[tokio::test]
    async fn hung_transport_counts_as_failure() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::delayed(Duration::from_secs(5)));
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let result = dispatcher(store.clone(), mailer, clock).run().await.unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.details[0].error.as_deref(), Some("mail send timed out"));
        assert_eq!(
            store.get(record.id).await.unwrap().status,
            DeliveryStatus::Failed
        );
    }

    #[tokio::test]
    async fn failed_records_are_not_retried_automatically() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "not-an-email",
                now - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let d = dispatcher(store.clone(), mailer.clone(), clock);
        let first = d.run().await.unwrap();
        assert_eq!(first.failed, 1);

        // The failed record is excluded from the next run.
        let second = d.run().await.unwrap();
        assert_eq!(second.processed, 0);

        // An explicit reset makes it eligible again.
        store.reset_to_pending(record.id).await.unwrap();
        let third = d.run().await.unwrap();
        assert_eq!(third.processed, 1);
    }

    #[tokio::test]
    async fn second_run_does_not_double_send() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let d = dispatcher(store, mailer.clone(), clock);
        let first = d.run().await.unwrap();
        let second = d.run().await.unwrap();

        assert_eq!(first.success, 1);
        assert_eq!(second.processed, 0);
        assert_eq!(mailer.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_runs_send_exactly_one_email() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        // A small send delay keeps both runs overlapping long enough that
        // each observes the same due record.
        let mailer = Arc::new(MockMailer::delayed(Duration::from_millis(50)));
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let record = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "a@b.com",
                now - ChronoDuration::hours(1),
            ))
            .await
            .unwrap();

        let d = Arc::new(dispatcher(store.clone(), mailer.clone(), clock));
        let (first, second) = tokio::join!(d.run(), d.run());
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(mailer.sent().await.len(), 1);
        assert_eq!(first.success + second.success, 1);
        assert_eq!(
            store.get(record.id).await.unwrap().status,
            DeliveryStatus::Sent
        );
    }

    #[tokio::test]
    async fn mixed_batch_reports_per_record_outcomes() {
        let store = Arc::new(ScheduleStore::new(memory_pool().await));
        let mailer = Arc::new(MockMailer::default());
        let now = Utc::now();
        let clock = Arc::new(FixedClock::at(now));

        let good = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "ok@example.com",
                now - ChronoDuration::minutes(5),
            ))
            .await
            .unwrap();
        let bad = store
            .insert(new_delivery(
                Uuid::new_v4(),
                "broken",
                now - ChronoDuration::minutes(5),
            ))
            .await
            .unwrap();

        let result = dispatcher(store, mailer, clock).run().await.unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(result.success, 1);
        assert_eq!(result.failed, 1);

        let ok_detail = result.details.iter().find(|d| d.id == good.id).unwrap();
        let bad_detail = result.details.iter().find(|d| d.id == bad.id).unwrap();
        assert!(ok_detail.success);
        assert!(!bad_detail.success);
    }
}
