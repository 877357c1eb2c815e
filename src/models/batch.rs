//! Aggregate result of one dispatch run.

use serde::Serialize;
use uuid::Uuid;

/// Per-record outcome within a dispatch run.
#[derive(Serialize, Clone, Debug)]
pub struct DispatchDetail {
    /// Delivery record the outcome belongs to.
    pub id: Uuid,

    /// Whether the email went out. A record whose email was delivered but
    /// whose status write failed still counts as a success here; `error`
    /// carries the anomaly note in that case.
    pub success: bool,

    /// Error or anomaly description, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary returned by every dispatch run.
///
/// `processed == 0` is the expected steady state: nothing was due, and the
/// mail transport was never invoked.
#[derive(Serialize, Clone, Debug, Default)]
pub struct BatchResult {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub details: Vec<DispatchDetail>,
}

impl BatchResult {
    /// True when the run attempted at least one record.
    pub fn did_work(&self) -> bool {
        self.processed > 0
    }
}
