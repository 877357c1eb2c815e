//! Service layer: the schedule store, object store, mail transport, and the
//! dispatch/trigger machinery built on top of them.

pub mod access;
pub mod clock;
pub mod dispatch;
pub mod mail;
pub mod object_store;
pub mod schedule_store;
pub mod sync;
pub mod trigger;

use crate::services::clock::Clock;
use crate::services::object_store::ObjectStore;
use crate::services::schedule_store::ScheduleStore;
use crate::services::trigger::TriggerCoordinator;
use std::sync::Arc;

/// Explicitly constructed context passed to every handler: shared handles
/// to the collaborators, no globals. The mail transport handle lives inside
/// the dispatcher reached through `trigger`. Tests assemble a context with
/// doubles per construction.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<ScheduleStore>,
    pub objects: Arc<ObjectStore>,
    pub trigger: Arc<TriggerCoordinator>,
    pub clock: Arc<dyn Clock>,

    /// Validity window of signed download URLs, in seconds.
    pub link_ttl_secs: u64,
}
