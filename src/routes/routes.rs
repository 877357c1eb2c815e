//! Defines routes for scheduling, dispatch, and recipient access.
//!
//! ## Structure
//! - **Owner endpoints** (require `X-Owner-Id`)
//!   - `POST   /deliveries` — upload a file and schedule its delivery
//!   - `GET    /deliveries` — list the owner's deliveries
//!   - `PATCH  /deliveries/{id}` — reschedule recipient/time while pending
//!   - `POST   /deliveries/{id}/retry` — reset a failed delivery to pending
//!   - `DELETE /deliveries/{id}` — cancel and release the stored file
//!
//! - **Dispatch endpoints**
//!   - `POST /dispatch/run` — run a dispatch batch now
//!   - `POST /dispatch/events` — change-notification wake-up signal
//!
//! - **Recipient endpoints** (token/signature is the only credential)
//!   - `GET /access/{token}` — resolve a token to a download link
//!   - `GET /download/{*locator}` — signed, expiring file download
//!
//! The wildcard `*locator` allows nested locators like `uuid/report.pdf`.

use crate::{
    handlers::{
        delivery_handlers::{
            cancel_delivery, change_event, download, list_deliveries, reschedule_delivery,
            resolve_access, retry_delivery, run_dispatch, schedule_delivery,
        },
        health_handlers::{healthz, readyz},
    },
    services::AppContext,
};
use axum::{
    Router,
    routing::{get, patch, post},
};

/// Build and return the router for all delivery routes.
///
/// The router carries shared state (`AppContext`) to all handlers.
pub fn routes() -> Router<AppContext> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // owner endpoints
        .route("/deliveries", post(schedule_delivery).get(list_deliveries))
        .route(
            "/deliveries/{id}",
            patch(reschedule_delivery).delete(cancel_delivery),
        )
        .route("/deliveries/{id}/retry", post(retry_delivery))
        // dispatch endpoints
        .route("/dispatch/run", post(run_dispatch))
        .route("/dispatch/events", post(change_event))
        // recipient endpoints
        .route("/access/{token}", get(resolve_access))
        .route("/download/{*locator}", get(download))
}
