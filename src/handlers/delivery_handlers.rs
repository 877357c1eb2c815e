//! HTTP handlers for the owner-facing delivery operations, recipient access
//! resolution, and signed downloads. Downloads stream straight from disk;
//! storage concerns are delegated to the services.

use crate::{
    errors::{AppError, DeliveryError},
    models::delivery::{DeliveryStatus, ScheduledDelivery},
    services::{
        AppContext, access,
        mail::looks_like_email,
        object_store::{ObjectStore, StoredObject},
        schedule_store::{NewDelivery, ScheduleUpdate},
        sync::{ViewTab, filter_deliveries},
        trigger::TriggerCoordinator,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::stream;
use serde::Deserialize;
use std::{io, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::warn;
use uuid::Uuid;

/// Mutable fields accepted by `PATCH /deliveries/{id}`.
#[derive(Debug, Deserialize)]
pub struct RescheduleReq {
    pub recipient: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Change-notification payload. Only its arrival matters: any `old`/`new`
/// row images in the body are ignored rather than trusted as current state.
#[derive(Debug, Deserialize)]
pub struct ChangeEvent {
    pub event_type: String,
}

/// Query params of a signed download link.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub expires: i64,
    pub sig: String,
}

/// Owner identity from the `X-Owner-Id` header. Authentication itself is an
/// upstream concern; an absent or malformed header means no identified
/// owner.
fn require_owner(headers: &HeaderMap) -> Result<Uuid, AppError> {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| AppError::from(DeliveryError::AuthRequired))
}

/// Fetch a delivery and hide its existence from anyone but the owner.
async fn owned_delivery(
    ctx: &AppContext,
    owner_id: Uuid,
    id: Uuid,
) -> Result<ScheduledDelivery, AppError> {
    let record = ctx.store.get(id).await?;
    if record.owner_id != owner_id {
        return Err(AppError::not_found(format!("delivery `{}` not found", id)));
    }
    Ok(record)
}

/// Fire a dispatch run without tying the caller's response to its outcome.
fn dispatch_soon(trigger: &Arc<TriggerCoordinator>) {
    let trigger = Arc::clone(trigger);
    tokio::spawn(async move {
        if let Err(err) = trigger.run_now().await {
            warn!("immediate dispatch failed: {}", err);
        }
    });
}

/// POST `/deliveries` — multipart upload + schedule.
///
/// Expects a `file` part plus `recipient` and `scheduled_at` (RFC 3339)
/// text parts, in any order. The file streams to the object store while the
/// request is still being read. A schedule that is already due triggers an
/// immediate, non-fatal dispatch run.
pub async fn schedule_delivery(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let owner_id = require_owner(&headers)?;

    let mut uploaded: Option<(StoredObject, String)> = None;
    let mut file_type: Option<String> = None;
    let mut recipient: Option<String> = None;
    let mut scheduled_at: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, format!("malformed multipart: {e}")))?
    {
        let part = field.name().map(|n| n.to_string());
        match part.as_deref() {
            Some("file") => {
                let name = field
                    .file_name()
                    .map(|n| n.to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "upload.bin".to_string());
                file_type = field.content_type().map(|ct| ct.to_string());

                let data = field.bytes().await.map_err(|e| {
                    AppError::new(StatusCode::BAD_REQUEST, format!("malformed multipart: {e}"))
                })?;

                let locator = ObjectStore::new_locator(&name);
                let stream = stream::iter([io::Result::Ok(data)]);
                let stored = ctx
                    .objects
                    .put(&locator, stream)
                    .await
                    .map_err(|e| DeliveryError::Transport(format!("file upload failed: {e}")))?;
                tracing::debug!(
                    "stored {} ({} bytes, etag {})",
                    stored.locator,
                    stored.size_bytes,
                    stored.etag
                );
                uploaded = Some((stored, name));
            }
            Some("recipient") => {
                recipient = Some(field.text().await.map_err(|e| {
                    AppError::new(StatusCode::BAD_REQUEST, format!("malformed multipart: {e}"))
                })?);
            }
            Some("scheduled_at") => {
                scheduled_at = Some(field.text().await.map_err(|e| {
                    AppError::new(StatusCode::BAD_REQUEST, format!("malformed multipart: {e}"))
                })?);
            }
            _ => {}
        }
    }

    let Some((stored, file_name)) = uploaded else {
        return Err(DeliveryError::Validation("missing `file` part".into()).into());
    };

    // Validation happens after the upload completed; rejected requests must
    // release the payload again or it leaks.
    let (recipient, scheduled_at) = match validate_schedule_inputs(&recipient, &scheduled_at) {
        Ok(parts) => parts,
        Err(err) => {
            remove_uploaded(&ctx, &stored.locator);
            return Err(err);
        }
    };

    let record = ctx
        .store
        .insert(NewDelivery {
            owner_id,
            file_name,
            file_size: stored.size_bytes,
            file_type,
            storage_ref: stored.locator,
            recipient,
            scheduled_at,
        })
        .await?;

    if record.scheduled_at <= ctx.clock.now() {
        dispatch_soon(&ctx.trigger);
    }

    Ok((StatusCode::CREATED, Json(record)))
}

/// Release a payload whose schedule never materialized. Best-effort.
fn remove_uploaded(ctx: &AppContext, locator: &str) {
    let objects = ctx.objects.clone();
    let locator = locator.to_string();
    tokio::spawn(async move {
        if let Err(err) = objects.remove(&locator).await {
            warn!("orphaned upload {} not removed: {}", locator, err);
        }
    });
}

fn validate_schedule_inputs(
    recipient: &Option<String>,
    scheduled_at: &Option<String>,
) -> Result<(String, DateTime<Utc>), AppError> {
    let recipient = recipient
        .as_deref()
        .ok_or_else(|| AppError::from(DeliveryError::Validation("missing `recipient`".into())))?;
    if !looks_like_email(recipient) {
        return Err(DeliveryError::Validation(format!(
            "`{}` is not a valid email address",
            recipient
        ))
        .into());
    }
    let raw = scheduled_at
        .as_deref()
        .ok_or_else(|| AppError::from(DeliveryError::Validation("missing `scheduled_at`".into())))?;
    let when = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| {
            AppError::from(DeliveryError::Validation(format!(
                "`{}` is not an RFC 3339 timestamp",
                raw
            )))
        })?
        .with_timezone(&Utc);
    Ok((recipient.to_string(), when))
}

/// Query params accepted by the delivery listing.
#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    /// Free-text match against file name and recipient.
    pub q: Option<String>,
    /// Comma-separated status set, e.g. `pending,failed`.
    pub status: Option<String>,
    /// Tab selection: `all` (default), `upcoming`, or `history`.
    pub tab: Option<String>,
}

/// GET `/deliveries` — the owner's deliveries, newest first.
///
/// The set is always fetched fresh from the store; filtering is applied as
/// a pure function over that snapshot.
pub async fn list_deliveries(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ScheduledDelivery>>, AppError> {
    let owner_id = require_owner(&headers)?;

    let statuses = parse_status_set(query.status.as_deref())?;
    let tab = parse_tab(query.tab.as_deref())?;

    let deliveries = ctx.store.list_by_owner(owner_id).await?;
    let filtered = filter_deliveries(
        &deliveries,
        query.q.as_deref().unwrap_or(""),
        &statuses,
        tab,
    );
    Ok(Json(filtered))
}

fn parse_status_set(raw: Option<&str>) -> Result<Vec<DeliveryStatus>, AppError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            DeliveryStatus::parse(s).ok_or_else(|| {
                AppError::from(DeliveryError::Validation(format!("unknown status `{}`", s)))
            })
        })
        .collect()
}

fn parse_tab(raw: Option<&str>) -> Result<ViewTab, AppError> {
    match raw {
        None | Some("all") => Ok(ViewTab::All),
        Some("upcoming") => Ok(ViewTab::Upcoming),
        Some("history") => Ok(ViewTab::History),
        Some(other) => {
            Err(DeliveryError::Validation(format!("unknown tab `{}`", other)).into())
        }
    }
}

/// PATCH `/deliveries/{id}` — edit recipient and/or schedule while pending.
pub async fn reschedule_delivery(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<RescheduleReq>,
) -> Result<Json<ScheduledDelivery>, AppError> {
    let owner_id = require_owner(&headers)?;
    owned_delivery(&ctx, owner_id, id).await?;

    if let Some(recipient) = req.recipient.as_deref() {
        if !looks_like_email(recipient) {
            return Err(DeliveryError::Validation(format!(
                "`{}` is not a valid email address",
                recipient
            ))
            .into());
        }
    }

    let updated = ctx
        .store
        .update_schedule(
            id,
            ScheduleUpdate {
                recipient: req.recipient,
                scheduled_at: req.scheduled_at,
            },
        )
        .await?;

    if updated.scheduled_at <= ctx.clock.now() {
        dispatch_soon(&ctx.trigger);
    }
    Ok(Json(updated))
}

/// POST `/deliveries/{id}/retry` — move a failed delivery back to pending
/// and reconsider it right away.
pub async fn retry_delivery(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduledDelivery>, AppError> {
    let owner_id = require_owner(&headers)?;
    owned_delivery(&ctx, owner_id, id).await?;

    let record = ctx.store.reset_to_pending(id).await?;
    dispatch_soon(&ctx.trigger);
    Ok(Json(record))
}

/// DELETE `/deliveries/{id}` — remove the record and release its payload.
///
/// The record delete is authoritative; a failed payload removal leaves an
/// orphaned object, which is degraded state worth a log line but not a
/// failed response.
pub async fn cancel_delivery(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let owner_id = require_owner(&headers)?;
    owned_delivery(&ctx, owner_id, id).await?;

    let removed = ctx.store.delete(id).await?;
    if let Err(err) = ctx.objects.remove(&removed.storage_ref).await {
        warn!(
            "delivery {}: payload {} not removed: {}",
            id, removed.storage_ref, err
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/dispatch/run` — manual trigger; returns the batch outcome.
pub async fn run_dispatch(
    State(ctx): State<AppContext>,
) -> Result<impl IntoResponse, AppError> {
    let result = ctx.trigger.run_now().await?;
    Ok(Json(result))
}

/// POST `/dispatch/events` — change-notification wake-up. The payload is
/// accepted for shape but consumed only as a signal to re-query.
pub async fn change_event(
    State(ctx): State<AppContext>,
    Json(event): Json<ChangeEvent>,
) -> StatusCode {
    tracing::debug!("change event: {}", event.event_type);
    ctx.trigger.notify_change();
    StatusCode::ACCEPTED
}

/// GET `/access/{token}` — recipient-facing resolution of an access token.
pub async fn resolve_access(
    State(ctx): State<AppContext>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let grant = access::resolve_by_token(
        &ctx.store,
        &ctx.objects,
        &token,
        ctx.link_ttl_secs,
        ctx.clock.now(),
    )
    .await?;
    Ok(Json(grant))
}

/// GET `/download/{*locator}` — signed streaming download.
pub async fn download(
    State(ctx): State<AppContext>,
    Path(locator): Path<String>,
    Query(q): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    ctx.objects
        .verify(&locator, q.expires, &q.sig, ctx.clock.now())?;
    let file = ctx.objects.open(&locator).await?;

    let stream = ReaderStream::new(file);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let file_name = locator.rsplit('/').next().unwrap_or("download");
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}
