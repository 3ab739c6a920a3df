//! Ingress and admin routes for notifications.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use relay_common::error::AppError;
use relay_common::types::{NotificationId, NotificationRequest};
use relay_engine::{IngestRequest, IngestService, Ingested};

use crate::middleware::auth::ApiKey;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(ingest_notification))
        .route("/api/notifications/stats", get(notification_stats))
        .route("/api/notifications/{id}", get(get_notification))
}

/// POST /api/notifications: Accept a notification for delivery.
///
/// Always 202 for a well-formed request; `accepted` is `false` when the id was
/// already known.
async fn ingest_notification(
    State(state): State<AppState>,
    _auth: ApiKey,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Ingested>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let ingested = IngestService::ingest(state.store.as_ref(), request, Utc::now()).await?;
    Ok((StatusCode::ACCEPTED, Json(ingested)))
}

/// GET /api/notifications/{id}: Current delivery state of one notification.
async fn get_notification(
    State(state): State<AppState>,
    _auth: ApiKey,
    Path(id): Path<String>,
) -> Result<Json<NotificationRequest>, AppError> {
    let id = NotificationId::parse(id).map_err(AppError::Validation)?;
    let record = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
    Ok(Json(record))
}

/// GET /api/notifications/stats: Counts by state, plus dispatcher counters
/// when the dispatcher runs in this process.
async fn notification_stats(
    State(state): State<AppState>,
    _auth: ApiKey,
) -> Result<Json<serde_json::Value>, AppError> {
    let counts = state.store.counts_by_state().await?;
    let dispatcher = state.dispatcher.as_ref().map(|d| d.stats());

    Ok(Json(json!({
        "pending": counts.pending,
        "in_flight": counts.in_flight,
        "delivered": counts.delivered,
        "failed_permanent": counts.failed_permanent,
        "total": counts.total(),
        "dispatcher": dispatcher,
    })))
}
