//! Liveness plus a store round trip. Unauthenticated.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// 200 when the event store answers, 503 otherwise.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (status, store) = match state.store.counts_by_state().await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(err) => {
            tracing::warn!(error = %err, "Health check could not reach the event store");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    let body = json!({
        "status": if status.is_success() { "ok" } else { "degraded" },
        "store": store,
        "dispatcher": state.dispatcher.is_some(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    (status, Json(body))
}
