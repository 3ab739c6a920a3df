//! Producer authentication.
//!
//! Producers identify themselves with an `X-API-Key` header that must match
//! one of the keys configured in `INGRESS_API_KEYS`. With no keys configured
//! the check is disabled.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use relay_common::error::AppError;

use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Authenticated producer.
///
/// Use as an Axum extractor on protected routes. `key` is `None` when
/// authentication is disabled.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub key: Option<String>,
}

impl FromRequestParts<AppState> for ApiKey {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let allowed = &state.config.ingress_api_keys;
        if allowed.is_empty() {
            return Ok(ApiKey { key: None });
        }

        let presented = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .ok_or_else(|| AppError::Auth("Missing X-API-Key header".to_string()))?;

        if allowed.iter().any(|key| key == presented) {
            Ok(ApiKey {
                key: Some(presented.to_string()),
            })
        } else {
            Err(AppError::Auth("Invalid API key".to_string()))
        }
    }
}
