//! Sink adapter: the boundary to the external delivery provider.
//!
//! The dispatcher depends only on [`Sink::send`]. Providers translate the
//! provider's response into a [`DeliveryOutcome`]; they never return errors.

mod email;
mod log;
mod scripted;
mod webhook;

pub use email::EmailApiSink;
pub use log::LogSink;
pub use scripted::ScriptedSink;
pub use webhook::WebhookSink;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use relay_common::config::AppConfig;
use relay_common::types::{DeliveryOutcome, NotificationRequest};

use crate::error::SinkError;

/// Longest provider response excerpt kept in `last_error`.
const MAX_DETAIL_LEN: usize = 200;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Provider name used in logs.
    fn name(&self) -> &str;

    /// Perform one delivery attempt.
    async fn send(&self, notification: &NotificationRequest) -> DeliveryOutcome;
}

/// Build the sink selected by `SINK_PROVIDER`.
pub fn build_sink(config: &AppConfig) -> Result<Arc<dyn Sink>, SinkError> {
    let sink: Arc<dyn Sink> = match config.sink_provider.trim().to_ascii_lowercase().as_str() {
        "sendgrid" => {
            let api_key = config.sink_api_key.clone().ok_or(SinkError::MissingSetting {
                provider: "sendgrid",
                setting: "SINK_API_KEY",
            })?;
            let from = config.email_from.clone().ok_or(SinkError::MissingSetting {
                provider: "sendgrid",
                setting: "EMAIL_FROM",
            })?;
            Arc::new(EmailApiSink::new(api_key, from, config.sink_endpoint.clone())?)
        }
        "webhook" => {
            let url = config.sink_endpoint.clone().ok_or(SinkError::MissingSetting {
                provider: "webhook",
                setting: "SINK_ENDPOINT",
            })?;
            Arc::new(WebhookSink::new(url, config.sink_api_key.clone())?)
        }
        "log" => Arc::new(LogSink),
        other => return Err(SinkError::UnknownProvider(other.to_string())),
    };

    tracing::info!(provider = sink.name(), "Sink configured");
    Ok(sink)
}

/// Map a provider HTTP status onto an outcome.
///
/// 2xx succeeds. 408, 429 and 5xx are worth retrying. Any other status means
/// the request itself is wrong and will not get better.
pub fn classify_status(status: StatusCode, detail: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Success;
    }

    let reason = if detail.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), truncate(detail.trim(), MAX_DETAIL_LEN))
    };

    let retryable = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();

    if retryable {
        DeliveryOutcome::RetryableFailure(reason)
    } else {
        DeliveryOutcome::PermanentFailure(reason)
    }
}

/// Transport failures (connect, TLS, timeout, reset) are always retryable.
pub(crate) fn classify_transport(err: &reqwest::Error) -> DeliveryOutcome {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect error"
    } else {
        "transport error"
    };
    DeliveryOutcome::RetryableFailure(format!("{kind}: {err}"))
}

/// Read the response and classify it.
pub(crate) async fn classify_response(response: reqwest::Response) -> DeliveryOutcome {
    let status = response.status();
    if status.is_success() {
        return DeliveryOutcome::Success;
    }
    let detail = response.text().await.unwrap_or_default();
    classify_status(status, &detail)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
