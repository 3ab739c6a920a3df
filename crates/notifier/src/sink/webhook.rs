use async_trait::async_trait;
use serde::Serialize;

use relay_common::types::{DeliveryOutcome, NotificationRequest};

use super::{Sink, classify_response, classify_transport};
use crate::error::SinkError;

/// Body posted to the webhook receiver.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    id: &'a str,
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
    event_type: Option<&'a str>,
    /// 1-based number of this attempt.
    attempt: i32,
}

/// Delivers notifications by POSTing them as JSON to a fixed URL.
///
/// The notification id is sent as `Idempotency-Key` so receivers can drop
/// the duplicates at-least-once delivery may produce.
#[derive(Clone)]
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl WebhookSink {
    pub fn new(url: String, api_key: Option<String>) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("relay-notifier/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, url, api_key })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &NotificationRequest) -> DeliveryOutcome {
        let payload = WebhookPayload {
            id: notification.id.as_str(),
            recipient: &notification.recipient,
            subject: &notification.subject,
            body: &notification.body,
            event_type: notification.event_type.as_deref(),
            attempt: notification.attempts + 1,
        };

        let mut request = self
            .http
            .post(&self.url)
            .header("Idempotency-Key", notification.id.as_str())
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => classify_response(response).await,
            Err(err) => classify_transport(&err),
        }
    }
}
