use async_trait::async_trait;
use serde_json::json;

use relay_common::types::{DeliveryOutcome, NotificationRequest};

use super::{Sink, classify_response, classify_transport};
use crate::error::SinkError;

const DEFAULT_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

/// Email delivery through a SendGrid v3 compatible `mail/send` API.
#[derive(Clone)]
pub struct EmailApiSink {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl EmailApiSink {
    /// `endpoint` overrides the public SendGrid URL, e.g. for a regional API
    /// host or a local stub.
    pub fn new(
        api_key: String,
        from: String,
        endpoint: Option<String>,
    ) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("relay-notifier/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            from,
        })
    }

    fn payload(&self, notification: &NotificationRequest) -> serde_json::Value {
        json!({
            "personalizations": [{
                "to": [{ "email": notification.recipient }],
            }],
            "from": { "email": self.from },
            "subject": notification.subject,
            "content": [{
                "type": "text/plain",
                "value": notification.body,
            }],
            "custom_args": { "notification_id": notification.id.as_str() },
        })
    }
}

#[async_trait]
impl Sink for EmailApiSink {
    fn name(&self) -> &str {
        "sendgrid"
    }

    async fn send(&self, notification: &NotificationRequest) -> DeliveryOutcome {
        let result = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.payload(notification))
            .send()
            .await;

        let outcome = match result {
            Ok(response) => classify_response(response).await,
            Err(err) => classify_transport(&err),
        };

        if outcome.is_success() {
            tracing::info!(
                notification_id = %notification.id,
                to = %notification.recipient,
                "Email accepted by provider"
            );
        }
        outcome
    }
}
