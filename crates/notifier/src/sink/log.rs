use async_trait::async_trait;

use relay_common::types::{DeliveryOutcome, NotificationRequest};

use super::Sink;

/// Dry-run sink: logs the notification and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &NotificationRequest) -> DeliveryOutcome {
        tracing::info!(
            notification_id = %notification.id,
            to = %notification.recipient,
            subject = %notification.subject,
            attempt = notification.attempts + 1,
            "Delivering notification (log sink)"
        );
        DeliveryOutcome::Success
    }
}
