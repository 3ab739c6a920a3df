use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_common::types::{DeliveryOutcome, NotificationId, NotificationRequest};

use super::Sink;

/// In-memory sink that replays scripted outcomes.
///
/// Outcomes are scripted per notification id and consumed in order; once a
/// script runs out (or for unscripted ids) the fallback outcome is returned.
/// Every call is recorded, including calls that end up timing out.
pub struct ScriptedSink {
    scripts: Mutex<HashMap<NotificationId, VecDeque<DeliveryOutcome>>>,
    fallback: DeliveryOutcome,
    delay: Option<Duration>,
    sends: Mutex<Vec<NotificationId>>,
}

impl ScriptedSink {
    pub fn new(fallback: DeliveryOutcome) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            delay: None,
            sends: Mutex::new(Vec::new()),
        }
    }

    /// Sink that always succeeds.
    pub fn succeeding() -> Self {
        Self::new(DeliveryOutcome::Success)
    }

    /// Sleep for `delay` before answering each send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue `outcomes` for `id`, in order.
    pub fn script(
        self,
        id: &NotificationId,
        outcomes: impl IntoIterator<Item = DeliveryOutcome>,
    ) -> Self {
        self.scripts
            .lock()
            .entry(id.clone())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Ids passed to `send`, in call order.
    pub fn sends(&self) -> Vec<NotificationId> {
        self.sends.lock().clone()
    }

    pub fn send_count(&self, id: &NotificationId) -> usize {
        self.sends.lock().iter().filter(|sent| *sent == id).count()
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, notification: &NotificationRequest) -> DeliveryOutcome {
        self.sends.lock().push(notification.id.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.scripts
            .lock()
            .get_mut(&notification.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone())
    }
}
