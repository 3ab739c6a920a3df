use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Idempotency key of a notification.
///
/// Either supplied by the producer or derived from the payload at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub const MAX_LENGTH: usize = 128;

    /// Validate and wrap a producer-supplied id. Surrounding whitespace is trimmed.
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let id = raw.into().trim().to_string();
        if id.is_empty() {
            return Err("id must not be empty".to_string());
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(format!("id exceeds {} characters", Self::MAX_LENGTH));
        }
        if id.chars().any(char::is_control) {
            return Err("id must not contain control characters".to_string());
        }
        Ok(Self(id))
    }

    /// Wrap a hex-encoded content digest. Digests are always within the id limits.
    pub fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery state of a notification.
///
/// Transitions only move forward:
/// `Pending -> InFlight -> {Delivered | Pending (retry) | FailedPermanent}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    FailedPermanent,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::FailedPermanent)
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Pending => write!(f, "pending"),
            DeliveryState::InFlight => write!(f, "in_flight"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::FailedPermanent => write!(f, "failed_permanent"),
        }
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "in_flight" => Ok(DeliveryState::InFlight),
            "delivered" => Ok(DeliveryState::Delivered),
            "failed_permanent" => Ok(DeliveryState::FailedPermanent),
            other => Err(format!("unknown delivery state '{}'", other)),
        }
    }
}

/// Result of a single send attempt, as reported by a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    RetryableFailure(String),
    PermanentFailure(String),
}

impl DeliveryOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        DeliveryOutcome::RetryableFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        DeliveryOutcome::PermanentFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

/// A notification accepted for delivery, with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRequest {
    pub id: NotificationId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Producer-side label, e.g. `send-email`. Informational only.
    pub event_type: Option<String>,
    pub state: DeliveryState,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub claim_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRequest {
    /// Build a fresh `Pending` entity, immediately eligible for dispatch.
    pub fn new(
        id: NotificationId,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            event_type: None,
            state: DeliveryState::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            claimed_at: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_event_type(mut self, event_type: Option<String>) -> Self {
        self.event_type = event_type;
        self
    }

    /// True if this record is currently claimed under `token`.
    pub fn is_claimed_by(&self, token: Uuid) -> bool {
        self.state == DeliveryState::InFlight && self.claim_token == Some(token)
    }

    /// `Pending -> InFlight`, stamping a new claim.
    pub fn mark_claimed(&mut self, token: Uuid, now: DateTime<Utc>) {
        self.state = DeliveryState::InFlight;
        self.claimed_at = Some(now);
        self.claim_token = Some(token);
        self.updated_at = now;
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.state = DeliveryState::Delivered;
        self.clear_claim(now);
    }

    pub fn schedule_retry(&mut self, next_attempt_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.state = DeliveryState::Pending;
        self.next_attempt_at = next_attempt_at;
        self.last_error = Some(error);
        self.clear_claim(now);
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.state = DeliveryState::FailedPermanent;
        self.last_error = Some(error);
        self.clear_claim(now);
    }

    /// `InFlight -> Pending` without consuming an attempt.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.state = DeliveryState::Pending;
        self.clear_claim(now);
    }

    fn clear_claim(&mut self, now: DateTime<Utc>) {
        self.claimed_at = None;
        self.claim_token = None;
        self.updated_at = now;
    }
}

/// Number of notifications per delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub failed_permanent: u64,
}

impl StateCounts {
    pub fn add(&mut self, state: DeliveryState, n: u64) {
        match state {
            DeliveryState::Pending => self.pending += n,
            DeliveryState::InFlight => self.in_flight += n,
            DeliveryState::Delivered => self.delivered += n,
            DeliveryState::FailedPermanent => self.failed_permanent += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.delivered + self.failed_permanent
    }
}
