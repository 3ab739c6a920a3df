//! Ingest service: validates producer requests and writes them to the store.
//!
//! The id doubles as idempotency key. Producers that do not send one get an id
//! derived from the payload plus an optional nonce, so a blind resend of the
//! same request collapses onto the existing record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use relay_common::error::AppError;
use relay_common::types::{NotificationId, NotificationRequest};

use crate::store::EventStore;

/// Separator between hashed fields; cannot appear in a valid recipient.
const FIELD_SEPARATOR: u8 = 0x1f;

const MAX_RECIPIENT_LEN: usize = 320;
const MAX_SUBJECT_LEN: usize = 998;
const MAX_BODY_LEN: usize = 256 * 1024;

/// Ids that collide with fixed admin routes under `/api/notifications/`.
const RESERVED_IDS: &[&str] = &["stats"];

/// Producer request body.
///
/// Accepts either the flat form or the legacy event envelope
/// `{event_type, created_time, event_context: {to, subject, text}}`. The legacy
/// field names (`to`, `text`) work in both places. Top-level fields win over
/// the envelope's.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawIngestRequest")]
pub struct IngestRequest {
    pub id: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub nonce: Option<String>,
    pub event_type: Option<String>,
}

#[derive(Deserialize)]
struct RawIngestRequest {
    id: Option<String>,
    #[serde(alias = "to")]
    recipient: Option<String>,
    subject: Option<String>,
    #[serde(alias = "text")]
    body: Option<String>,
    nonce: Option<String>,
    event_type: Option<String>,
    event_context: Option<EventContext>,
}

#[derive(Deserialize)]
struct EventContext {
    #[serde(alias = "to")]
    recipient: Option<String>,
    subject: Option<String>,
    #[serde(alias = "text")]
    body: Option<String>,
}

impl TryFrom<RawIngestRequest> for IngestRequest {
    type Error = String;

    fn try_from(raw: RawIngestRequest) -> Result<Self, Self::Error> {
        let (ctx_recipient, ctx_subject, ctx_body) = match raw.event_context {
            Some(ctx) => (ctx.recipient, ctx.subject, ctx.body),
            None => (None, None, None),
        };

        Ok(Self {
            id: raw.id,
            recipient: raw
                .recipient
                .or(ctx_recipient)
                .ok_or("missing field `recipient`")?,
            subject: raw
                .subject
                .or(ctx_subject)
                .ok_or("missing field `subject`")?,
            body: raw.body.or(ctx_body).unwrap_or_default(),
            nonce: raw.nonce,
            event_type: raw.event_type,
        })
    }
}

/// Resolved id and whether this call created the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ingested {
    pub id: NotificationId,
    pub accepted: bool,
}

/// Service layer for notification ingestion.
pub struct IngestService;

impl IngestService {
    /// Validate `request`, resolve its id and enqueue it.
    ///
    /// A duplicate id is not an error: the existing record is left untouched and
    /// `accepted` is `false`.
    pub async fn ingest(
        store: &dyn EventStore,
        request: IngestRequest,
        now: DateTime<Utc>,
    ) -> Result<Ingested, AppError> {
        Self::validate(&request)?;

        let id = match request.id.as_deref() {
            Some(raw) => {
                let id = NotificationId::parse(raw).map_err(AppError::Validation)?;
                if RESERVED_IDS.contains(&id.as_str()) {
                    return Err(AppError::Validation(format!("id '{}' is reserved", id)));
                }
                id
            }
            None => derive_id(
                &request.recipient,
                &request.subject,
                &request.body,
                request.nonce.as_deref().unwrap_or(""),
            ),
        };

        let record = NotificationRequest::new(
            id.clone(),
            request.recipient.trim(),
            request.subject,
            request.body,
            now,
        )
        .with_event_type(request.event_type);

        let result = store.enqueue(record).await?;

        if result.accepted {
            tracing::info!(notification_id = %id, "Notification accepted");
        } else {
            tracing::debug!(notification_id = %id, "Duplicate ingestion ignored");
        }

        Ok(Ingested {
            id,
            accepted: result.accepted,
        })
    }

    fn validate(request: &IngestRequest) -> Result<(), AppError> {
        let recipient = request.recipient.trim();
        if recipient.is_empty() {
            return Err(AppError::Validation("recipient is required".to_string()));
        }
        if recipient.len() > MAX_RECIPIENT_LEN {
            return Err(AppError::Validation(format!(
                "recipient exceeds {} characters",
                MAX_RECIPIENT_LEN
            )));
        }
        if recipient.chars().any(char::is_control) {
            return Err(AppError::Validation(
                "recipient must not contain control characters".to_string(),
            ));
        }
        if request.subject.trim().is_empty() {
            return Err(AppError::Validation("subject is required".to_string()));
        }
        if request.subject.len() > MAX_SUBJECT_LEN {
            return Err(AppError::Validation(format!(
                "subject exceeds {} characters",
                MAX_SUBJECT_LEN
            )));
        }
        if request.body.len() > MAX_BODY_LEN {
            return Err(AppError::Validation(format!(
                "body exceeds {} bytes",
                MAX_BODY_LEN
            )));
        }
        Ok(())
    }
}

/// `hex(sha256(recipient ␟ subject ␟ body ␟ nonce))`.
pub fn derive_id(recipient: &str, subject: &str, body: &str, nonce: &str) -> NotificationId {
    let mut hasher = Sha256::new();
    for (i, field) in [recipient.trim(), subject, body, nonce].iter().enumerate() {
        if i > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(field.as_bytes());
    }
    NotificationId::from_digest(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use relay_common::types::DeliveryState;

    fn request(id: Option<&str>) -> IngestRequest {
        IngestRequest {
            id: id.map(str::to_string),
            recipient: "a@example.com".to_string(),
            subject: "Hi".to_string(),
            body: "test".to_string(),
            nonce: None,
            event_type: Some("send-email".to_string()),
        }
    }

    #[test]
    fn test_derive_id_is_stable_and_nonce_sensitive() {
        let a = derive_id("a@example.com", "Hi", "test", "");
        let b = derive_id("a@example.com", "Hi", "test", "");
        let c = derive_id("a@example.com", "Hi", "test", "n-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_derive_id_separates_fields() {
        // Same concatenation, different field boundaries.
        let a = derive_id("a@example.com", "Hi", "test", "");
        let b = derive_id("a@example.com", "Hit", "est", "");
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_accepts_legacy_field_names() {
        let req: IngestRequest = serde_json::from_value(serde_json::json!({
            "to": "02c@example.com",
            "subject": "Test Email",
            "text": "This is a test email."
        }))
        .unwrap();
        assert_eq!(req.recipient, "02c@example.com");
        assert_eq!(req.body, "This is a test email.");
        assert!(req.id.is_none());
    }

    #[test]
    fn test_request_unpacks_event_envelope() {
        let req: IngestRequest = serde_json::from_value(serde_json::json!({
            "event_type": "send-email",
            "created_time": "2024-01-01T00:00:00",
            "event_context": {
                "to": "02c@example.com",
                "subject": "Test Email",
                "text": "This is a test email."
            }
        }))
        .unwrap();
        assert_eq!(req.recipient, "02c@example.com");
        assert_eq!(req.subject, "Test Email");
        assert_eq!(req.body, "This is a test email.");
        assert_eq!(req.event_type.as_deref(), Some("send-email"));
    }

    #[test]
    fn test_request_without_recipient_is_rejected() {
        let err = serde_json::from_value::<IngestRequest>(serde_json::json!({
            "event_type": "send-email",
            "event_context": { "subject": "Test Email" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("recipient"));
    }

    #[tokio::test]
    async fn test_ingest_with_explicit_id() {
        let store = MemoryEventStore::default();
        let now = Utc::now();

        let ingested = IngestService::ingest(&store, request(Some("x1")), now)
            .await
            .unwrap();
        assert_eq!(ingested.id.as_str(), "x1");
        assert!(ingested.accepted);

        let stored = store.get(&ingested.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.event_type.as_deref(), Some("send-email"));
    }

    #[tokio::test]
    async fn test_ingest_twice_reports_duplicate() {
        let store = MemoryEventStore::default();
        let now = Utc::now();

        let first = IngestService::ingest(&store, request(None), now).await.unwrap();
        let second = IngestService::ingest(&store, request(None), now).await.unwrap();
        assert!(first.accepted);
        assert!(!second.accepted);
        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_blank_recipient() {
        let store = MemoryEventStore::default();
        let mut req = request(None);
        req.recipient = "   ".to_string();
        let err = IngestService::ingest(&store, req, Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_rejects_reserved_id() {
        let store = MemoryEventStore::default();
        let err = IngestService::ingest(&store, request(Some("stats")), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_rejects_invalid_id() {
        let store = MemoryEventStore::default();
        let err = IngestService::ingest(&store, request(Some(" ")), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
