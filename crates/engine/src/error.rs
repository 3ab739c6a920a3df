use thiserror::Error;

use relay_common::error::AppError;
use relay_common::types::NotificationId;

/// Errors raised by an [`EventStore`](crate::store::EventStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The outcome belongs to a claim that is no longer current: the record is
    /// not in flight, or it was re-claimed under another token.
    #[error("Stale outcome for notification {id}: {reason}")]
    StaleOutcome { id: NotificationId, reason: String },

    #[error("Notification {0} not found")]
    NotFound(NotificationId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded. Not recoverable by retrying.
    #[error("Corrupt store record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn stale(id: &NotificationId, reason: impl Into<String>) -> Self {
        StoreError::StaleOutcome {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleOutcome { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AppError::NotFound(format!("Notification {} not found", id)),
            StoreError::Unavailable(msg) => AppError::StoreUnavailable(msg),
            StoreError::StaleOutcome { .. } | StoreError::Corrupt(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}
