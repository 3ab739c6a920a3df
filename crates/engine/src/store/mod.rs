//! Event store: the single owner of notification state.
//!
//! All entity mutation goes through this contract. Workers never write a record
//! directly; they claim, then report an outcome under the claim's token.

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use relay_common::types::{
    DeliveryOutcome, DeliveryState, NotificationId, NotificationRequest, StateCounts,
};

use crate::backoff::RetryPolicy;
use crate::error::StoreError;

/// `last_error` recorded when the recovery sweep reclaims an abandoned claim.
pub const STALE_CLAIM_ERROR: &str = "in-flight claim expired";

/// Result of [`EventStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    /// `false` when a record with the same id already existed. Nothing was changed.
    pub accepted: bool,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert `request` unless its id is already known.
    async fn enqueue(&self, request: NotificationRequest) -> Result<EnqueueResult, StoreError>;

    /// Atomically claim up to `limit` pending records due at `now`, oldest due first.
    ///
    /// Each returned record is `InFlight` with a fresh claim token. Concurrent
    /// callers never receive the same record.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRequest>, StoreError>;

    /// Apply the outcome of one send attempt and return the updated record.
    ///
    /// Fails with [`StoreError::StaleOutcome`] if the record is not currently
    /// claimed under `claim_token`; nothing is mutated in that case.
    async fn record_outcome(
        &self,
        id: &NotificationId,
        claim_token: Uuid,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<NotificationRequest, StoreError>;

    /// Hand a claimed but unsent record back to `Pending` without using an attempt.
    async fn release_claim(
        &self,
        id: &NotificationId,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Refresh `claimed_at` to `now` for every pair still claimed under its token.
    ///
    /// Returns the ids that are still held. Pairs whose claim was recovered or
    /// superseded are left untouched and omitted from the result.
    async fn renew_claims(
        &self,
        claims: &[(NotificationId, Uuid)],
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationId>, StoreError>;

    /// Recover every in-flight record claimed at or before `cutoff`.
    ///
    /// The abandoned claim counts as an attempt. Returns the number of records touched.
    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn get(&self, id: &NotificationId) -> Result<Option<NotificationRequest>, StoreError>;

    async fn counts_by_state(&self) -> Result<StateCounts, StoreError>;
}

/// Check that `record` is claimed under `claim_token`.
pub(crate) fn ensure_claimed(
    record: &NotificationRequest,
    claim_token: Uuid,
) -> Result<(), StoreError> {
    if record.state != DeliveryState::InFlight {
        return Err(StoreError::stale(
            &record.id,
            format!("record is {}", record.state),
        ));
    }
    if !record.is_claimed_by(claim_token) {
        return Err(StoreError::stale(&record.id, "claim token superseded"));
    }
    Ok(())
}

/// Apply one attempt's outcome to a claimed record. Increments `attempts` exactly once.
pub(crate) fn apply_outcome(
    record: &mut NotificationRequest,
    outcome: &DeliveryOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    record.attempts += 1;
    match outcome {
        DeliveryOutcome::Success => record.mark_delivered(now),
        DeliveryOutcome::RetryableFailure(reason) => {
            fail_or_retry(record, non_empty(reason, "retryable failure"), policy, now)
        }
        DeliveryOutcome::PermanentFailure(reason) => {
            record.mark_failed(non_empty(reason, "permanent failure"), now)
        }
    }
}

/// Treat an abandoned claim as a failed attempt.
pub(crate) fn apply_recovery(
    record: &mut NotificationRequest,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    record.attempts += 1;
    if policy.is_exhausted(record.attempts) {
        record.mark_failed(STALE_CLAIM_ERROR.to_string(), now);
    } else {
        record.schedule_retry(now, STALE_CLAIM_ERROR.to_string(), now);
    }
}

fn fail_or_retry(
    record: &mut NotificationRequest,
    reason: String,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    if policy.is_exhausted(record.attempts) {
        record.mark_failed(reason, now);
    } else {
        let next = policy.next_attempt_at(record.attempts, now);
        record.schedule_retry(next, reason, now);
    }
}

fn non_empty(reason: &str, fallback: &str) -> String {
    if reason.trim().is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed(now: DateTime<Utc>) -> (NotificationRequest, Uuid) {
        let id = NotificationId::parse("n-1").unwrap();
        let mut record = NotificationRequest::new(id, "a@example.com", "Hi", "test", now);
        let token = Uuid::new_v4();
        record.mark_claimed(token, now);
        (record, token)
    }

    #[test]
    fn test_success_counts_attempt() {
        let now = Utc::now();
        let (mut record, _) = claimed(now);
        apply_outcome(&mut record, &DeliveryOutcome::Success, &RetryPolicy::default(), now);
        assert_eq!(record.state, DeliveryState::Delivered);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_retryable_schedules_backoff() {
        let now = Utc::now();
        let (mut record, _) = claimed(now);
        let policy = RetryPolicy::default().without_jitter();
        apply_outcome(&mut record, &DeliveryOutcome::retryable("503"), &policy, now);
        assert_eq!(record.state, DeliveryState::Pending);
        assert_eq!(record.next_attempt_at, now + chrono::Duration::seconds(2));
        assert_eq!(record.last_error.as_deref(), Some("503"));
        assert!(record.claim_token.is_none());
    }

    #[test]
    fn test_retryable_on_last_attempt_fails_permanently() {
        let now = Utc::now();
        let (mut record, _) = claimed(now);
        record.attempts = 7;
        apply_outcome(&mut record, &DeliveryOutcome::retryable("503"), &RetryPolicy::default(), now);
        assert_eq!(record.state, DeliveryState::FailedPermanent);
        assert_eq!(record.attempts, 8);
    }

    #[test]
    fn test_permanent_failure_with_blank_reason_keeps_error() {
        let now = Utc::now();
        let (mut record, _) = claimed(now);
        apply_outcome(&mut record, &DeliveryOutcome::permanent("  "), &RetryPolicy::default(), now);
        assert_eq!(record.state, DeliveryState::FailedPermanent);
        assert_eq!(record.last_error.as_deref(), Some("permanent failure"));
    }

    #[test]
    fn test_ensure_claimed_rejects_foreign_token() {
        let now = Utc::now();
        let (record, token) = claimed(now);
        assert!(ensure_claimed(&record, token).is_ok());
        let err = ensure_claimed(&record, Uuid::new_v4()).unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn test_recovery_makes_record_due_immediately() {
        let now = Utc::now();
        let (mut record, _) = claimed(now);
        apply_recovery(&mut record, &RetryPolicy::default(), now);
        assert_eq!(record.state, DeliveryState::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.next_attempt_at, now);
        assert_eq!(record.last_error.as_deref(), Some(STALE_CLAIM_ERROR));
    }
}
