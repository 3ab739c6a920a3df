use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use relay_common::types::{
    DeliveryOutcome, DeliveryState, NotificationId, NotificationRequest, StateCounts,
};

use super::{EnqueueResult, EventStore, apply_outcome, apply_recovery, ensure_claimed};
use crate::backoff::RetryPolicy;
use crate::error::StoreError;

/// Process-local event store.
///
/// Every operation runs to completion under one lock and never awaits while
/// holding it, so claims are serialized. State is lost on restart; use
/// [`PgEventStore`](super::PgEventStore) where durability matters.
pub struct MemoryEventStore {
    policy: RetryPolicy,
    records: Mutex<HashMap<NotificationId, NotificationRequest>>,
}

impl MemoryEventStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn enqueue(&self, request: NotificationRequest) -> Result<EnqueueResult, StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&request.id) {
            return Ok(EnqueueResult { accepted: false });
        }
        records.insert(request.id.clone(), request);
        Ok(EnqueueResult { accepted: true })
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut records = self.records.lock();

        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, NotificationId)> = records
            .values()
            .filter(|r| r.state == DeliveryState::Pending && r.next_attempt_at <= now)
            .map(|r| (r.next_attempt_at, r.created_at, r.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(record) = records.get_mut(&id) {
                record.mark_claimed(Uuid::new_v4(), now);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn record_outcome(
        &self,
        id: &NotificationId,
        claim_token: Uuid,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<NotificationRequest, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        ensure_claimed(record, claim_token)?;
        apply_outcome(record, outcome, &self.policy, now);
        Ok(record.clone())
    }

    async fn release_claim(
        &self,
        id: &NotificationId,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        ensure_claimed(record, claim_token)?;
        record.release(now);
        Ok(())
    }

    async fn renew_claims(
        &self,
        claims: &[(NotificationId, Uuid)],
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationId>, StoreError> {
        let mut records = self.records.lock();
        let mut held = Vec::with_capacity(claims.len());
        for (id, token) in claims {
            if let Some(record) = records.get_mut(id).filter(|r| r.is_claimed_by(*token)) {
                record.claimed_at = Some(now);
                record.updated_at = now;
                held.push(id.clone());
            }
        }
        Ok(held)
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        let mut recovered = 0u64;
        for record in records.values_mut() {
            let abandoned = record.state == DeliveryState::InFlight
                && record.claimed_at.is_some_and(|at| at <= cutoff);
            if abandoned {
                apply_recovery(record, &self.policy, now);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn get(&self, id: &NotificationId) -> Result<Option<NotificationRequest>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
        let records = self.records.lock();
        let mut counts = StateCounts::default();
        for record in records.values() {
            counts.add(record.state, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(id: &str, now: DateTime<Utc>) -> NotificationRequest {
        NotificationRequest::new(
            NotificationId::parse(id).unwrap(),
            "a@example.com",
            "Hi",
            "test",
            now,
        )
    }

    fn store_with(max_attempts: i32) -> MemoryEventStore {
        MemoryEventStore::new(
            RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            }
            .without_jitter(),
        )
    }

    async fn claim_one(store: &MemoryEventStore, now: DateTime<Utc>) -> NotificationRequest {
        let mut batch = store.claim_batch(1, now).await.unwrap();
        assert_eq!(batch.len(), 1, "expected exactly one claimable record");
        batch.remove(0)
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let store = MemoryEventStore::default();
        let now = Utc::now();

        let first = store.enqueue(request("x1", now)).await.unwrap();
        assert!(first.accepted);

        let mut duplicate = request("x1", now + Duration::seconds(5));
        duplicate.subject = "Different".to_string();
        let second = store.enqueue(duplicate).await.unwrap();
        assert!(!second.accepted);

        assert_eq!(store.len(), 1);
        let stored = store.get(&NotificationId::parse("x1").unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.subject, "Hi");
        assert_eq!(stored.created_at, now);
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_non_pending() {
        let store = MemoryEventStore::default();
        let now = Utc::now();

        store.enqueue(request("due", now)).await.unwrap();
        let mut later = request("later", now);
        later.next_attempt_at = now + Duration::minutes(1);
        store.enqueue(later).await.unwrap();

        let batch = store.claim_batch(10, now).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id.as_str(), "due");
        assert_eq!(batch[0].state, DeliveryState::InFlight);
        assert!(batch[0].claim_token.is_some());

        // Already in flight: not claimable again.
        assert!(store.claim_batch(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_orders_by_due_time_and_respects_limit() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        for (id, offset) in [("c", 3), ("a", 1), ("b", 2)] {
            let mut r = request(id, now);
            r.next_attempt_at = now - Duration::seconds(10 - offset);
            store.enqueue(r).await.unwrap();
        }

        let batch = store.claim_batch(2, now).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.claim_batch(0, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outcome_with_wrong_token_is_stale() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        store.enqueue(request("x1", now)).await.unwrap();
        let claimed = claim_one(&store, now).await;

        let err = store
            .record_outcome(&claimed.id, Uuid::new_v4(), &DeliveryOutcome::Success, now)
            .await
            .unwrap_err();
        assert!(err.is_stale());

        let stored = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::InFlight);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn test_outcome_on_delivered_record_is_stale() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        store.enqueue(request("x1", now)).await.unwrap();
        let claimed = claim_one(&store, now).await;
        let token = claimed.claim_token.unwrap();

        store
            .record_outcome(&claimed.id, token, &DeliveryOutcome::Success, now)
            .await
            .unwrap();
        let err = store
            .record_outcome(&claimed.id, token, &DeliveryOutcome::retryable("late"), now)
            .await
            .unwrap_err();
        assert!(err.is_stale());

        let stored = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Delivered);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_id_is_not_found() {
        let store = MemoryEventStore::default();
        let id = NotificationId::parse("ghost").unwrap();
        let err = store
            .record_outcome(&id, Uuid::new_v4(), &DeliveryOutcome::Success, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_bound_reaches_failed_permanent_at_max_attempts() {
        let store = store_with(4);
        let mut now = Utc::now();
        store.enqueue(request("x", now)).await.unwrap();

        for attempt in 1..=4 {
            let claimed = claim_one(&store, now).await;
            let updated = store
                .record_outcome(
                    &claimed.id,
                    claimed.claim_token.unwrap(),
                    &DeliveryOutcome::retryable("503 Service Unavailable"),
                    now,
                )
                .await
                .unwrap();
            assert_eq!(updated.attempts, attempt);
            now = updated.next_attempt_at;
        }

        let stored = store.get(&NotificationId::parse("x").unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::FailedPermanent);
        assert_eq!(stored.attempts, 4);
        assert_eq!(stored.last_error.as_deref(), Some("503 Service Unavailable"));
        assert!(store.claim_batch(10, now + Duration::days(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_attempt_strictly_increases_across_retries() {
        let store = store_with(8);
        let mut now = Utc::now();
        store.enqueue(request("x", now)).await.unwrap();

        let mut previous_delay = chrono::Duration::zero();
        let mut previous_next = now;
        for _ in 0..5 {
            let claimed = claim_one(&store, now).await;
            let updated = store
                .record_outcome(
                    &claimed.id,
                    claimed.claim_token.unwrap(),
                    &DeliveryOutcome::retryable("timeout"),
                    now,
                )
                .await
                .unwrap();
            let delay = updated.next_attempt_at - now;
            assert!(delay > previous_delay);
            assert!(updated.next_attempt_at > previous_next);
            previous_delay = delay;
            previous_next = updated.next_attempt_at;
            now = updated.next_attempt_at;
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_is_immediate() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        store.enqueue(request("x", now)).await.unwrap();
        let claimed = claim_one(&store, now).await;

        let updated = store
            .record_outcome(
                &claimed.id,
                claimed.claim_token.unwrap(),
                &DeliveryOutcome::permanent("550 mailbox unavailable"),
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.state, DeliveryState::FailedPermanent);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.last_error.as_deref(), Some("550 mailbox unavailable"));
    }

    #[tokio::test]
    async fn test_recover_stale_resets_only_expired_claims() {
        let store = MemoryEventStore::default();
        let start = Utc::now();
        store.enqueue(request("old", start)).await.unwrap();
        let old = claim_one(&store, start).await;

        let later = start + Duration::seconds(50);
        store.enqueue(request("fresh", start)).await.unwrap();
        let fresh = claim_one(&store, later).await;

        let now = start + Duration::seconds(70);
        let recovered = store
            .recover_stale(now - Duration::seconds(60), now)
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let old_now = store.get(&old.id).await.unwrap().unwrap();
        assert_eq!(old_now.state, DeliveryState::Pending);
        assert_eq!(old_now.attempts, 1);
        assert_eq!(old_now.last_error.as_deref(), Some(super::super::STALE_CLAIM_ERROR));

        let fresh_now = store.get(&fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh_now.state, DeliveryState::InFlight);

        // Claimable again, and the original worker's late outcome is rejected.
        let reclaimed = claim_one(&store, now).await;
        assert_eq!(reclaimed.id, old.id);
        let err = store
            .record_outcome(&old.id, old.claim_token.unwrap(), &DeliveryOutcome::Success, now)
            .await
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[tokio::test]
    async fn test_recover_stale_on_last_attempt_fails_permanently() {
        let store = store_with(1);
        let now = Utc::now();
        store.enqueue(request("x", now)).await.unwrap();
        let claimed = claim_one(&store, now).await;

        let later = now + Duration::minutes(5);
        assert_eq!(store.recover_stale(later, later).await.unwrap(), 1);

        let stored = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::FailedPermanent);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_renewed_claim_survives_sweep() {
        let store = MemoryEventStore::default();
        let start = Utc::now();
        for id in ["a", "b"] {
            store.enqueue(request(id, start)).await.unwrap();
        }
        let batch = store.claim_batch(2, start).await.unwrap();
        let claims: Vec<(NotificationId, Uuid)> = batch
            .iter()
            .map(|r| (r.id.clone(), r.claim_token.unwrap()))
            .collect();

        let renewed_at = start + Duration::seconds(50);
        let held = store.renew_claims(&claims, renewed_at).await.unwrap();
        assert_eq!(held.len(), 2);

        let now = start + Duration::seconds(70);
        assert_eq!(store.recover_stale(now - Duration::seconds(60), now).await.unwrap(), 0);
        let a = store.get(&claims[0].0).await.unwrap().unwrap();
        assert_eq!(a.state, DeliveryState::InFlight);
        assert_eq!(a.claimed_at, Some(renewed_at));
        assert_eq!(a.attempts, 0);
    }

    #[tokio::test]
    async fn test_renew_skips_lost_claims() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        store.enqueue(request("x", now)).await.unwrap();
        let claimed = claim_one(&store, now).await;
        let token = claimed.claim_token.unwrap();

        let later = now + Duration::minutes(5);
        assert_eq!(store.recover_stale(later, later).await.unwrap(), 1);

        let held = store
            .renew_claims(&[(claimed.id.clone(), token)], later)
            .await
            .unwrap();
        assert!(held.is_empty());
        let stored = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Pending);
        assert!(stored.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_release_claim_keeps_attempts() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        store.enqueue(request("x", now)).await.unwrap();
        let claimed = claim_one(&store, now).await;
        let token = claimed.claim_token.unwrap();

        store.release_claim(&claimed.id, token, now).await.unwrap();
        let stored = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Pending);
        assert_eq!(stored.attempts, 0);

        assert!(store.release_claim(&claimed.id, token, now).await.unwrap_err().is_stale());
    }

    #[tokio::test]
    async fn test_counts_by_state() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            store.enqueue(request(id, now)).await.unwrap();
        }
        let claimed = claim_one(&store, now).await;
        store
            .record_outcome(&claimed.id, claimed.claim_token.unwrap(), &DeliveryOutcome::Success, now)
            .await
            .unwrap();
        claim_one(&store, now).await;

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.delivered, 1);
        assert_eq!(counts.failed_permanent, 0);
    }
}
