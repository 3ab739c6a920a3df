use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use relay_common::types::{
    DeliveryOutcome, DeliveryState, NotificationId, NotificationRequest, StateCounts,
};

use super::{EnqueueResult, EventStore, STALE_CLAIM_ERROR, apply_outcome, ensure_claimed};
use crate::backoff::RetryPolicy;
use crate::error::StoreError;

const COLUMNS: &str = "id, recipient, subject, body, event_type, state, attempts, \
    next_attempt_at, last_error, claimed_at, claim_token, created_at, updated_at";

/// Durable event store on PostgreSQL (`notifications` table).
///
/// Claims use `FOR UPDATE SKIP LOCKED` so concurrent dispatchers, in this
/// process or others, partition the pending rows between them.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgEventStore {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn update_claimed(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &NotificationRequest,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET state = $2, attempts = $3, next_attempt_at = $4, last_error = $5,
                claimed_at = $6, claim_token = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(record.state.to_string())
        .bind(record.attempts)
        .bind(record.next_attempt_at)
        .bind(&record.last_error)
        .bind(record.claimed_at)
        .bind(record.claim_token)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn lock_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: &NotificationId,
    ) -> Result<NotificationRequest, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, NotificationRequest>(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn enqueue(&self, request: NotificationRequest) -> Result<EnqueueResult, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications
                (id, recipient, subject, body, event_type, state, attempts,
                 next_attempt_at, last_error, claimed_at, claim_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&request.id)
        .bind(&request.recipient)
        .bind(&request.subject)
        .bind(&request.body)
        .bind(&request.event_type)
        .bind(request.state.to_string())
        .bind(request.attempts)
        .bind(request.next_attempt_at)
        .bind(&request.last_error)
        .bind(request.claimed_at)
        .bind(request.claim_token)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(EnqueueResult {
            accepted: result.rows_affected() == 1,
        })
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM notifications
            WHERE state = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        // Each row gets its own token so a later recovery + re-claim of one row
        // cannot be confused with the rest of this batch.
        let sql = format!(
            r#"
            UPDATE notifications
            SET state = 'in_flight', claimed_at = $2, claim_token = gen_random_uuid(), updated_at = $2
            WHERE id = ANY($1)
            RETURNING {COLUMNS}
            "#
        );
        let mut claimed = sqlx::query_as::<_, NotificationRequest>(&sql)
            .bind(&ids)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        claimed.sort_by(|a, b| {
            (a.next_attempt_at, a.created_at).cmp(&(b.next_attempt_at, b.created_at))
        });
        tracing::debug!(claimed = claimed.len(), "Claimed notifications");
        Ok(claimed)
    }

    async fn record_outcome(
        &self,
        id: &NotificationId,
        claim_token: Uuid,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<NotificationRequest, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::lock_row(&mut tx, id).await?;

        if let Err(err) = ensure_claimed(&record, claim_token) {
            tx.rollback().await?;
            return Err(err);
        }

        apply_outcome(&mut record, outcome, &self.policy, now);
        Self::update_claimed(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn release_claim(
        &self,
        id: &NotificationId,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::lock_row(&mut tx, id).await?;

        if let Err(err) = ensure_claimed(&record, claim_token) {
            tx.rollback().await?;
            return Err(err);
        }

        record.release(now);
        Self::update_claimed(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn renew_claims(
        &self,
        claims: &[(NotificationId, Uuid)],
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationId>, StoreError> {
        if claims.is_empty() {
            return Ok(Vec::new());
        }

        let (ids, tokens): (Vec<String>, Vec<Uuid>) = claims
            .iter()
            .map(|(id, token)| (id.as_str().to_string(), *token))
            .unzip();

        let held = sqlx::query_scalar::<_, NotificationId>(
            r#"
            UPDATE notifications AS n
            SET claimed_at = $3, updated_at = $3
            FROM UNNEST($1::text[], $2::uuid[]) AS c(id, claim_token)
            WHERE n.id = c.id AND n.claim_token = c.claim_token AND n.state = 'in_flight'
            RETURNING n.id
            "#,
        )
        .bind(&ids)
        .bind(&tokens)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(held)
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        // `attempts` on the right-hand side is the pre-update value.
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET attempts = attempts + 1,
                state = CASE WHEN attempts + 1 >= $3 THEN 'failed_permanent' ELSE 'pending' END,
                next_attempt_at = CASE WHEN attempts + 1 >= $3 THEN next_attempt_at ELSE $2 END,
                last_error = $4,
                claimed_at = NULL,
                claim_token = NULL,
                updated_at = $2
            WHERE state = 'in_flight' AND claimed_at <= $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(self.policy.max_attempts)
        .bind(STALE_CLAIM_ERROR)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &NotificationId) -> Result<Option<NotificationRequest>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1");
        let record = sqlx::query_as::<_, NotificationRequest>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM notifications GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StateCounts::default();
        for (state, n) in rows {
            let state: DeliveryState = state
                .parse()
                .map_err(StoreError::Corrupt)?;
            counts.add(state, n.max(0) as u64);
        }
        Ok(counts)
    }
}
