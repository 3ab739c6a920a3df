//! Dispatcher: worker pool driving the claim, send, record loop.
//!
//! Workers claim batches from the shared event store, hand each item to the
//! sink under a per-send timeout and report the outcome back under the claim
//! token. A sweeper task periodically recovers claims abandoned by crashed
//! workers. Shutdown is cooperative through a [`CancellationToken`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_common::config::AppConfig;
use relay_common::types::{DeliveryOutcome, DeliveryState, NotificationId, NotificationRequest};
use relay_engine::error::StoreError;
use relay_engine::store::EventStore;

use crate::sink::Sink;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub batch_size: usize,
    /// Sleep after an empty claim.
    pub poll_interval: Duration,
    /// Sleep after a failed claim.
    pub error_backoff: Duration,
    pub send_timeout: Duration,
    /// Age after which an in-flight claim counts as abandoned.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl DispatcherConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            workers: config.dispatcher_workers,
            batch_size: config.dispatcher_batch_size,
            poll_interval: Duration::from_millis(config.dispatcher_poll_interval_ms),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            stale_after: Duration::from_secs(config.stale_after_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            ..Self::default()
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 16,
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Running totals since startup.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    retried: AtomicU64,
    failed_permanent: AtomicU64,
    released: AtomicU64,
    recovered: AtomicU64,
    stale_outcomes: AtomicU64,
    lost_claims: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub delivered: u64,
    pub retried: u64,
    pub failed_permanent: u64,
    pub released: u64,
    pub recovered: u64,
    pub stale_outcomes: u64,
    pub lost_claims: u64,
    pub store_errors: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed_permanent: self.failed_permanent.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            stale_outcomes: self.stale_outcomes.load(Ordering::Relaxed),
            lost_claims: self.lost_claims.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    sink: Arc<dyn Sink>,
    config: DispatcherConfig,
    stats: DispatchStats,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn EventStore>, sink: Arc<dyn Sink>, config: DispatcherConfig) -> Self {
        Self {
            store,
            sink,
            config,
            stats: DispatchStats::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the dispatcher when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run the workers and the recovery sweeper until shutdown.
    ///
    /// Returns early with an error only if the store reports corrupt data, in
    /// which case every other task is cancelled too.
    pub async fn run(self: Arc<Self>) -> Result<(), StoreError> {
        tracing::info!(
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            sink = self.sink.name(),
            "Dispatcher starting"
        );

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.config.workers {
            let dispatcher = self.clone();
            tasks.spawn(async move { dispatcher.worker_loop(worker_id).await });
        }
        let sweeper = self.clone();
        tasks.spawn(async move { sweeper.sweeper_loop().await });

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Dispatcher task failed, shutting down");
                    self.shutdown.cancel();
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Dispatcher task panicked");
                    self.shutdown.cancel();
                }
            }
        }

        tracing::info!(stats = ?self.stats.snapshot(), "Dispatcher stopped");
        result
    }

    async fn worker_loop(&self, worker_id: usize) -> Result<(), StoreError> {
        tracing::debug!(worker_id, "Worker started");

        while !self.shutdown.is_cancelled() {
            let pause = match self.run_once(worker_id).await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => continue,
                Err(err @ StoreError::Corrupt(_)) => return Err(err),
                Err(err) => {
                    DispatchStats::bump(&self.stats.store_errors, 1);
                    tracing::error!(worker_id, error = %err, "Claim failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
        Ok(())
    }

    /// Claim one batch and process it. Returns the number of items sent.
    ///
    /// Items are sent one at a time. Before each send the claims still waiting
    /// in the batch are renewed, so the sweeper only ever sees claims whose
    /// worker stopped. An item whose claim was lost in the meantime is skipped.
    /// If shutdown is signalled mid-batch, the items not yet sent are released
    /// back to pending without using an attempt.
    pub async fn run_once(&self, worker_id: usize) -> Result<usize, StoreError> {
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }

        let batch = self
            .store
            .claim_batch(self.config.batch_size, Utc::now())
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        tracing::debug!(worker_id, claimed = batch.len(), "Claimed batch");

        let mut remaining: VecDeque<NotificationRequest> = batch.into();
        let mut sent = 0;
        while !remaining.is_empty() {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(err) = self.renew_claims(worker_id, &mut remaining).await {
                self.release_all(worker_id, remaining).await;
                return Err(err);
            }
            let Some(item) = remaining.pop_front() else {
                break;
            };
            self.process(worker_id, item).await;
            sent += 1;
        }
        self.release_all(worker_id, remaining).await;

        Ok(sent)
    }

    /// Recover abandoned claims once. Returns the number of records touched.
    pub async fn sweep_stale(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = now - to_chrono(self.config.stale_after);
        let recovered = self.store.recover_stale(cutoff, now).await?;
        if recovered > 0 {
            DispatchStats::bump(&self.stats.recovered, recovered);
            tracing::warn!(recovered, "Recovered abandoned in-flight notifications");
        }
        Ok(recovered)
    }

    /// Sweeps once at startup, so claims orphaned by a previous crash are
    /// picked up without waiting a full interval.
    async fn sweeper_loop(&self) -> Result<(), StoreError> {
        loop {
            match self.sweep_stale().await {
                Ok(_) => {}
                Err(err @ StoreError::Corrupt(_)) => return Err(err),
                Err(err) => {
                    DispatchStats::bump(&self.stats.store_errors, 1);
                    tracing::error!(error = %err, "Stale claim sweep failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn process(&self, worker_id: usize, item: NotificationRequest) {
        let Some(token) = item.claim_token else {
            tracing::error!(worker_id, notification_id = %item.id, "Claimed item has no claim token");
            return;
        };

        let outcome = match tokio::time::timeout(self.config.send_timeout, self.sink.send(&item)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::retryable("timeout"),
        };

        match self
            .store
            .record_outcome(&item.id, token, &outcome, Utc::now())
            .await
        {
            Ok(updated) => self.observe(worker_id, &updated),
            Err(err) if err.is_stale() => {
                DispatchStats::bump(&self.stats.stale_outcomes, 1);
                tracing::warn!(worker_id, notification_id = %item.id, error = %err, "Discarding stale outcome");
            }
            Err(err) => {
                // Left in flight; the sweeper picks it up.
                DispatchStats::bump(&self.stats.store_errors, 1);
                tracing::error!(worker_id, notification_id = %item.id, error = %err, "Failed to record outcome");
            }
        }
    }

    fn observe(&self, worker_id: usize, updated: &NotificationRequest) {
        match updated.state {
            DeliveryState::Delivered => {
                DispatchStats::bump(&self.stats.delivered, 1);
                tracing::info!(
                    worker_id,
                    notification_id = %updated.id,
                    attempts = updated.attempts,
                    "Notification delivered"
                );
            }
            DeliveryState::Pending => {
                DispatchStats::bump(&self.stats.retried, 1);
                tracing::warn!(
                    worker_id,
                    notification_id = %updated.id,
                    attempts = updated.attempts,
                    next_attempt_at = %updated.next_attempt_at,
                    error = updated.last_error.as_deref().unwrap_or_default(),
                    "Delivery failed, will retry"
                );
            }
            DeliveryState::FailedPermanent => {
                DispatchStats::bump(&self.stats.failed_permanent, 1);
                tracing::error!(
                    worker_id,
                    notification_id = %updated.id,
                    attempts = updated.attempts,
                    error = updated.last_error.as_deref().unwrap_or_default(),
                    "Notification failed permanently"
                );
            }
            DeliveryState::InFlight => {}
        }
    }

    async fn release(&self, worker_id: usize, item: NotificationRequest) {
        let Some(token) = item.claim_token else {
            return;
        };
        match self.store.release_claim(&item.id, token, Utc::now()).await {
            Ok(()) => {
                DispatchStats::bump(&self.stats.released, 1);
                tracing::debug!(worker_id, notification_id = %item.id, "Released unsent claim");
            }
            Err(err) => {
                tracing::warn!(worker_id, notification_id = %item.id, error = %err, "Failed to release claim");
            }
        }
    }

    async fn release_all(&self, worker_id: usize, items: VecDeque<NotificationRequest>) {
        for item in items {
            self.release(worker_id, item).await;
        }
    }

    /// Refresh the claims of `remaining` and drop the items no longer held.
    async fn renew_claims(
        &self,
        worker_id: usize,
        remaining: &mut VecDeque<NotificationRequest>,
    ) -> Result<(), StoreError> {
        let claims: Vec<(NotificationId, Uuid)> = remaining
            .iter()
            .filter_map(|item| item.claim_token.map(|token| (item.id.clone(), token)))
            .collect();
        let held: HashSet<NotificationId> = self
            .store
            .renew_claims(&claims, Utc::now())
            .await?
            .into_iter()
            .collect();

        remaining.retain(|item| {
            let kept = held.contains(&item.id);
            if !kept {
                DispatchStats::bump(&self.stats.lost_claims, 1);
                tracing::warn!(worker_id, notification_id = %item.id, "Claim lost before send, skipping");
            }
            kept
        });
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
