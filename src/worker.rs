//! Delivery workers.
//!
//! Workers are independent consumers of the delay queue. They share no
//! in-process state; every decision is coordinated through conditional
//! writes to the tracking ledger, so any number of workers (in this process
//! or another) can pull the same queue safely. The visibility lease only
//! reduces duplicate work, it is never what correctness rests on.
//!
//! Per envelope, in order: terminal short-circuit, early re-chain,
//! compare-and-set claim, bounded gateway send, then exactly one of
//! delivered / retry re-enqueue / dead-letter.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use sqlx::{Acquire, SqlitePool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    envelope::{Envelope, LeasedEnvelope},
    error::Error,
    gateway::{Gateway, SendError},
    queue::DelayQueue,
    tracking::TrackingEntry,
};

/// Spawns and supervises the worker pool.
pub struct DeliveryEngine {
    db: SqlitePool,
    config: Config,
    queue: DelayQueue,
    gateway: Arc<dyn Gateway>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl DeliveryEngine {
    pub fn new(db: SqlitePool, config: Config, gateway: Arc<dyn Gateway>) -> Self {
        let queue = DelayQueue::new(config.max_delay());

        Self {
            db,
            config,
            queue,
            gateway,
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Spawns the configured number of workers and returns immediately.
    pub fn start(&mut self) {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting delivery workers"
        );

        for worker_id in 0..self.config.worker_count {
            let worker = self.worker(worker_id);

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }
    }

    /// Signals all workers to stop and waits for in-flight envelopes to
    /// finish.
    pub async fn shutdown(self) {
        info!("shutting down delivery workers");
        self.cancellation_token.cancel();

        for handle in self.worker_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "delivery worker panicked");
            }
        }
    }

    /// Processes exactly one batch on the calling task. Drives deterministic
    /// tests; production uses [`Self::start`].
    pub async fn process_batch(&self) -> Result<usize, Error> {
        self.worker(0).process_batch().await
    }

    fn worker(&self, id: usize) -> DeliveryWorker {
        DeliveryWorker {
            id,
            db: self.db.clone(),
            config: self.config.clone(),
            queue: self.queue.clone(),
            gateway: self.gateway.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }
}

/// A single delivery worker.
pub struct DeliveryWorker {
    id: usize,
    db: SqlitePool,
    config: Config,
    queue: DelayQueue,
    gateway: Arc<dyn Gateway>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Pull-process loop until cancelled.
    pub async fn run(&self) {
        info!(worker_id = self.id, "delivery worker starting");

        let poll_interval = std::time::Duration::from_secs(self.config.poll_interval_seconds);

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = tokio::time::sleep(poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "batch processing failed");
                    tokio::select! {
                        () = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
    }

    /// Pulls one batch under a lease and works through it. Returns how many
    /// envelopes were pulled.
    pub async fn process_batch(&self) -> Result<usize, Error> {
        let now = Utc::now();

        let batch = {
            let mut conn = self.db.acquire().await?;
            self.queue
                .pull(
                    conn.acquire().await?,
                    self.config.batch_size,
                    self.config.visibility_timeout(),
                    now,
                )
                .await?
        };

        let pulled = batch.len();
        if pulled > 0 {
            debug!(worker_id = self.id, batch_size = pulled, "processing batch");
        }

        for leased in batch {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(e) = self.process_envelope(&leased).await {
                error!(
                    worker_id = self.id,
                    message_id = %leased.envelope.message_id,
                    error = %e,
                    "envelope processing failed"
                );
            }
        }

        Ok(pulled)
    }

    async fn process_envelope(&self, leased: &LeasedEnvelope) -> Result<(), Error> {
        let envelope = &leased.envelope;
        let now = Utc::now();
        let mut conn = self.db.acquire().await?;

        let entry = TrackingEntry::get(conn.acquire().await?, envelope.message_id).await?;

        let Some(entry) = entry else {
            // Ledger row gone (external retention); the envelope is orphaned.
            warn!(
                worker_id = self.id,
                message_id = %envelope.message_id,
                "dropping envelope without tracking entry"
            );
            return self.queue.ack(conn.acquire().await?, leased.receipt).await;
        };

        // Idempotency guard: duplicates of an already-settled message are
        // acked and dropped without touching the gateway.
        if entry.status.is_terminal() {
            debug!(
                worker_id = self.id,
                message_id = %envelope.message_id,
                status = %entry.status,
                "dropping duplicate envelope for settled message"
            );
            return self.queue.ack(conn.acquire().await?, leased.receipt).await;
        }

        // Not due yet: chain another hop and retire this envelope. The
        // re-chained copy is the instance of record from here on.
        let remaining = envelope.target_at - now;
        if remaining > Duration::zero() {
            let mut tx = conn.begin().await?;
            let delay = self
                .queue
                .push_chained(tx.acquire().await?, envelope, now)
                .await?;
            self.queue.ack(tx.acquire().await?, leased.receipt).await?;
            tx.commit().await?;

            debug!(
                worker_id = self.id,
                message_id = %envelope.message_id,
                remaining_seconds = remaining.num_seconds(),
                delay_seconds = delay.num_seconds(),
                "re-chained envelope"
            );
            return Ok(());
        }

        // Claim the send. Losing means another worker holds a duplicate and
        // is already past this point; ack and walk away.
        let attempts =
            TrackingEntry::begin_attempt(conn.acquire().await?, envelope.message_id).await?;

        let Some(attempts) = attempts else {
            debug!(
                worker_id = self.id,
                message_id = %envelope.message_id,
                "lost send claim to a concurrent worker"
            );
            return self.queue.ack(conn.acquire().await?, leased.receipt).await;
        };

        let outcome = self.send_bounded(envelope).await;

        match outcome {
            Ok(reference) => {
                let delivered_at = Utc::now();
                let mut tx = conn.begin().await?;
                let updated = TrackingEntry::mark_delivered(
                    tx.acquire().await?,
                    envelope.message_id,
                    &reference.0,
                    delivered_at,
                )
                .await?;
                self.queue.ack(tx.acquire().await?, leased.receipt).await?;
                tx.commit().await?;

                if !updated {
                    warn!(
                        worker_id = self.id,
                        message_id = %envelope.message_id,
                        "delivered but ledger was no longer in_flight"
                    );
                }

                info!(
                    worker_id = self.id,
                    message_id = %envelope.message_id,
                    provider_reference = %reference,
                    attempt = attempts,
                    "message delivered"
                );
            }
            Err(e) if e.is_transient() && attempts < i64::from(self.config.max_attempts) => {
                let delay = self.retry_delay(attempts);
                let retry = Envelope {
                    attempt_count: attempts,
                    ..envelope.clone()
                };

                let mut tx = conn.begin().await?;
                TrackingEntry::mark_failed_retry(
                    tx.acquire().await?,
                    envelope.message_id,
                    &e.to_string(),
                )
                .await?;
                self.queue
                    .push(tx.acquire().await?, &retry, delay, Utc::now())
                    .await?;
                self.queue.ack(tx.acquire().await?, leased.receipt).await?;
                tx.commit().await?;

                warn!(
                    worker_id = self.id,
                    message_id = %envelope.message_id,
                    attempt = attempts,
                    retry_delay_seconds = delay.num_seconds(),
                    error = %e,
                    "send failed, retry scheduled"
                );
            }
            Err(e) => {
                // Permanent failure, or the attempt budget is spent.
                let reason = if e.is_transient() {
                    format!("retries exhausted after {attempts} attempts: {e}")
                } else {
                    e.to_string()
                };
                let dead = Envelope {
                    attempt_count: attempts,
                    ..envelope.clone()
                };

                let mut tx = conn.begin().await?;
                TrackingEntry::mark_dead_lettered(
                    tx.acquire().await?,
                    envelope.message_id,
                    &reason,
                )
                .await?;
                self.queue
                    .push_dead_letter(tx.acquire().await?, &dead, &reason, Utc::now())
                    .await?;
                self.queue.ack(tx.acquire().await?, leased.receipt).await?;
                tx.commit().await?;

                error!(
                    worker_id = self.id,
                    message_id = %envelope.message_id,
                    attempt = attempts,
                    error = %e,
                    "message dead-lettered"
                );
            }
        }

        Ok(())
    }

    /// Gateway send bounded by the configured per-call timeout. A timeout is
    /// a transient failure like any other.
    async fn send_bounded(&self, envelope: &Envelope) -> Result<crate::gateway::ProviderReference, SendError> {
        let timeout = std::time::Duration::from_secs(self.config.gateway_timeout_seconds);
        let send = self.gateway.send(&envelope.recipient, &envelope.body);

        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(SendError::transient(format!(
                "gateway call exceeded {}s timeout",
                self.config.gateway_timeout_seconds
            ))),
        }
    }

    fn retry_delay(&self, attempts: i64) -> Duration {
        retry_delay(
            attempts,
            Duration::seconds(self.config.retry_base_delay_seconds as i64),
            self.config.max_delay(),
            self.config.retry_jitter,
        )
    }
}

/// Exponential backoff for transient failures: `base * 2^(attempts - 1)`,
/// capped at the queue's native delay bound (a retry is a single enqueue,
/// never a chain), with fractional jitter to spread synchronized retries.
fn retry_delay(attempts: i64, base: Duration, max: Duration, jitter: f64) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
    let scaled = base
        .checked_mul(2_i32.saturating_pow(exponent))
        .unwrap_or(max);
    let capped = scaled.min(max);

    if jitter <= 0.0 {
        return capped;
    }

    let jitter = jitter.clamp(0.0, 1.0);
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    let jittered = capped.num_milliseconds() as f64 * (1.0 + offset);

    Duration::milliseconds(jittered.max(0.0) as i64).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially_without_jitter() {
        let base = Duration::seconds(30);
        let max = Duration::seconds(900);

        assert_eq!(retry_delay(1, base, max, 0.0), Duration::seconds(30));
        assert_eq!(retry_delay(2, base, max, 0.0), Duration::seconds(60));
        assert_eq!(retry_delay(3, base, max, 0.0), Duration::seconds(120));
        assert_eq!(retry_delay(4, base, max, 0.0), Duration::seconds(240));
    }

    #[test]
    fn retry_delay_caps_at_queue_bound() {
        let base = Duration::seconds(30);
        let max = Duration::seconds(900);

        assert_eq!(retry_delay(10, base, max, 0.0), max);
        assert_eq!(retry_delay(60, base, max, 0.0), max);
    }

    #[test]
    fn retry_delay_jitter_stays_within_bounds() {
        let base = Duration::seconds(100);
        let max = Duration::seconds(900);

        for attempts in 1..=6 {
            for _ in 0..50 {
                let delay = retry_delay(attempts, base, max, 0.25);
                assert!(delay >= Duration::zero());
                assert!(delay <= max, "jittered delay exceeded queue bound");
            }
        }
    }
}
