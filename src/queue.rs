//! The delay queue: a bounded-delay, at-least-once primitive plus the
//! chaining layer that stretches it.
//!
//! The primitive accepts a per-enqueue delay no larger than `max_delay`
//! (the SQS constraint this design grew up on) and hands envelopes out
//! under a visibility lease: a pulled envelope stays hidden until the lease
//! expires or the holder deletes it by receipt. A crashed worker's lease
//! simply lapses and the envelope resurfaces, which is where at-least-once
//! duplicates come from.
//!
//! Arbitrarily long waits are built by delay chaining: enqueue with
//! `min(remaining, max_delay)` and repeat on every dequeue until the target
//! time has passed. Convergence takes `ceil(remaining / max_delay)` hops.
//! An envelope may surface *after* its target (queue jitter, clock skew) but
//! never becomes visible before the delay it was enqueued with has elapsed.
//!
//! Every operation takes `now` explicitly; nothing in here reads the clock.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use crate::{
    envelope::{DeadLetter, Envelope, LeasedEnvelope},
    error::Error,
};

/// Clamps a remaining wait to a single enqueue-able delay.
///
/// Negative remainders (target already passed) become zero so the envelope
/// is immediately visible; anything above `max_delay` is cut to `max_delay`
/// and will re-chain on dequeue.
pub fn chain_delay(remaining: Duration, max_delay: Duration) -> Duration {
    remaining.clamp(Duration::zero(), max_delay)
}

#[derive(Debug, Clone)]
pub struct DelayQueue {
    max_delay: Duration,
}

impl DelayQueue {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Enqueues an envelope with an explicit delay. The primitive rejects
    /// delays beyond its bound; longer waits go through [`Self::push_chained`].
    pub async fn push(
        &self,
        db: &mut SqliteConnection,
        envelope: &Envelope,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        if delay > self.max_delay {
            return Err(Error::DelayTooLong {
                requested_seconds: delay.num_seconds(),
                max_seconds: self.max_delay.num_seconds(),
            });
        }

        let delay = delay.max(Duration::zero());

        sqlx::query(
            "INSERT INTO envelopes (message_id, recipient, body, target_at, attempt_count, available_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(envelope.message_id)
        .bind(&envelope.recipient)
        .bind(&envelope.body)
        .bind(envelope.target_at)
        .bind(envelope.attempt_count)
        .bind(now + delay)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Enqueues toward `envelope.target_at`, clamping the delay to the
    /// native bound. Used at initial enqueue and for every re-chain hop.
    /// Returns the delay actually used.
    pub async fn push_chained(
        &self,
        db: &mut SqliteConnection,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<Duration, Error> {
        let delay = chain_delay(envelope.target_at - now, self.max_delay);
        self.push(db, envelope, delay, now).await?;
        Ok(delay)
    }

    /// Pulls up to `batch` visible envelopes under a lease. A pulled
    /// envelope is hidden from other callers until `now + visibility`
    /// passes or it is acked.
    pub async fn pull(
        &self,
        db: &mut SqliteConnection,
        batch: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedEnvelope>, Error> {
        Ok(sqlx::query_as(
            "UPDATE envelopes SET leased_until = $1
             WHERE id IN (
                 SELECT id FROM envelopes
                 WHERE available_at <= $2 AND (leased_until IS NULL OR leased_until <= $2)
                 ORDER BY available_at
                 LIMIT $3
             )
             RETURNING id AS receipt, message_id, recipient, body, target_at, attempt_count",
        )
        .bind(now + visibility)
        .bind(now)
        .bind(batch as i64)
        .fetch_all(db)
        .await?)
    }

    /// Deletes a pulled envelope by receipt. Idempotent: acking an already
    /// deleted receipt is a no-op.
    pub async fn ack(&self, db: &mut SqliteConnection, receipt: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM envelopes WHERE id = $1")
            .bind(receipt)
            .execute(db)
            .await?;

        Ok(())
    }

    /// Forwards an exhausted or rejected envelope to the dead-letter
    /// channel.
    pub async fn push_dead_letter(
        &self,
        db: &mut SqliteConnection,
        envelope: &Envelope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO dead_letters (message_id, recipient, body, target_at, attempt_count, reason, dead_lettered_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(envelope.message_id)
        .bind(&envelope.recipient)
        .bind(&envelope.body)
        .bind(envelope.target_at)
        .bind(envelope.attempt_count)
        .bind(reason)
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn list_dead_letters(
        &self,
        db: &mut SqliteConnection,
    ) -> Result<Vec<DeadLetter>, Error> {
        Ok(sqlx::query_as(
            "SELECT message_id, recipient, body, target_at, attempt_count, reason, dead_lettered_at
             FROM dead_letters ORDER BY dead_lettered_at",
        )
        .fetch_all(db)
        .await?)
    }

    /// Total envelopes on the queue, visible or not.
    pub async fn depth(&self, db: &mut SqliteConnection) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM envelopes")
            .fetch_one(db)
            .await?)
    }

    /// Envelopes visible for pulling right now.
    pub async fn ready(
        &self,
        db: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<i64, Error> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM envelopes
             WHERE available_at <= $1 AND (leased_until IS NULL OR leased_until <= $1)",
        )
        .bind(now)
        .fetch_one(db)
        .await?)
    }

    pub async fn dead_letter_count(&self, db: &mut SqliteConnection) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(db)
            .await?)
    }
}
