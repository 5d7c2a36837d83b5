//! The tracking ledger: authoritative delivery status, one row per message.
//!
//! The queue underneath is at-least-once, so any envelope can surface more
//! than once and chained duplicates can overlap. Every worker decision is
//! therefore gated on this ledger, and every mutation is a compare-and-set:
//! a conditional `UPDATE` that succeeds only if the row still holds the
//! expected status. Losing a race is not an error, it means another worker
//! got there first.
//!
//! # Status lifecycle
//!
//! `queued -> in_flight -> delivered`
//! `queued -> in_flight -> failed_retry -> in_flight -> ...`
//! `queued -> in_flight -> dead_lettered`
//!
//! `delivered` and `dead_lettered` are absorbing: no transition leaves them.
//! `attempts` increments exactly once per `-> in_flight` transition, never
//! on re-chaining.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use uuid::Uuid;

use crate::error::Error;

/// Current delivery status of a scheduled message.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::EnumString,
    strum::Display,
)]
#[sqlx(type_name = "text")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting on the delay queue, possibly mid-chain.
    #[serde(rename = "queued")]
    #[sqlx(rename = "queued")]
    Queued,
    /// A worker holds the send; guards against concurrent duplicates.
    #[serde(rename = "in_flight")]
    #[sqlx(rename = "in_flight")]
    InFlight,
    /// Accepted by the gateway. Terminal.
    #[serde(rename = "delivered")]
    #[sqlx(rename = "delivered")]
    Delivered,
    /// A transient failure occurred; a retry envelope is on the queue.
    #[serde(rename = "failed_retry")]
    #[sqlx(rename = "failed_retry")]
    FailedRetry,
    /// Retries exhausted or failure was permanent. Terminal.
    #[serde(rename = "dead_lettered")]
    #[sqlx(rename = "dead_lettered")]
    DeadLettered,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered)
    }
}

/// The ledger record for one scheduled message. This is also the shape
/// exposed to status queries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrackingEntry {
    pub message_id: Uuid,
    pub recipient: String,
    pub body: String,
    pub caller_reference: String,
    pub created_at: DateTime<Utc>,
    pub target_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub provider_reference: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl TrackingEntry {
    /// Creates the ledger row. Idempotent: a second create for the same
    /// `message_id` is a no-op and the first writer wins.
    pub async fn create(
        db: &mut SqliteConnection,
        message_id: Uuid,
        recipient: &str,
        body: &str,
        caller_reference: &str,
        created_at: DateTime<Utc>,
        target_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO messages (message_id, recipient, body, caller_reference, created_at, target_at, status)
             VALUES ($1, $2, $3, $4, $5, $6, 'queued')
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(recipient)
        .bind(body)
        .bind(caller_reference)
        .bind(created_at)
        .bind(target_at)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(
        db: &mut SqliteConnection,
        message_id: Uuid,
    ) -> Result<Option<Self>, Error> {
        Ok(sqlx::query_as(
            "SELECT message_id, recipient, body, caller_reference, created_at, target_at,
                    status, attempts, last_error, provider_reference, delivered_at
             FROM messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(db)
        .await?)
    }

    /// Claims the send: `queued`/`failed_retry` -> `in_flight`, incrementing
    /// `attempts`. Returns the new attempt count, or `None` if another
    /// worker already owns the transition (the caller must abort without
    /// side effects).
    pub async fn begin_attempt(
        db: &mut SqliteConnection,
        message_id: Uuid,
    ) -> Result<Option<i64>, Error> {
        Ok(sqlx::query_scalar(
            "UPDATE messages
             SET status = 'in_flight', attempts = attempts + 1
             WHERE message_id = $1 AND status IN ('queued', 'failed_retry')
             RETURNING attempts",
        )
        .bind(message_id)
        .fetch_optional(db)
        .await?)
    }

    /// `in_flight` -> `delivered`. Records `delivered_at` and the gateway's
    /// reference; clears any stale error. Returns false if the row was not
    /// `in_flight`, which leaves the ledger untouched.
    pub async fn mark_delivered(
        db: &mut SqliteConnection,
        message_id: Uuid,
        provider_reference: &str,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE messages
             SET status = 'delivered', provider_reference = $2, delivered_at = $3, last_error = NULL
             WHERE message_id = $1 AND status = 'in_flight'",
        )
        .bind(message_id)
        .bind(provider_reference)
        .bind(delivered_at)
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_flight` -> `failed_retry`, recording the failure.
    pub async fn mark_failed_retry(
        db: &mut SqliteConnection,
        message_id: Uuid,
        error: &str,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE messages
             SET status = 'failed_retry', last_error = $2
             WHERE message_id = $1 AND status = 'in_flight'",
        )
        .bind(message_id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_flight` -> `dead_lettered`. Terminal.
    pub async fn mark_dead_lettered(
        db: &mut SqliteConnection,
        message_id: Uuid,
        error: &str,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE messages
             SET status = 'dead_lettered', last_error = $2
             WHERE message_id = $1 AND status = 'in_flight'",
        )
        .bind(message_id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn list(
        db: &mut SqliteConnection,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<Self>, Error> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT message_id, recipient, body, caller_reference, created_at, target_at,
                            status, attempts, last_error, provider_reference, delivered_at
                     FROM messages WHERE status = $1 ORDER BY created_at",
                )
                .bind(status)
                .fetch_all(db)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT message_id, recipient, body, caller_reference, created_at, target_at,
                            status, attempts, last_error, provider_reference, delivered_at
                     FROM messages ORDER BY created_at",
                )
                .fetch_all(db)
                .await?
            }
        };

        Ok(rows)
    }
}
