//! Queue envelope types.
//!
//! An [`Envelope`] is the unit placed on the delay queue. It carries enough
//! of the scheduled message to act on dequeue without a ledger read, and it
//! has no identity of its own: at-least-once delivery and re-chaining mean
//! any number of envelopes for one `message_id` can be in flight at once.
//! The tracking ledger is what collapses them safely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

/// Wire shape of a queued delivery.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Envelope {
    pub message_id: Uuid,
    pub recipient: String,
    pub body: String,
    /// Absolute delivery target. Readiness is always judged against this,
    /// never against queue arrival time.
    pub target_at: DateTime<Utc>,
    /// Send attempts so far. Carried for observability; the ledger's count
    /// is authoritative. Re-chaining never increments it.
    pub attempt_count: i64,
}

/// An envelope pulled under a visibility lease. The receipt handle deletes
/// exactly this queue row, not the message.
#[derive(Debug, Clone, FromRow)]
pub struct LeasedEnvelope {
    pub receipt: i64,
    #[sqlx(flatten)]
    pub envelope: Envelope,
}

/// A dead-lettered envelope, as exposed to the out-of-band consumer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub recipient: String,
    pub body: String,
    pub target_at: DateTime<Utc>,
    pub attempt_count: i64,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}
