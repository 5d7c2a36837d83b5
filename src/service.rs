//! Service wiring: database pool, configuration, and the caller-facing
//! operations (schedule, status, listings, statistics).

use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Acquire, SqlitePool,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    envelope::{DeadLetter, Envelope},
    error::Error,
    queue::DelayQueue,
    timing::TimingPreference,
    tracking::{DeliveryStatus, TrackingEntry},
};

/// Longest accepted message body, in bytes.
const MAX_BODY_BYTES: usize = 4096;

pub struct Service {
    db: SqlitePool,
    config: Config,
    queue: DelayQueue,
}

/// Enqueue input, as produced by the message-composition collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub recipient: String,
    pub body: String,
    #[serde(default)]
    pub timing_preference: String,
    #[serde(default)]
    pub caller_reference: String,
    /// Recipient's UTC offset; falls back to the configured default.
    pub utc_offset_minutes: Option<i32>,
}

/// Enqueue output. Delivery itself is asynchronous; this only confirms
/// acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleReceipt {
    pub message_id: Uuid,
    pub target_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Statistics {
    pub queue_depth: i64,
    pub ready: i64,
    pub dead_letters: i64,
    pub queued: i64,
    pub in_flight: i64,
    pub delivered: i64,
    pub failed_retry: i64,
    pub dead_lettered: i64,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            // Shared cache so every pooled connection sees the same
            // in-memory database.
            SqliteConnectOptions::new().in_memory(true).shared_cache(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let queue = DelayQueue::new(config.max_delay());

        Ok(Self {
            db: pool,
            config,
            queue,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &DelayQueue {
        &self.queue
    }

    /// Accepts a message for future delivery.
    ///
    /// Validates the payload, resolves the timing preference, and atomically
    /// creates the tracking entry alongside the first queue envelope. An
    /// unrecognized preference degrades to immediate delivery; a malformed
    /// recipient or body is rejected and never queued.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduleReceipt, Error> {
        let recipient = normalize_recipient(&request.recipient)?;

        let body = request.body.trim();
        if body.is_empty() {
            return Err(Error::validation("message body is empty"));
        }
        if body.len() > MAX_BODY_BYTES {
            return Err(Error::validation(format!(
                "message body exceeds {MAX_BODY_BYTES} bytes"
            )));
        }

        let preference = match TimingPreference::parse(&request.timing_preference) {
            Some(preference) => preference,
            None => {
                warn!(
                    timing_preference = %request.timing_preference,
                    "unrecognized timing preference, sending as soon as possible"
                );
                TimingPreference::Immediate
            }
        };

        let offset_minutes = request
            .utc_offset_minutes
            .unwrap_or(self.config.utc_offset_minutes);
        let offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| Error::invalid_parameter("utc_offset_minutes out of range"))?;

        let now = Utc::now();
        let target_at = preference.resolve(now, offset, self.config.morning_hour);
        let message_id = Uuid::new_v4();

        let envelope = Envelope {
            message_id,
            recipient: recipient.clone(),
            body: body.to_owned(),
            target_at,
            attempt_count: 0,
        };

        let mut tx = self.db.begin().await?;
        TrackingEntry::create(
            tx.acquire().await?,
            message_id,
            &recipient,
            body,
            &request.caller_reference,
            now,
            target_at,
        )
        .await?;
        let delay = self
            .queue
            .push_chained(tx.acquire().await?, &envelope, now)
            .await?;
        tx.commit().await?;

        info!(
            %message_id,
            target_at = %target_at,
            initial_delay_seconds = delay.num_seconds(),
            "message scheduled"
        );

        Ok(ScheduleReceipt {
            message_id,
            target_at,
        })
    }

    /// Tracking record for one message.
    pub async fn status(&self, message_id: Uuid) -> Result<TrackingEntry, Error> {
        let mut conn = self.db.acquire().await?;

        TrackingEntry::get(conn.acquire().await?, message_id)
            .await?
            .ok_or_else(|| Error::message_not_found(message_id))
    }

    pub async fn list_messages(
        &self,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<TrackingEntry>, Error> {
        let mut conn = self.db.acquire().await?;
        TrackingEntry::list(conn.acquire().await?, status).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, Error> {
        let mut conn = self.db.acquire().await?;
        self.queue.list_dead_letters(conn.acquire().await?).await
    }

    pub async fn statistics(&self) -> Result<Statistics, Error> {
        let now = Utc::now();
        let mut conn = self.db.acquire().await?;

        let mut stats = Statistics {
            queue_depth: self.queue.depth(conn.acquire().await?).await?,
            ready: self.queue.ready(conn.acquire().await?, now).await?,
            dead_letters: self.queue.dead_letter_count(conn.acquire().await?).await?,
            ..Statistics::default()
        };

        let counts: Vec<(DeliveryStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM messages GROUP BY status")
                .fetch_all(conn.acquire().await?)
                .await?;

        for (status, count) in counts {
            match status {
                DeliveryStatus::Queued => stats.queued = count,
                DeliveryStatus::InFlight => stats.in_flight = count,
                DeliveryStatus::Delivered => stats.delivered = count,
                DeliveryStatus::FailedRetry => stats.failed_retry = count,
                DeliveryStatus::DeadLettered => stats.dead_lettered = count,
            }
        }

        Ok(stats)
    }
}

/// Normalizes a recipient into `+`-prefixed E.164-style digits.
///
/// A missing leading `+` is tolerated and added; anything else that is not
/// at least nine digits is rejected.
fn normalize_recipient(input: &str) -> Result<String, Error> {
    let trimmed = input.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::validation("recipient must be a phone number"));
    }

    if digits.len() < 9 {
        return Err(Error::validation("recipient number is too short"));
    }

    Ok(format!("+{digits}"))
}
