use std::{ops::Deref, sync::Arc};

use chrono::{Duration, Utc};
use driftq::{
    config::Config,
    envelope::Envelope,
    error::Error,
    gateway::{memory::InMemoryGateway, SendError},
    service::{ScheduleRequest, Service},
    tracking::{DeliveryStatus, TrackingEntry},
    worker::DeliveryEngine,
};
use sqlx::Acquire;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    svc: Service,
    engine: DeliveryEngine,
    gateway: InMemoryGateway,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for Harness {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup() -> Harness {
    let path = tempfile::tempdir().unwrap();

    let config = Config {
        db_path: Some(path.path().join("driftq.db").to_string_lossy().to_string()),
        // Immediate, deterministic retries so tests never sleep.
        retry_base_delay_seconds: 0,
        retry_jitter: 0.0,
        ..Config::default()
    };

    let svc = Service::connect_with(config.clone()).await.unwrap();
    let gateway = InMemoryGateway::new();
    let engine = DeliveryEngine::new(svc.db().clone(), config, Arc::new(gateway.clone()));

    Harness {
        svc,
        engine,
        gateway,
        tmpdir: path,
    }
}

fn request(timing_preference: &str) -> ScheduleRequest {
    ScheduleRequest {
        recipient: "+15551234567".to_owned(),
        body: "Your application is ready for review.".to_owned(),
        timing_preference: timing_preference.to_owned(),
        caller_reference: "intake-42".to_owned(),
        utc_offset_minutes: None,
    }
}

#[tokio::test]
async fn immediate_message_is_delivered() {
    let h = setup().await;

    let receipt = h.schedule(request("as soon as possible")).await.unwrap();

    let processed = h.engine.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    let entry = h.status(receipt.message_id).await.unwrap();
    assert_eq!(entry.status, DeliveryStatus::Delivered);
    assert_eq!(entry.attempts, 1);
    assert!(entry.delivered_at.is_some());
    assert!(entry.provider_reference.is_some());
    assert!(entry.last_error.is_none());

    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "+15551234567");

    // The envelope was acked; the queue is drained.
    assert_eq!(h.statistics().await.unwrap().queue_depth, 0);
}

#[tokio::test]
async fn replayed_envelope_never_sends_twice() {
    let h = setup().await;

    let receipt = h.schedule(request("as soon as possible")).await.unwrap();
    h.engine.process_batch().await.unwrap();

    let delivered = h.status(receipt.message_id).await.unwrap();
    assert_eq!(delivered.status, DeliveryStatus::Delivered);

    // At-least-once redelivery: the same envelope surfaces again.
    let duplicate = Envelope {
        message_id: receipt.message_id,
        recipient: delivered.recipient.clone(),
        body: delivered.body.clone(),
        target_at: delivered.target_at,
        attempt_count: 1,
    };
    let now = Utc::now();
    let mut conn = h.db().acquire().await.unwrap();
    h.queue()
        .push(conn.acquire().await.unwrap(), &duplicate, Duration::zero(), now)
        .await
        .unwrap();
    drop(conn);

    let processed = h.engine.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    // No second send, and the delivery record is untouched.
    assert_eq!(h.gateway.sent_count(), 1);
    let after = h.status(receipt.message_id).await.unwrap();
    assert_eq!(after.delivered_at, delivered.delivered_at);
    assert_eq!(after.attempts, 1);
    assert_eq!(h.statistics().await.unwrap().queue_depth, 0);
}

#[tokio::test]
async fn transient_failures_exhaust_into_dead_letter() {
    let h = setup().await;

    // Every attempt fails with a retryable error.
    for _ in 0..3 {
        h.gateway
            .push_failure(SendError::transient("rate limited"));
    }

    let receipt = h.schedule(request("as soon as possible")).await.unwrap();

    // Attempt 1 and 2: failed_retry with a fresh envelope on the queue.
    for expected_attempts in 1..=2 {
        let processed = h.engine.process_batch().await.unwrap();
        assert_eq!(processed, 1);

        let entry = h.status(receipt.message_id).await.unwrap();
        assert_eq!(entry.status, DeliveryStatus::FailedRetry);
        assert_eq!(entry.attempts, expected_attempts);
        assert_eq!(h.statistics().await.unwrap().queue_depth, 1);
    }

    // Attempt 3 exhausts the budget.
    h.engine.process_batch().await.unwrap();

    let entry = h.status(receipt.message_id).await.unwrap();
    assert_eq!(entry.status, DeliveryStatus::DeadLettered);
    assert_eq!(entry.attempts, 3);
    assert!(entry
        .last_error
        .as_deref()
        .unwrap()
        .contains("retries exhausted"));

    let letters = h.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, receipt.message_id);
    assert_eq!(letters[0].attempt_count, 3);

    // Nothing was ever handed to the provider, and nothing is left queued.
    assert_eq!(h.gateway.sent_count(), 0);
    assert_eq!(h.statistics().await.unwrap().queue_depth, 0);

    // Settled for good: one more batch finds nothing to do.
    assert_eq!(h.engine.process_batch().await.unwrap(), 0);
}

#[tokio::test]
async fn permanent_failure_dead_letters_without_retry() {
    let h = setup().await;

    h.gateway
        .push_failure(SendError::permanent("invalid recipient"));

    let receipt = h.schedule(request("as soon as possible")).await.unwrap();
    h.engine.process_batch().await.unwrap();

    let entry = h.status(receipt.message_id).await.unwrap();
    assert_eq!(entry.status, DeliveryStatus::DeadLettered);
    // No retry loop for permanent failures: exactly one attempt.
    assert_eq!(entry.attempts, 1);

    assert_eq!(h.dead_letters().await.unwrap().len(), 1);
    assert_eq!(h.gateway.sent_count(), 0);
    assert_eq!(h.statistics().await.unwrap().queue_depth, 0);
}

#[tokio::test]
async fn early_envelope_rechains_without_attempting() {
    let h = setup().await;

    // Two hours out: the initial envelope parks at the 15-minute bound.
    let receipt = h.schedule(request("2 hours")).await.unwrap();

    let target = receipt.target_at;
    let now = Utc::now();
    assert!(target - now > Duration::minutes(119));
    assert!(target - now <= Duration::hours(2));

    // Not due: the worker sees nothing.
    assert_eq!(h.engine.process_batch().await.unwrap(), 0);

    // Simulate a duplicate surfacing early (lease lapse, queue jitter).
    let duplicate = Envelope {
        message_id: receipt.message_id,
        recipient: "+15551234567".to_owned(),
        body: "Your application is ready for review.".to_owned(),
        target_at: target,
        attempt_count: 0,
    };
    let mut conn = h.db().acquire().await.unwrap();
    h.queue()
        .push(conn.acquire().await.unwrap(), &duplicate, Duration::zero(), now)
        .await
        .unwrap();
    drop(conn);

    let processed = h.engine.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    // Re-chained, not attempted: no send, no attempt counted, and the
    // replacement envelope is parked again.
    assert_eq!(h.gateway.sent_count(), 0);
    let entry = h.status(receipt.message_id).await.unwrap();
    assert_eq!(entry.status, DeliveryStatus::Queued);
    assert_eq!(entry.attempts, 0);

    let stats = h.statistics().await.unwrap();
    assert_eq!(stats.queue_depth, 2);
    assert_eq!(stats.ready, 0);
}

#[tokio::test]
async fn losing_the_send_claim_aborts_without_sending() {
    let h = setup().await;

    let receipt = h.schedule(request("as soon as possible")).await.unwrap();

    // Another worker already claimed the send: the ledger is in_flight.
    let mut conn = h.db().acquire().await.unwrap();
    let attempts = TrackingEntry::begin_attempt(conn.acquire().await.unwrap(), receipt.message_id)
        .await
        .unwrap();
    assert_eq!(attempts, Some(1));
    drop(conn);

    let processed = h.engine.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    // The losing worker acked its envelope and made no send of its own.
    assert_eq!(h.gateway.sent_count(), 0);
    assert_eq!(h.statistics().await.unwrap().queue_depth, 0);

    let entry = h.status(receipt.message_id).await.unwrap();
    assert_eq!(entry.status, DeliveryStatus::InFlight);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn status_query_for_unknown_message_is_not_found() {
    let h = setup().await;

    let result = h.status(Uuid::new_v4()).await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn statistics_reflect_ledger_and_queue() {
    let h = setup().await;

    h.schedule(request("as soon as possible")).await.unwrap();
    h.schedule(request("2 hours")).await.unwrap();

    let stats = h.statistics().await.unwrap();
    assert_eq!(stats.queue_depth, 2);
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.delivered, 0);

    h.engine.process_batch().await.unwrap();

    let stats = h.statistics().await.unwrap();
    assert_eq!(stats.queue_depth, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.dead_letters, 0);
}

#[tokio::test]
async fn listing_filters_by_status() {
    let h = setup().await;

    h.schedule(request("as soon as possible")).await.unwrap();
    h.schedule(request("2 hours")).await.unwrap();
    h.engine.process_batch().await.unwrap();

    let delivered = h
        .list_messages(Some(DeliveryStatus::Delivered))
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let queued = h.list_messages(Some(DeliveryStatus::Queued)).await.unwrap();
    assert_eq!(queued.len(), 1);

    let all = h.list_messages(None).await.unwrap();
    assert_eq!(all.len(), 2);
}
