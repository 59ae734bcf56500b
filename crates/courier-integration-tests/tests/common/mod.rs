//! Common test utilities for courier integration tests
//!
//! This module provides:
//! - Builders for every queue kind the factory knows about
//! - A generic contract fixture that runs against any `MessageQueue` and
//!   branches on its capability descriptor
//! - A collecting receiver for listen tests

use async_trait::async_trait;
use chrono::Duration;
use courier_core::{
    Context, MessageEnvelope, MessageQueue, MessageReceiver, QueueConfig, QueueError,
    QueueFactory, QueueKind, QueueOperation, QueueOptions,
};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

/// Upper bound for anything the tests wait on
pub const PATIENCE: std::time::Duration = std::time::Duration::from_secs(5);

const STEP: std::time::Duration = std::time::Duration::from_millis(10);

// ============================================================================
// Queue Builders
// ============================================================================

#[allow(dead_code)]
fn fast_options() -> QueueOptions {
    QueueOptions::default()
        .with_poll_interval_ms(10)
        .with_listen_timeout_ms(100)
}

#[allow(dead_code)]
fn build(name: &str, kind: QueueKind) -> Box<dyn MessageQueue> {
    let config = QueueConfig {
        name: name.to_string(),
        kind,
        options: fast_options(),
        ..QueueConfig::default()
    };
    QueueFactory::create(&config).expect("queue config should be valid")
}

#[allow(dead_code)]
pub fn memory_queue(name: &str) -> Box<dyn MessageQueue> {
    build(name, QueueKind::Memory)
}

#[allow(dead_code)]
pub fn loopback_queue(name: &str) -> Box<dyn MessageQueue> {
    build(name, QueueKind::Loopback)
}

// ============================================================================
// Helpers
// ============================================================================

#[allow(dead_code)]
pub fn envelope(message_type: &str, payload: &str) -> MessageEnvelope {
    MessageEnvelope::new(None, message_type, payload.to_string())
}

#[allow(dead_code)]
pub fn payload(envelope: &MessageEnvelope) -> String {
    envelope
        .payload_as_str()
        .expect("payload should be UTF-8")
        .to_string()
}

/// Receive with the standard patience, failing the test on error
#[allow(dead_code)]
pub async fn receive(queue: &dyn MessageQueue, ctx: &Context) -> Option<MessageEnvelope> {
    queue
        .receive(ctx, Duration::seconds(5))
        .await
        .expect("receive should succeed")
}

/// Peek until `count` messages are visible or patience runs out
#[allow(dead_code)]
pub async fn peek_at_least(
    queue: &dyn MessageQueue,
    ctx: &Context,
    count: usize,
) -> Vec<MessageEnvelope> {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        let batch = queue
            .peek_batch(ctx, count)
            .await
            .expect("peek_batch should succeed");
        if batch.len() >= count || tokio::time::Instant::now() >= deadline {
            return batch;
        }
        tokio::time::sleep(STEP).await;
    }
}

/// Poll `read_message_count` until it equals `expected`
#[allow(dead_code)]
pub async fn wait_for_count(queue: &dyn MessageQueue, expected: usize) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        let count = queue
            .read_message_count()
            .await
            .expect("read_message_count should succeed");
        if count == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message count stuck at {} (expected {})",
            count,
            expected
        );
        tokio::time::sleep(STEP).await;
    }
}

// ============================================================================
// Collecting Receiver
// ============================================================================

/// Completes every pushed message and records its payload
#[derive(Clone, Default)]
pub struct Collector {
    payloads: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    /// Wait until at least `count` payloads arrived
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + PATIENCE;
        loop {
            let payloads = self.payloads();
            if payloads.len() >= count {
                return payloads;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {} of {} messages arrived",
                payloads.len(),
                count
            );
            tokio::time::sleep(STEP).await;
        }
    }
}

#[async_trait]
impl MessageReceiver for Collector {
    async fn receive_message(
        &self,
        mut envelope: MessageEnvelope,
        queue: &dyn MessageQueue,
    ) -> anyhow::Result<()> {
        queue.complete(&mut envelope).await?;
        self.payloads.lock().unwrap().push(payload(&envelope));
        Ok(())
    }
}

// ============================================================================
// Contract Fixture
// ============================================================================

/// Operations on a closed queue fail and a closed queue can be reopened
#[allow(dead_code)]
pub async fn check_lifecycle(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert!(!queue.is_open());

    let result = queue.send(&ctx, envelope("Test", "too early")).await;
    assert!(matches!(result, Err(QueueError::NotOpened { .. })));
    let result = queue.receive(&ctx, Duration::zero()).await;
    assert!(matches!(result, Err(QueueError::NotOpened { .. })));

    assert_ok!(queue.open(&ctx).await);
    assert!(queue.is_open());
    assert_ok!(queue.close(&ctx).await);
    assert!(!queue.is_open());

    assert_ok!(queue.open(&ctx).await);
    assert_ok!(queue.send(&ctx, envelope("Test", "reopened")).await);
    let received = receive(queue, &ctx).await.expect("message after reopen");
    assert_eq!(payload(&received), "reopened");
    assert_ok!(queue.close(&ctx).await);
}

/// A sent message comes back with its type, payload and trace id intact
#[allow(dead_code)]
pub async fn check_send_receive(queue: &dyn MessageQueue) {
    let ctx = Context::with_trace_id("contract-trace");
    assert_ok!(queue.open(&ctx).await);

    let sent = envelope("Test", "hello").with_trace_id("contract-trace");
    let message_id = sent.message_id.clone();
    assert_ok!(queue.send(&ctx, sent).await);

    let mut received = receive(queue, &ctx).await.expect("message should arrive");
    assert_eq!(received.message_id, message_id);
    assert_eq!(received.message_type, "Test");
    assert_eq!(payload(&received), "hello");
    assert_eq!(received.trace_id.as_deref(), Some("contract-trace"));
    assert!(received.sent_time.is_some());
    assert_ok!(queue.complete(&mut received).await);

    assert_ok!(queue.close(&ctx).await);
}

/// Messages from one sender are received in send order
#[allow(dead_code)]
pub async fn check_send_order(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert_ok!(queue.open(&ctx).await);

    for n in 1..=5 {
        assert_ok!(queue.send(&ctx, envelope("Seq", &n.to_string())).await);
    }

    let mut seen = Vec::new();
    for _ in 1..=5 {
        let mut received = receive(queue, &ctx).await.expect("message should arrive");
        seen.push(payload(&received));
        assert_ok!(queue.complete(&mut received).await);
    }
    assert_eq!(seen, vec!["1", "2", "3", "4", "5"]);

    assert_ok!(queue.close(&ctx).await);
}

/// Peeking shows messages without taking them
#[allow(dead_code)]
pub async fn check_peek(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert_ok!(queue.open(&ctx).await);

    assert_ok!(queue.send(&ctx, envelope("Test", "first")).await);
    assert_ok!(queue.send(&ctx, envelope("Test", "second")).await);

    if queue.capabilities().supports(QueueOperation::PeekBatch) {
        let batch = peek_at_least(queue, &ctx, 2).await;
        let payloads: Vec<String> = batch.iter().map(payload).collect();
        assert_eq!(payloads, vec!["first", "second"]);
    }

    if queue.capabilities().supports(QueueOperation::Peek) {
        peek_at_least(queue, &ctx, 1).await;
        let peeked = assert_ok!(queue.peek(&ctx).await).expect("peek should see a message");
        let mut received = receive(queue, &ctx).await.expect("message should arrive");
        assert_eq!(peeked.message_id, received.message_id);
        assert_ok!(queue.complete(&mut received).await);
    }

    assert_ok!(queue.close(&ctx).await);
}

/// Abandoned messages are delivered again; without support abandon is a no-op
#[allow(dead_code)]
pub async fn check_abandon(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert_ok!(queue.open(&ctx).await);
    assert_ok!(queue.send(&ctx, envelope("Test", "again")).await);

    let mut first = receive(queue, &ctx).await.expect("message should arrive");
    assert_ok!(queue.abandon(&mut first).await);

    if queue.capabilities().supports(QueueOperation::Abandon) {
        let mut second = receive(queue, &ctx).await.expect("message should return");
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(payload(&second), "again");
        assert_ok!(queue.complete(&mut second).await);
    }

    assert_ok!(queue.close(&ctx).await);
}

/// Dead-lettered messages leave the queue; without support it is a no-op
#[allow(dead_code)]
pub async fn check_dead_letter(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert_ok!(queue.open(&ctx).await);
    assert_ok!(queue.send(&ctx, envelope("Test", "poison")).await);

    let mut received = receive(queue, &ctx).await.expect("message should arrive");
    assert_ok!(queue.move_to_dead_letter(&mut received).await);

    if queue.capabilities().supports(QueueOperation::DeadLetter) {
        let next = assert_ok!(queue.receive(&ctx, Duration::milliseconds(200)).await);
        assert!(next.is_none());
    }

    assert_ok!(queue.close(&ctx).await);
}

/// Renewing a lease succeeds whether or not leases exist
#[allow(dead_code)]
pub async fn check_renew_lock(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert_ok!(queue.open(&ctx).await);
    assert_ok!(queue.send(&ctx, envelope("Test", "slow job")).await);

    let mut received = receive(queue, &ctx).await.expect("message should arrive");
    assert_ok!(queue.renew_lock(&mut received, Duration::seconds(30)).await);
    assert_ok!(queue.complete(&mut received).await);

    assert_ok!(queue.close(&ctx).await);
}

/// Counting and clearing follow the capability descriptor
#[allow(dead_code)]
pub async fn check_count_and_clear(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert_ok!(queue.open(&ctx).await);

    for n in 0..3 {
        assert_ok!(queue.send(&ctx, envelope("Count", &n.to_string())).await);
    }

    if queue.capabilities().supports(QueueOperation::MessageCount) {
        wait_for_count(queue, 3).await;
    } else {
        assert_eq!(assert_ok!(queue.read_message_count().await), 0);
    }

    assert_ok!(queue.clear(&ctx).await);
    if queue.capabilities().supports(QueueOperation::Clear)
        && queue.capabilities().supports(QueueOperation::MessageCount)
    {
        wait_for_count(queue, 0).await;
    }

    assert_ok!(queue.close(&ctx).await);
}

/// Listening pushes messages to the receiver until listening ends
#[allow(dead_code)]
pub async fn check_listen(queue: &dyn MessageQueue) {
    let ctx = Context::new();
    assert_ok!(queue.open(&ctx).await);

    let collector = Collector::new();
    assert_ok!(queue.listen(&ctx, Arc::new(collector.clone())).await);
    assert_ok!(queue.send(&ctx, envelope("Push", "one")).await);
    assert_ok!(queue.send(&ctx, envelope("Push", "two")).await);

    assert_eq!(collector.wait_for(2).await, vec!["one", "two"]);

    queue.end_listen(&ctx).await;
    assert_ok!(queue.close(&ctx).await);
}

/// Every operation fails on a queue that was never opened
#[allow(dead_code)]
pub async fn check_closed_queue_rejects_operations(queue: &dyn MessageQueue) {
    let ctx = Context::new();

    assert_err!(queue.peek(&ctx).await);
    assert_err!(queue.peek_batch(&ctx, 2).await);
    assert_err!(queue.listen(&ctx, Arc::new(Collector::new())).await);
    assert_err!(queue.read_message_count().await);
    assert_err!(queue.clear(&ctx).await);
}
