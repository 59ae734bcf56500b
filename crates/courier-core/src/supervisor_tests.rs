//! Tests for subscription supervision and recovery.

use super::*;
use crate::message::MessageEnvelope;
use crate::transport::{encode_record, LoopbackDriver, TransportRecord};
use tokio::sync::mpsc::UnboundedReceiver;

const TOPIC: &str = "orders";
const GROUP: &str = "workers";

fn params() -> ConnectionParams {
    ConnectionParams::from_uri("loopback://test")
}

fn target() -> SubscriptionTarget {
    SubscriptionTarget {
        topic: TOPIC.to_string(),
        group: GROUP.to_string(),
        codec: RecordCodec::Headers,
    }
}

async fn connected_driver() -> Arc<LoopbackDriver> {
    let driver = Arc::new(LoopbackDriver::new());
    driver.connect(&params()).await.unwrap();
    driver
}

/// Supervisor over `driver`; reconnects itself when `owned`
fn supervisor(
    driver: &Arc<LoopbackDriver>,
    owned: bool,
) -> (
    SubscriptionSupervisor<LoopbackDriver>,
    UnboundedReceiver<MessageEnvelope>,
) {
    let (sink, delivered) = DeliverySink::channel();
    let supervisor = SubscriptionSupervisor::new(
        Arc::clone(driver),
        owned.then(params),
        target(),
        sink,
        Duration::from_millis(5),
    );
    (supervisor, delivered)
}

async fn publish(driver: &LoopbackDriver, payload: &str) {
    let envelope = MessageEnvelope::new(None, "Order", payload.to_string());
    let record = encode_record(RecordCodec::Headers, &envelope).unwrap();
    driver.publish(TOPIC, record).await.unwrap();
}

async fn next_payload(delivered: &mut UnboundedReceiver<MessageEnvelope>) -> String {
    let envelope = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
        .await
        .expect("delivery timed out")
        .expect("sink closed");
    envelope.payload_as_str().unwrap().to_string()
}

/// Poll `condition` until it holds or five seconds pass
async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn recovered(supervisor: &SubscriptionSupervisor<LoopbackDriver>) {
    eventually(|| {
        supervisor.recovery_runs() >= 1 && supervisor.state() == SubscriptionState::Active
    })
    .await;
}

// ============================================================================
// Start / Stop Tests
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_start_subscribes_and_delivers() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, true);
        assert_eq!(supervisor.state(), SubscriptionState::Unsubscribed);

        supervisor.start().await.unwrap();
        publish(&driver, "first").await;

        assert_eq!(supervisor.state(), SubscriptionState::Active);
        assert!(driver.has_subscriber(TOPIC, GROUP));
        assert_eq!(next_payload(&mut delivered).await, "first");
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let driver = connected_driver().await;
        let (supervisor, _delivered) = supervisor(&driver, true);

        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();

        assert_eq!(supervisor.state(), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn test_start_fails_without_connection_and_can_retry() {
        let driver = Arc::new(LoopbackDriver::new());
        let (supervisor, mut delivered) = supervisor(&driver, false);

        let result = supervisor.start().await;
        assert!(matches!(result, Err(QueueError::ConnectionFailed { .. })));
        assert_eq!(supervisor.state(), SubscriptionState::Unsubscribed);

        driver.connect(&params()).await.unwrap();
        supervisor.start().await.unwrap();
        publish(&driver, "after connect").await;
        assert_eq!(next_payload(&mut delivered).await, "after connect");
    }

    #[tokio::test]
    async fn test_stop_terminates_subscription() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();

        supervisor.stop().await;
        publish(&driver, "ignored").await;

        assert_eq!(supervisor.state(), SubscriptionState::Terminated);
        assert!(!driver.has_subscriber(TOPIC, GROUP));
        let nothing = tokio::time::timeout(Duration::from_millis(50), delivered.recv()).await;
        assert!(!matches!(nothing, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_undecodable_record_is_dropped() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();

        driver
            .publish(TOPIC, TransportRecord::new("no headers at all"))
            .await
            .unwrap();
        publish(&driver, "valid").await;

        assert_eq!(next_payload(&mut delivered).await, "valid");
        assert_eq!(supervisor.state(), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn test_delivered_envelopes_carry_offsets() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();

        publish(&driver, "with offset").await;

        let envelope = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            envelope.delivery_reference().map(|r| r.to_string()),
            Some("offset:0@0".to_string())
        );
    }
}

// ============================================================================
// Recovery Tests
// ============================================================================

mod recovery {
    use super::*;

    #[tokio::test]
    async fn test_crash_then_recover_resumes_delivery() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();
        publish(&driver, "before").await;
        assert_eq!(next_payload(&mut delivered).await, "before");

        driver.simulate_crash("broker restarted");
        recovered(&supervisor).await;
        publish(&driver, "after").await;

        assert_eq!(next_payload(&mut delivered).await, "after");
        assert_eq!(supervisor.recovery_runs(), 1);
        assert_eq!(driver.connect_count(), 2);
        assert!(driver.is_connected());
    }

    #[tokio::test]
    async fn test_recovery_retries_failed_reconnects() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();

        driver.fail_next_connects(3);
        driver.simulate_crash("network partition");
        recovered(&supervisor).await;
        publish(&driver, "healed").await;

        assert_eq!(next_payload(&mut delivered).await, "healed");
        assert_eq!(supervisor.recovery_runs(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_failures_share_one_recovery_run() {
        let driver = connected_driver().await;
        let (supervisor, _delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();

        driver.fail_next_connects(10);
        driver.simulate_crash("first failure");
        eventually(|| supervisor.state() == SubscriptionState::Recovering).await;

        Arc::clone(&supervisor.shared).on_failure("second failure");
        Arc::clone(&supervisor.shared).on_failure("third failure");
        eventually(|| {
            !supervisor.shared.recovering.load(Ordering::SeqCst)
                && supervisor.state() == SubscriptionState::Active
        })
        .await;

        assert_eq!(supervisor.recovery_runs(), 1);
        assert!(driver.has_subscriber(TOPIC, GROUP));
    }

    #[tokio::test]
    async fn test_failure_from_replaced_subscription_is_ignored() {
        let driver = connected_driver().await;
        let (supervisor, _delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();

        supervisor
            .shared
            .events
            .send((0, TransportEvent::Failed("stale".to_string())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(supervisor.recovery_runs(), 0);
        assert_eq!(supervisor.state(), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn test_dropped_subscription_recovers_on_live_connection() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, false);
        supervisor.start().await.unwrap();

        assert!(driver.drop_subscription(TOPIC, GROUP, "rebalance"));
        recovered(&supervisor).await;
        publish(&driver, "rebalanced").await;

        assert_eq!(next_payload(&mut delivered).await, "rebalanced");
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_shared_connection_waits_for_owner_to_reconnect() {
        let driver = connected_driver().await;
        let (supervisor, mut delivered) = supervisor(&driver, false);
        supervisor.start().await.unwrap();

        driver.simulate_crash("owner lost connection");
        eventually(|| supervisor.state() == SubscriptionState::Recovering).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(supervisor.state(), SubscriptionState::Recovering);
        assert_eq!(driver.connect_count(), 1);

        // The owner reconnects; the supervisor only resubscribes
        driver.connect(&params()).await.unwrap();
        recovered(&supervisor).await;
        publish(&driver, "shared").await;

        assert_eq!(next_payload(&mut delivered).await, "shared");
        assert_eq!(driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_during_recovery_ends_retries() {
        let driver = connected_driver().await;
        let (supervisor, _delivered) = supervisor(&driver, true);
        supervisor.start().await.unwrap();

        driver.fail_next_connects(u32::MAX);
        driver.simulate_crash("permanent outage");
        eventually(|| supervisor.state() == SubscriptionState::Recovering).await;

        supervisor.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(supervisor.state(), SubscriptionState::Terminated);
        assert!(!driver.has_subscriber(TOPIC, GROUP));
    }
}
