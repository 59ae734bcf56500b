//! In-process loopback transport.
//!
//! Behaves like a small partitioned-log broker living inside the process:
//! - One append-only log per topic (single partition)
//! - Consumer groups with independent cursors and committed offsets
//! - New groups start from the earliest record
//! - At most one live subscriber per group; the most recent subscribe wins
//!
//! Failure injection hooks (`simulate_crash`, `drop_subscription`,
//! `fail_next_connects`) make it the test double for broker-backed queues.

use super::{
    ConnectionParams, DriverFeatures, RecordPosition, TransportCallback, TransportDriver,
    TransportError, TransportEvent, TransportRecord, TransportSubscription,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "loopback_tests.rs"]
mod tests;

// ============================================================================
// Internal State
// ============================================================================

struct LoopbackInner {
    name: String,
    state: Mutex<LoopbackState>,
    connects: AtomicU64,
    failing_connects: AtomicU32,
}

impl LoopbackInner {
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct LoopbackState {
    connected: bool,
    params: Option<ConnectionParams>,
    topics: HashMap<String, TopicLog>,
    next_subscription_id: u64,
}

#[derive(Default)]
struct TopicLog {
    records: Vec<TransportRecord>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    next: usize,
    committed: Option<i64>,
    subscriber: Option<Subscriber>,
}

struct Subscriber {
    id: u64,
    callback: TransportCallback,
}

/// Callback invocations collected under the lock and run after releasing it
type PendingDeliveries = Vec<(TransportCallback, TransportEvent)>;

impl TopicLog {
    /// Push every record a group's cursor has not reached yet to its subscriber
    fn pump_group(records: &[TransportRecord], group: &mut GroupState) -> PendingDeliveries {
        let Some(subscriber) = &group.subscriber else {
            return Vec::new();
        };

        let pending: PendingDeliveries = records
            .iter()
            .skip(group.next)
            .map(|record| {
                (
                    Arc::clone(&subscriber.callback),
                    TransportEvent::Record(record.clone()),
                )
            })
            .collect();
        group.next = records.len();
        pending
    }

    fn pump(&mut self) -> PendingDeliveries {
        let records = &self.records;
        self.groups
            .values_mut()
            .flat_map(|group| Self::pump_group(records, group))
            .collect()
    }
}

fn dispatch(pending: PendingDeliveries) {
    for (callback, event) in pending {
        callback(event);
    }
}

// ============================================================================
// LoopbackDriver
// ============================================================================

/// In-process broker implementing [`TransportDriver`]
#[derive(Clone)]
pub struct LoopbackDriver {
    inner: Arc<LoopbackInner>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::with_name("loopback")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                name: name.into(),
                state: Mutex::new(LoopbackState::default()),
                connects: AtomicU64::new(0),
                failing_connects: AtomicU32::new(0),
            }),
        }
    }

    /// Drop the connection and terminate every live subscription with `cause`
    pub fn simulate_crash(&self, cause: &str) {
        let pending: PendingDeliveries = {
            let mut state = self.inner.lock();
            state.connected = false;
            state
                .topics
                .values_mut()
                .flat_map(|topic| topic.groups.values_mut())
                .filter_map(|group| group.subscriber.take())
                .map(|sub| (sub.callback, TransportEvent::Failed(cause.to_string())))
                .collect()
        };

        warn!(
            transport = %self.inner.name,
            subscriptions = pending.len(),
            cause,
            "Simulating transport crash"
        );
        dispatch(pending);
    }

    /// Terminate one group's subscription while the connection stays up
    pub fn drop_subscription(&self, topic: &str, group: &str, cause: &str) -> bool {
        let subscriber = {
            let mut state = self.inner.lock();
            state
                .topics
                .get_mut(topic)
                .and_then(|log| log.groups.get_mut(group))
                .and_then(|group| group.subscriber.take())
        };

        match subscriber {
            Some(sub) => {
                (sub.callback)(TransportEvent::Failed(cause.to_string()));
                true
            }
            None => false,
        }
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Number of successful connects since construction
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Parameters of the most recent successful connect
    pub fn connected_params(&self) -> Option<ConnectionParams> {
        self.inner.lock().params.clone()
    }

    pub fn record_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, topic: &str, group: &str) -> Option<i64> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .and_then(|group| group.committed)
    }

    pub fn has_subscriber(&self, topic: &str, group: &str) -> bool {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map(|group| group.subscriber.is_some())
            .unwrap_or(false)
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportDriver for LoopbackDriver {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn features(&self) -> DriverFeatures {
        DriverFeatures { offsets: true }
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    async fn connect(&self, params: &ConnectionParams) -> Result<(), TransportError> {
        let injected = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::ConnectFailed(
                "connection refused (injected)".to_string(),
            ));
        }

        let mut state = self.inner.lock();
        state.connected = true;
        state.params = Some(params.clone());
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        debug!(transport = %self.inner.name, address = ?params.address(), "Connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        state.connected = false;
        for group in state
            .topics
            .values_mut()
            .flat_map(|topic| topic.groups.values_mut())
        {
            group.subscriber = None;
        }
        debug!(transport = %self.inner.name, "Disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, mut record: TransportRecord) -> Result<(), TransportError> {
        let pending = {
            let mut state = self.inner.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }

            let log = state.topics.entry(topic.to_string()).or_default();
            record.position = Some(RecordPosition {
                partition: 0,
                offset: log.records.len() as i64,
            });
            log.records.push(record);
            log.pump()
        };

        dispatch(pending);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        callback: TransportCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError> {
        let (id, pending) = {
            let mut state = self.inner.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }

            state.next_subscription_id += 1;
            let id = state.next_subscription_id;

            let log = state.topics.entry(topic.to_string()).or_default();
            let group_state = log.groups.entry(group.to_string()).or_default();
            if group_state.subscriber.is_some() {
                debug!(topic, group, "Replacing existing group subscriber");
            }
            group_state.subscriber = Some(Subscriber { id, callback });

            let pending = TopicLog::pump_group(&log.records, group_state);
            (id, pending)
        };

        dispatch(pending);
        Ok(Box::new(LoopbackSubscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
            id,
        }))
    }

    async fn commit(
        &self,
        topic: &str,
        group: &str,
        position: RecordPosition,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        let group_state = state
            .topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        group_state.committed = Some(
            group_state
                .committed
                .map_or(position.offset, |c| c.max(position.offset)),
        );
        Ok(())
    }

    async fn seek(
        &self,
        topic: &str,
        group: &str,
        position: RecordPosition,
    ) -> Result<(), TransportError> {
        let pending = {
            let mut state = self.inner.lock();
            let log = state.topics.entry(topic.to_string()).or_default();
            let records = &log.records;
            let group_state = log.groups.entry(group.to_string()).or_default();
            group_state.next = usize::try_from(position.offset.max(0))
                .unwrap_or(0)
                .min(records.len());
            TopicLog::pump_group(records, group_state)
        };

        dispatch(pending);
        Ok(())
    }
}

// ============================================================================
// LoopbackSubscription
// ============================================================================

struct LoopbackSubscription {
    inner: Arc<LoopbackInner>,
    topic: String,
    group: String,
    id: u64,
}

#[async_trait]
impl TransportSubscription for LoopbackSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        if let Some(group) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|log| log.groups.get_mut(&self.group))
        {
            // A newer subscriber on the same group is left alone
            if group.subscriber.as_ref().map(|s| s.id) == Some(self.id) {
                group.subscriber = None;
            }
        }
        Ok(())
    }
}
