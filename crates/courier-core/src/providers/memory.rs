//! In-memory reference broker.
//!
//! This module provides a self-contained queue that implements the complete
//! lease-based delivery model:
//! - FIFO buffer of messages waiting for a consumer
//! - Lease records with monotonically increasing tokens for in-flight messages
//! - Abandon re-enqueues at the tail, dead-letter removes for good
//! - Blocking receive implemented as a bounded poll of the buffer
//! - Push-style listening through a background task
//!
//! Leases are soft. Nothing sweeps expired leases; expiry is only noticed when
//! `renew_lock`, `complete`, `abandon` or `move_to_dead_letter` touches the
//! lease. A consumer that dies without abandoning leaves its message leased
//! for good, which is acceptable for a test and reference broker but not for
//! a durable queue.
//!
//! This provider is intended for:
//! - Unit testing of queue consumers
//! - Development and prototyping
//! - Reference behavior for broker-backed queues

use crate::capabilities::Capabilities;
use crate::error::QueueError;
use crate::message::{DeliveryReference, MessageEnvelope, QueueName, ReferenceKind, Timestamp};
use crate::options::QueueOptions;
use crate::queue::{Context, MessageQueue, MessageReceiver};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Counters kept by the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub sent: u64,
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub renewed: u64,
}

/// A message currently leased to a consumer
struct LeaseRecord {
    envelope: MessageEnvelope,
    expiration_time: Timestamp,
    lease_duration: Duration,
}

impl LeaseRecord {
    fn is_expired(&self) -> bool {
        self.expiration_time.is_past()
    }
}

#[derive(Default)]
struct BrokerState {
    /// Messages waiting for a consumer (FIFO order)
    messages: VecDeque<MessageEnvelope>,
    /// In-flight messages keyed by lease token
    leases: HashMap<u64, LeaseRecord>,
    next_token: u64,
    stats: QueueStats,
}

impl BrokerState {
    fn enqueue(&mut self, envelope: &MessageEnvelope) -> MessageEnvelope {
        let mut stored = envelope.detached();
        stored.sent_time = Some(Timestamp::now());
        self.messages.push_back(stored.clone());
        self.stats.sent += 1;
        stored
    }

    fn lease_next(&mut self, lease_duration: Duration) -> Option<MessageEnvelope> {
        let mut envelope = self.messages.pop_front()?;

        self.next_token += 1;
        let token = self.next_token;
        self.leases.insert(
            token,
            LeaseRecord {
                envelope: envelope.clone(),
                expiration_time: Timestamp::now().add(lease_duration),
                lease_duration,
            },
        );
        self.stats.received += 1;

        envelope.set_delivery_reference(DeliveryReference::lease(token));
        Some(envelope)
    }

    /// Drop the lease on `token` and put its message back at the head
    fn restore_head(&mut self, token: u64) -> bool {
        match self.leases.remove(&token) {
            Some(lease) => {
                self.messages.push_front(lease.envelope);
                self.stats.received = self.stats.received.saturating_sub(1);
                true
            }
            None => false,
        }
    }
}

/// Lease token carried by an envelope, if it came from this kind of broker
fn lease_token(reference: Option<&DeliveryReference>) -> Option<u64> {
    match reference?.kind() {
        ReferenceKind::Lease(token) => Some(*token),
        _ => None,
    }
}

struct ListenerHandle {
    active: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

struct MemoryInner {
    name: QueueName,
    options: RwLock<QueueOptions>,
    opened: AtomicBool,
    state: Mutex<BrokerState>,
    listener: Mutex<Option<ListenerHandle>>,
}

// ============================================================================
// MemoryQueue
// ============================================================================

/// In-memory queue with full lease semantics.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryInner>,
}

impl MemoryQueue {
    /// Create new in-memory queue; it must be opened before use
    pub fn new(name: QueueName, options: QueueOptions) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name,
                options: RwLock::new(options),
                opened: AtomicBool::new(false),
                state: Mutex::new(BrokerState::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Snapshot of the broker counters
    pub fn stats(&self) -> QueueStats {
        self.state().stats
    }

    /// Number of messages currently leased to consumers
    pub fn leased_count(&self) -> usize {
        self.state().leases.len()
    }

    /// Expiration of the lease carried by `envelope`, if it is still recorded
    pub fn lease_expiration(&self, envelope: &MessageEnvelope) -> Option<Timestamp> {
        let token = lease_token(envelope.delivery_reference())?;
        self.state()
            .leases
            .get(&token)
            .map(|lease| lease.expiration_time)
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn options(&self) -> QueueOptions {
        self.inner
            .options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueueError::NotOpened {
                queue: self.inner.name.clone(),
            })
        }
    }

    fn stop_listener(&self) -> bool {
        let handle = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => {
                handle.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Undo a receive that no consumer will process
    fn return_to_head(&self, envelope: &mut MessageEnvelope) {
        let Some(token) = lease_token(envelope.take_delivery_reference().as_ref()) else {
            return;
        };
        if self.state().restore_head(token) {
            debug!(
                queue = %self.name(),
                message_id = %envelope.message_id,
                "Message returned to head after listener stopped"
            );
        }
    }

    /// Background loop feeding `receiver` until deactivated or the queue closes
    async fn listen_loop(
        weak: Weak<MemoryInner>,
        ctx: Context,
        receiver: Arc<dyn MessageReceiver>,
        active: Arc<AtomicBool>,
    ) {
        while active.load(Ordering::SeqCst) {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let queue = MemoryQueue { inner };
            if !queue.is_open() {
                break;
            }

            let timeout = queue.options().listen_timeout();
            let mut envelope = match queue.receive(&ctx, timeout).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    debug!(queue = %queue.name(), error = %e, "Listen loop stopping");
                    break;
                }
            };

            // Listener ended or was replaced during the receive; the message
            // keeps its place at the head
            if !active.load(Ordering::SeqCst) {
                queue.return_to_head(&mut envelope);
                break;
            }

            let message_id = envelope.message_id.clone();
            let trace_id = envelope.trace_id.clone();
            if let Err(e) = receiver.receive_message(envelope, &queue).await {
                warn!(
                    queue = %queue.name(),
                    message_id = %message_id,
                    trace_id = ?trace_id,
                    error = %e,
                    "Message receiver failed"
                );
            }
        }

        debug!("Listen loop stopped");
    }
}

impl fmt::Display for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.inner.name)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &QueueName {
        &self.inner.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn is_open(&self) -> bool {
        self.inner.opened.load(Ordering::SeqCst)
    }

    fn configure(&self, options: QueueOptions) {
        *self.inner.options.write().unwrap_or_else(|e| e.into_inner()) = options;
    }

    async fn open(&self, ctx: &Context) -> Result<(), QueueError> {
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Opened queue");
        Ok(())
    }

    async fn close(&self, ctx: &Context) -> Result<(), QueueError> {
        if !self.inner.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop_listener();
        {
            let mut state = self.state();
            state.messages.clear();
            state.leases.clear();
        }

        info!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Closed queue");
        Ok(())
    }

    async fn send(&self, ctx: &Context, envelope: MessageEnvelope) -> Result<(), QueueError> {
        self.check_open()?;

        let stored = self.state().enqueue(&envelope);
        debug!(
            queue = %self.name(),
            message_id = %stored.message_id,
            message_type = %stored.message_type,
            trace_id = ?stored.trace_id.as_deref().or(ctx.trace_id()),
            "Message sent"
        );
        Ok(())
    }

    async fn peek(&self, _ctx: &Context) -> Result<Option<MessageEnvelope>, QueueError> {
        self.check_open()?;
        Ok(self.state().messages.front().cloned())
    }

    async fn peek_batch(
        &self,
        _ctx: &Context,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, QueueError> {
        self.check_open()?;
        Ok(self.state().messages.iter().take(count).cloned().collect())
    }

    async fn receive(
        &self,
        ctx: &Context,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, QueueError> {
        self.check_open()?;

        let options = self.options();
        let lease_duration = if wait_timeout > Duration::zero() {
            wait_timeout
        } else {
            options.lease_timeout()
        };
        let poll_interval = options.poll_interval().to_std().unwrap_or_default();
        let deadline = tokio::time::Instant::now() + wait_timeout.to_std().unwrap_or_default();

        loop {
            // A close during the wait winds the receive down quietly
            if !self.is_open() {
                return Ok(None);
            }

            let leased = self.state().lease_next(lease_duration);
            if let Some(envelope) = leased {
                debug!(
                    queue = %self.name(),
                    message_id = %envelope.message_id,
                    trace_id = ?envelope.trace_id.as_deref().or(ctx.trace_id()),
                    "Message received"
                );
                return Ok(Some(envelope));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    async fn renew_lock(
        &self,
        envelope: &mut MessageEnvelope,
        lock_timeout: Duration,
    ) -> Result<(), QueueError> {
        self.check_open()?;

        let Some(token) = lease_token(envelope.delivery_reference()) else {
            return Ok(());
        };

        let mut state = self.state();
        let expired = match state.leases.get_mut(&token) {
            Some(lease) if !lease.is_expired() => {
                lease.expiration_time = lease.expiration_time.add(lock_timeout);
                lease.lease_duration = lock_timeout;
                false
            }
            Some(_) => true,
            None => return Ok(()),
        };

        if expired {
            // Lazily reclaim the lease we just found to be dead
            state.leases.remove(&token);
            debug!(queue = %self.name(), message_id = %envelope.message_id, "Lease already expired");
        } else {
            state.stats.renewed += 1;
            debug!(
                queue = %self.name(),
                message_id = %envelope.message_id,
                trace_id = ?envelope.trace_id,
                "Lease renewed"
            );
        }
        Ok(())
    }

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        self.check_open()?;

        let Some(token) = lease_token(envelope.take_delivery_reference().as_ref()) else {
            return Ok(());
        };

        let mut state = self.state();
        if state.leases.remove(&token).is_some() {
            state.stats.completed += 1;
            debug!(
                queue = %self.name(),
                message_id = %envelope.message_id,
                trace_id = ?envelope.trace_id,
                "Message completed"
            );
        }
        Ok(())
    }

    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        self.check_open()?;

        let Some(token) = lease_token(envelope.take_delivery_reference().as_ref()) else {
            return Ok(());
        };

        let mut state = self.state();
        match state.leases.remove(&token) {
            Some(lease) if !lease.is_expired() => {
                state.enqueue(&lease.envelope);
                state.stats.abandoned += 1;
                debug!(
                    queue = %self.name(),
                    message_id = %envelope.message_id,
                    trace_id = ?envelope.trace_id,
                    lease_ms = lease.lease_duration.num_milliseconds(),
                    "Message abandoned"
                );
            }
            // Missing or expired: assume the message was reclaimed elsewhere
            _ => {}
        }
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), QueueError> {
        self.check_open()?;

        let Some(token) = lease_token(envelope.take_delivery_reference().as_ref()) else {
            return Ok(());
        };

        let mut state = self.state();
        if state.leases.remove(&token).is_some() {
            state.stats.dead_lettered += 1;
            warn!(
                queue = %self.name(),
                message_id = %envelope.message_id,
                message_type = %envelope.message_type,
                trace_id = ?envelope.trace_id,
                "Message moved to dead letter"
            );
        }
        Ok(())
    }

    async fn listen(
        &self,
        ctx: &Context,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), QueueError> {
        self.check_open()?;

        if self.stop_listener() {
            debug!(queue = %self.name(), "Replacing active listener");
        }

        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(Self::listen_loop(
            Arc::downgrade(&self.inner),
            ctx.clone(),
            receiver,
            Arc::clone(&active),
        ));

        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(ListenerHandle {
            active,
            _task: task,
        });

        debug!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Started listening");
        Ok(())
    }

    async fn end_listen(&self, ctx: &Context) {
        if self.stop_listener() {
            debug!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Stopped listening");
        }
    }

    async fn read_message_count(&self) -> Result<usize, QueueError> {
        self.check_open()?;
        Ok(self.state().messages.len())
    }

    async fn clear(&self, ctx: &Context) -> Result<(), QueueError> {
        self.check_open()?;

        let mut state = self.state();
        state.messages.clear();
        state.leases.clear();
        debug!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Cleared queue");
        Ok(())
    }
}
