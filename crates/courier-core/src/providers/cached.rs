//! Cached-receive adapter for push-only transports.
//!
//! Many brokers can only hand messages to a subscription callback; they have
//! no native peek or blocking receive. [`CachedQueue`] wraps such a
//! [`PushTransport`] and keeps a local FIFO buffer of delivered messages so
//! the full pull-style contract (`peek`, `peek_batch`, `receive`, `listen`)
//! works on top of it.
//!
//! While a receiver is registered through `listen`, deliveries bypass the
//! buffer and go straight to the receiver. `listen` returns at once; a
//! background task hands the already-buffered messages to the receiver and
//! only then installs it as the live sink. Deliveries are serialized, so the
//! receiver sees messages in arrival order.

use crate::capabilities::{Capabilities, QueueOperation};
use crate::error::QueueError;
use crate::message::{MessageEnvelope, QueueName, Timestamp};
use crate::options::QueueOptions;
use crate::queue::{Context, MessageQueue, MessageReceiver};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "cached_tests.rs"]
mod tests;

// ============================================================================
// Transport Contract
// ============================================================================

/// A transport that delivers messages by pushing them into a [`DeliverySink`].
///
/// Lease operations default to no-ops; transports override the ones their
/// broker supports and advertise them through `capabilities`.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities;

    /// Apply queue options; called at construction and on every `configure`
    fn configure(&self, _options: &QueueOptions) {}

    async fn open(&self, ctx: &Context) -> Result<(), QueueError>;

    async fn close(&self, ctx: &Context) -> Result<(), QueueError>;

    /// Start pushing deliveries into `sink`. Must be a no-op when already
    /// subscribed.
    async fn subscribe(&self, ctx: &Context, sink: DeliverySink) -> Result<(), QueueError>;

    async fn unsubscribe(&self, ctx: &Context) -> Result<(), QueueError>;

    async fn publish(&self, ctx: &Context, envelope: &MessageEnvelope) -> Result<(), QueueError>;

    async fn renew_lock(
        &self,
        _envelope: &mut MessageEnvelope,
        _lock_timeout: Duration,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn complete(&self, _envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        Ok(())
    }

    async fn abandon(&self, _envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        _envelope: &mut MessageEnvelope,
    ) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Destination for inbound deliveries
#[async_trait]
trait DeliveryTarget: Send + Sync {
    async fn deliver(&self, envelope: MessageEnvelope);
}

/// Handle a transport uses to push translated envelopes into its queue.
///
/// The sink holds the queue weakly; deliveries arriving after the queue is
/// dropped or closed are discarded.
#[derive(Clone)]
pub struct DeliverySink {
    target: Arc<dyn DeliveryTarget>,
}

impl DeliverySink {
    pub async fn deliver(&self, envelope: MessageEnvelope) {
        self.target.deliver(envelope).await;
    }
}

#[cfg(test)]
impl DeliverySink {
    /// Sink forwarding every delivery into a channel
    pub(crate) fn channel() -> (Self, tokio::sync::mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let sink = Self {
            target: Arc::new(ChannelTarget(sender)),
        };
        (sink, receiver)
    }
}

#[cfg(test)]
struct ChannelTarget(tokio::sync::mpsc::UnboundedSender<MessageEnvelope>);

#[cfg(test)]
#[async_trait]
impl DeliveryTarget for ChannelTarget {
    async fn deliver(&self, envelope: MessageEnvelope) {
        let _ = self.0.send(envelope);
    }
}

impl fmt::Debug for DeliverySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliverySink").finish_non_exhaustive()
    }
}

// ============================================================================
// CachedQueue
// ============================================================================

#[derive(Default)]
struct CacheState {
    messages: VecDeque<MessageEnvelope>,
    receiver: Option<Arc<dyn MessageReceiver>>,
    /// Bumped by `listen`, `end_listen` and `close`; a pending attach with an
    /// older value gives up
    listen_epoch: u64,
}

struct CachedInner<T: PushTransport> {
    name: QueueName,
    transport: T,
    options: RwLock<QueueOptions>,
    opened: AtomicBool,
    subscribed: AtomicBool,
    cache: Mutex<CacheState>,
    /// Held for the duration of every delivery, drained ones included
    delivery_lock: tokio::sync::Mutex<()>,
}

/// Pull-style queue over a push-only transport.
///
/// Cloning yields another handle to the same queue.
pub struct CachedQueue<T: PushTransport> {
    inner: Arc<CachedInner<T>>,
}

impl<T: PushTransport> Clone for CachedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueueSink<T: PushTransport> {
    queue: Weak<CachedInner<T>>,
}

#[async_trait]
impl<T: PushTransport> DeliveryTarget for QueueSink<T> {
    async fn deliver(&self, envelope: MessageEnvelope) {
        match self.queue.upgrade() {
            Some(inner) => CachedQueue { inner }.deliver(envelope).await,
            None => debug!(message_id = %envelope.message_id, "Queue dropped; discarding delivery"),
        }
    }
}

impl<T: PushTransport> CachedQueue<T> {
    /// Wrap `transport`; the queue must be opened before use
    pub fn with_transport(name: QueueName, options: QueueOptions, transport: T) -> Self {
        transport.configure(&options);
        Self {
            inner: Arc::new(CachedInner {
                name,
                transport,
                options: RwLock::new(options),
                opened: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                cache: Mutex::new(CacheState::default()),
                delivery_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Number of deliveries waiting in the local buffer
    pub fn buffered_count(&self) -> usize {
        self.cache().messages.len()
    }

    fn cache(&self) -> MutexGuard<'_, CacheState> {
        self.inner.cache.lock().unwrap_or_else(|e| e.into_inner())
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

    fn sink(&self) -> DeliverySink {
        DeliverySink {
            target: Arc::new(QueueSink {
                queue: Arc::downgrade(&self.inner),
            }),
        }
    }

    /// Subscribe on first use; later calls return immediately
    async fn ensure_subscribed(&self, ctx: &Context) -> Result<(), QueueError> {
        if self.inner.subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.transport.subscribe(ctx, self.sink()).await?;
        self.inner.subscribed.store(true, Ordering::SeqCst);
        debug!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Subscribed");
        Ok(())
    }

    /// Route one inbound delivery to the live receiver or the buffer
    async fn deliver(&self, envelope: MessageEnvelope) {
        if !self.is_open() {
            debug!(queue = %self.name(), message_id = %envelope.message_id, "Queue closed; discarding delivery");
            return;
        }

        let _ordered = self.inner.delivery_lock.lock().await;
        let receiver = self.cache().receiver.clone();
        match receiver {
            Some(receiver) => self.dispatch(receiver.as_ref(), envelope).await,
            None => {
                debug!(
                    queue = %self.name(),
                    message_id = %envelope.message_id,
                    trace_id = ?envelope.trace_id,
                    "Message buffered"
                );
                self.cache().messages.push_back(envelope);
            }
        }
    }

    async fn dispatch(&self, receiver: &dyn MessageReceiver, envelope: MessageEnvelope) {
        let message_id = envelope.message_id.clone();
        let trace_id = envelope.trace_id.clone();
        if let Err(e) = receiver.receive_message(envelope, self).await {
            warn!(
                queue = %self.name(),
                message_id = %message_id,
                trace_id = ?trace_id,
                error = %e,
                "Message receiver failed"
            );
        }
    }

    /// Hand buffered messages to `receiver` in order, then make it the live
    /// sink. Stops as soon as a newer `listen`, `end_listen` or `close` runs.
    async fn attach_listener(
        weak: Weak<CachedInner<T>>,
        receiver: Arc<dyn MessageReceiver>,
        epoch: u64,
    ) {
        let mut drained = 0usize;
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let queue = CachedQueue { inner };
            let _ordered = queue.inner.delivery_lock.lock().await;

            let next = {
                let mut cache = queue.cache();
                if cache.listen_epoch != epoch || !queue.is_open() {
                    debug!(queue = %queue.name(), drained, "Listener superseded before attaching");
                    return;
                }
                let next = cache.messages.pop_front();
                if next.is_none() {
                    cache.receiver = Some(Arc::clone(&receiver));
                }
                next
            };

            match next {
                Some(envelope) => {
                    queue.dispatch(receiver.as_ref(), envelope).await;
                    drained += 1;
                }
                None => {
                    debug!(queue = %queue.name(), drained, "Listener attached");
                    return;
                }
            }
        }
    }

    fn supports(&self, operation: QueueOperation) -> bool {
        self.capabilities().supports(operation)
    }
}

impl<T: PushTransport> fmt::Display for CachedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.inner.name)
    }
}

#[async_trait]
impl<T: PushTransport> MessageQueue for CachedQueue<T> {
    fn name(&self) -> &QueueName {
        &self.inner.name
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.transport.capabilities()
    }

    fn is_open(&self) -> bool {
        self.inner.opened.load(Ordering::SeqCst)
    }

    fn configure(&self, options: QueueOptions) {
        self.inner.transport.configure(&options);
        *self.inner.options.write().unwrap_or_else(|e| e.into_inner()) = options;
    }

    async fn open(&self, ctx: &Context) -> Result<(), QueueError> {
        if self.is_open() {
            return Ok(());
        }

        self.inner.transport.open(ctx).await?;
        self.inner.opened.store(true, Ordering::SeqCst);

        if self.options().auto_subscribe {
            if let Err(e) = self.ensure_subscribed(ctx).await {
                warn!(queue = %self.name(), error = %e, "Subscribe at open failed; closing");
                if let Err(close_err) = self.close(ctx).await {
                    debug!(queue = %self.name(), error = %close_err, "Close after failed open also failed");
                }
                return Err(e);
            }
        }

        info!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Opened queue");
        Ok(())
    }

    async fn close(&self, ctx: &Context) -> Result<(), QueueError> {
        if !self.inner.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if self.inner.subscribed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.inner.transport.unsubscribe(ctx).await {
                warn!(queue = %self.name(), error = %e, "Unsubscribe failed during close");
            }
        }
        {
            let mut cache = self.cache();
            cache.messages.clear();
            cache.receiver = None;
            cache.listen_epoch += 1;
        }

        self.inner.transport.close(ctx).await?;
        info!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Closed queue");
        Ok(())
    }

    async fn send(&self, ctx: &Context, envelope: MessageEnvelope) -> Result<(), QueueError> {
        self.check_open()?;

        let mut outbound = envelope.detached();
        outbound.sent_time = Some(Timestamp::now());
        self.inner.transport.publish(ctx, &outbound).await?;

        debug!(
            queue = %self.name(),
            message_id = %outbound.message_id,
            message_type = %outbound.message_type,
            trace_id = ?outbound.trace_id.as_deref().or(ctx.trace_id()),
            "Message sent"
        );
        Ok(())
    }

    async fn peek(&self, ctx: &Context) -> Result<Option<MessageEnvelope>, QueueError> {
        self.check_open()?;
        self.ensure_subscribed(ctx).await?;
        Ok(self.cache().messages.front().cloned())
    }

    async fn peek_batch(
        &self,
        ctx: &Context,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, QueueError> {
        self.check_open()?;
        self.ensure_subscribed(ctx).await?;
        Ok(self.cache().messages.iter().take(count).cloned().collect())
    }

    async fn receive(
        &self,
        ctx: &Context,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, QueueError> {
        self.check_open()?;
        self.ensure_subscribed(ctx).await?;

        let poll_interval = self.options().poll_interval().to_std().unwrap_or_default();
        let deadline = tokio::time::Instant::now() + wait_timeout.to_std().unwrap_or_default();

        loop {
            if !self.is_open() {
                return Ok(None);
            }

            let next = self.cache().messages.pop_front();
            if let Some(envelope) = next {
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
        if !self.supports(QueueOperation::RenewLock) {
            return Ok(());
        }
        self.inner.transport.renew_lock(envelope, lock_timeout).await
    }

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        self.check_open()?;
        self.inner.transport.complete(envelope).await
    }

    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        self.check_open()?;
        if !self.supports(QueueOperation::Abandon) {
            return Ok(());
        }
        self.inner.transport.abandon(envelope).await
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), QueueError> {
        self.check_open()?;
        if !self.supports(QueueOperation::DeadLetter) {
            return Ok(());
        }
        self.inner.transport.move_to_dead_letter(envelope).await
    }

    async fn listen(
        &self,
        ctx: &Context,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), QueueError> {
        self.check_open()?;
        self.ensure_subscribed(ctx).await?;

        // Deliveries buffer until the new receiver is attached
        let (epoch, replaced) = {
            let mut cache = self.cache();
            cache.listen_epoch += 1;
            (cache.listen_epoch, cache.receiver.take())
        };
        if replaced.is_some() {
            debug!(queue = %self.name(), "Replacing active listener");
        }

        tokio::spawn(Self::attach_listener(
            Arc::downgrade(&self.inner),
            receiver,
            epoch,
        ));
        debug!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Started listening");
        Ok(())
    }

    async fn end_listen(&self, ctx: &Context) {
        let previous = {
            let mut cache = self.cache();
            cache.listen_epoch += 1;
            cache.receiver.take()
        };
        if previous.is_some() {
            debug!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Stopped listening");
        }
    }

    async fn read_message_count(&self) -> Result<usize, QueueError> {
        self.check_open()?;
        if !self.supports(QueueOperation::MessageCount) {
            return Ok(0);
        }
        Ok(self.buffered_count())
    }

    async fn clear(&self, ctx: &Context) -> Result<(), QueueError> {
        self.check_open()?;
        if !self.supports(QueueOperation::Clear) {
            return Ok(());
        }
        self.cache().messages.clear();
        debug!(queue = %self.name(), trace_id = ?ctx.trace_id(), "Cleared queue");
        Ok(())
    }
}
