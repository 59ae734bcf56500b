//! Queue contract shared by every transport.

use crate::capabilities::Capabilities;
use crate::error::QueueError;
use crate::message::{MessageEnvelope, QueueName};
use crate::options::{QueueConfig, QueueKind, QueueOptions};
use crate::providers::{BrokerQueue, MemoryQueue};
use crate::transport::{
    BrokerConnection, ConnectionParams, LoopbackDriver, StaticConnectionResolver,
};
use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;

/// Per-call context carried into logs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    trace_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }
}

/// Sink for messages pushed by [`MessageQueue::listen`].
///
/// An error marks the message as not processed; it is logged and the listen
/// loop moves on to the next message.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    async fn receive_message(
        &self,
        envelope: MessageEnvelope,
        queue: &dyn MessageQueue,
    ) -> anyhow::Result<()>;
}

/// Uniform queue contract.
///
/// Lifecycle: constructed → configured → opened → operating → closed. A closed
/// queue can be opened again. Every operation except `configure`, `name`,
/// `capabilities` and `is_open` fails with [`QueueError::NotOpened`] while the
/// queue is closed.
///
/// Operations the queue does not advertise in its [`Capabilities`] are silent
/// no-ops; callers branch on the descriptor rather than on errors.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &QueueName;

    fn capabilities(&self) -> Capabilities;

    fn is_open(&self) -> bool;

    /// Replace timing and subscription options; takes effect on next open
    fn configure(&self, options: QueueOptions);

    async fn open(&self, ctx: &Context) -> Result<(), QueueError>;

    async fn close(&self, ctx: &Context) -> Result<(), QueueError>;

    async fn send(&self, ctx: &Context, envelope: MessageEnvelope) -> Result<(), QueueError>;

    async fn peek(&self, ctx: &Context) -> Result<Option<MessageEnvelope>, QueueError>;

    async fn peek_batch(
        &self,
        ctx: &Context,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, QueueError>;

    /// Wait up to `wait_timeout` for a message
    async fn receive(
        &self,
        ctx: &Context,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, QueueError>;

    async fn renew_lock(
        &self,
        envelope: &mut MessageEnvelope,
        lock_timeout: Duration,
    ) -> Result<(), QueueError>;

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError>;

    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError>;

    async fn move_to_dead_letter(&self, envelope: &mut MessageEnvelope)
        -> Result<(), QueueError>;

    /// Start pushing messages to `receiver`; returns without waiting
    async fn listen(
        &self,
        ctx: &Context,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), QueueError>;

    async fn end_listen(&self, ctx: &Context);

    async fn read_message_count(&self) -> Result<usize, QueueError>;

    async fn clear(&self, ctx: &Context) -> Result<(), QueueError>;
}

/// Convenience operations available on every queue
#[async_trait]
pub trait MessageQueueExt: MessageQueue {
    /// Serialize `value` as JSON and send it under `message_type`
    async fn send_as_object<T>(
        &self,
        ctx: &Context,
        message_type: &str,
        value: &T,
    ) -> Result<(), QueueError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let envelope = MessageEnvelope::from_json_value(
            ctx.trace_id().map(str::to_string),
            message_type,
            value,
        )?;
        self.send(ctx, envelope).await
    }
}

impl<Q: MessageQueue + ?Sized> MessageQueueExt for Q {}

/// Factory for creating queues from configuration
pub struct QueueFactory;

impl QueueFactory {
    /// Create queue from configuration
    pub fn create(config: &QueueConfig) -> Result<Box<dyn MessageQueue>, QueueError> {
        config.validate()?;
        let name = config.queue_name()?;

        let queue: Box<dyn MessageQueue> = match config.kind {
            QueueKind::Memory => Box::new(MemoryQueue::new(name, config.options.clone())),
            QueueKind::Loopback => {
                let params = if config.connection.address().is_some() {
                    config.connection.clone()
                } else {
                    ConnectionParams::from_uri("loopback://local")
                };
                let connection = BrokerConnection::local(
                    LoopbackDriver::new(),
                    Arc::new(StaticConnectionResolver::new(params)),
                );
                Box::new(BrokerQueue::new(
                    name,
                    config.options.clone(),
                    config.broker.clone(),
                    connection,
                ))
            }
        };

        Ok(queue)
    }

    /// Create an unopened in-memory queue with default options
    pub fn create_test_queue(name: &str) -> Result<Box<dyn MessageQueue>, QueueError> {
        let name = QueueName::new(name.to_string())?;
        Ok(Box::new(MemoryQueue::new(name, QueueOptions::default())))
    }
}
