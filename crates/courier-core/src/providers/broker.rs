//! Queue backed by an external broker reached through a [`TransportDriver`].
//!
//! [`BrokerTransport`] adapts a driver to [`PushTransport`]: sends become
//! publishes, the subscription is kept alive by a [`SubscriptionSupervisor`],
//! and on drivers exposing partition offsets `complete` commits the record's
//! offset while `abandon` rewinds the consumer group to it.
//!
//! Rewinding redelivers the abandoned record and everything published after
//! it, so consumers see duplicates; that is the at-least-once contract of an
//! offset-based broker.

use super::cached::{CachedQueue, DeliverySink, PushTransport};
use crate::capabilities::{Capabilities, QueueOperation};
use crate::error::QueueError;
use crate::message::{MessageEnvelope, QueueName, ReferenceKind};
use crate::options::{BrokerOptions, QueueOptions};
use crate::queue::Context;
use crate::supervisor::{SubscriptionState, SubscriptionSupervisor, SubscriptionTarget};
use crate::transport::{
    encode_record, BrokerConnection, ConnectionParams, RecordPosition, TransportDriver,
    TransportError,
};
use async_trait::async_trait;
use std::sync::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

/// Push transport over a broker driver
pub struct BrokerTransport<D: TransportDriver> {
    connection: BrokerConnection<D>,
    broker: BrokerOptions,
    topic: String,
    recovery_pause: RwLock<std::time::Duration>,
    /// Parameters resolved at the last open of an owned connection
    params: Mutex<Option<ConnectionParams>>,
    supervisor: tokio::sync::Mutex<Option<SubscriptionSupervisor<D>>>,
}

/// Broker-backed queue: a cached-receive adapter over [`BrokerTransport`]
pub type BrokerQueue<D> = CachedQueue<BrokerTransport<D>>;

impl<D: TransportDriver> CachedQueue<BrokerTransport<D>> {
    pub fn new(
        name: QueueName,
        options: QueueOptions,
        broker: BrokerOptions,
        connection: BrokerConnection<D>,
    ) -> Self {
        let transport = BrokerTransport::new(&name, broker, connection);
        CachedQueue::with_transport(name, options, transport)
    }
}

impl<D: TransportDriver> BrokerTransport<D> {
    pub fn new(queue: &QueueName, broker: BrokerOptions, connection: BrokerConnection<D>) -> Self {
        let topic = broker.topic_for(queue);
        Self {
            connection,
            broker,
            topic,
            recovery_pause: RwLock::new(std::time::Duration::ZERO),
            params: Mutex::new(None),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn driver(&self) -> &D {
        self.connection.driver()
    }

    /// Current state of the supervised subscription
    pub async fn subscription_state(&self) -> SubscriptionState {
        self.supervisor
            .lock()
            .await
            .as_ref()
            .map_or(SubscriptionState::Unsubscribed, |s| s.state())
    }

    /// Watch the supervised subscription, if one has been started
    pub async fn watch_subscription(&self) -> Option<watch::Receiver<SubscriptionState>> {
        self.supervisor.lock().await.as_ref().map(|s| s.watch_state())
    }

    /// Recovery runs started by the current subscription
    pub async fn recovery_runs(&self) -> u64 {
        self.supervisor
            .lock()
            .await
            .as_ref()
            .map_or(0, |s| s.recovery_runs())
    }

    fn offset_of(envelope: &mut MessageEnvelope) -> Option<RecordPosition> {
        match envelope.take_delivery_reference()?.kind() {
            ReferenceKind::Offset(position) => Some(*position),
            ReferenceKind::Lease(_) => None,
        }
    }

    async fn stop_supervisor(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
    }
}

#[async_trait]
impl<D: TransportDriver> PushTransport for BrokerTransport<D> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::buffered().with(QueueOperation::Abandon, self.driver().features().offsets)
    }

    fn configure(&self, options: &QueueOptions) {
        let pause = options.recovery_pause().to_std().unwrap_or_default();
        *self
            .recovery_pause
            .write()
            .unwrap_or_else(|e| e.into_inner()) = pause;
    }

    async fn open(&self, ctx: &Context) -> Result<(), QueueError> {
        let params = self.connection.open(ctx).await?;
        info!(
            transport = self.driver().name(),
            topic = %self.topic,
            owned = self.connection.is_owned(),
            address = ?params.as_ref().and_then(|p| p.address()),
            trace_id = ?ctx.trace_id(),
            "Connected to broker"
        );
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = params;
        Ok(())
    }

    async fn close(&self, ctx: &Context) -> Result<(), QueueError> {
        self.stop_supervisor().await;
        self.connection.close().await?;
        debug!(transport = self.driver().name(), trace_id = ?ctx.trace_id(), "Broker connection released");
        Ok(())
    }

    async fn subscribe(&self, ctx: &Context, sink: DeliverySink) -> Result<(), QueueError> {
        let mut slot = self.supervisor.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.state() != SubscriptionState::Terminated {
                return Ok(());
            }
        }

        let reconnect_with = self
            .params
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let recovery_pause = *self.recovery_pause.read().unwrap_or_else(|e| e.into_inner());
        let supervisor = SubscriptionSupervisor::new(
            std::sync::Arc::clone(self.connection.driver()),
            reconnect_with,
            SubscriptionTarget {
                topic: self.topic.clone(),
                group: self.broker.group.clone(),
                codec: self.broker.codec,
            },
            sink,
            recovery_pause,
        );
        supervisor.start().await?;
        *slot = Some(supervisor);

        info!(
            topic = %self.topic,
            group = %self.broker.group,
            client_id = %self.broker.client_id,
            trace_id = ?ctx.trace_id(),
            "Subscribed to broker"
        );
        Ok(())
    }

    async fn unsubscribe(&self, _ctx: &Context) -> Result<(), QueueError> {
        self.stop_supervisor().await;
        Ok(())
    }

    async fn publish(&self, _ctx: &Context, envelope: &MessageEnvelope) -> Result<(), QueueError> {
        let record = encode_record(self.broker.codec, envelope)?;
        self.driver().publish(&self.topic, record).await?;
        Ok(())
    }

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        let Some(position) = Self::offset_of(envelope) else {
            return Ok(());
        };
        if self.broker.auto_commit {
            return Ok(());
        }

        match self
            .driver()
            .commit(&self.topic, &self.broker.group, position)
            .await
        {
            Ok(()) | Err(TransportError::Unsupported(_)) => {}
            Err(e) => return Err(e.into()),
        }
        debug!(
            topic = %self.topic,
            message_id = %envelope.message_id,
            trace_id = ?envelope.trace_id,
            offset = position.offset,
            "Message completed"
        );
        Ok(())
    }

    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), QueueError> {
        let Some(position) = Self::offset_of(envelope) else {
            return Ok(());
        };

        self.driver()
            .seek(&self.topic, &self.broker.group, position)
            .await?;
        debug!(
            topic = %self.topic,
            message_id = %envelope.message_id,
            trace_id = ?envelope.trace_id,
            offset = position.offset,
            "Message abandoned"
        );
        Ok(())
    }
}
