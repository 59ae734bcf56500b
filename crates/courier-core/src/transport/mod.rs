//! Transport driver contract.
//!
//! A driver wraps the client library of one external broker. The queue core
//! depends only on what is declared here: connect/disconnect, publish,
//! callback-based subscribe returning a handle, unsubscribe through that
//! handle, and optional commit/seek of partition offsets.

use crate::error::{ConfigurationError, QueueError};
use crate::queue::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod codec;
pub mod loopback;

pub use codec::{decode_record, encode_record};
pub use loopback::LoopbackDriver;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// ============================================================================
// Error Types
// ============================================================================

/// Driver-level failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Operation not supported by transport: {0}")]
    Unsupported(String),

    #[error("Subscription already closed")]
    Closed,
}

impl From<TransportError> for QueueError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected | TransportError::ConnectFailed(_) => {
                QueueError::ConnectionFailed {
                    message: err.to_string(),
                }
            }
            other => QueueError::Transport {
                transport: "driver".to_string(),
                message: other.to_string(),
            },
        }
    }
}

// ============================================================================
// Records and Events
// ============================================================================

/// Location of a record inside a partitioned log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

/// A message as the broker sees it: headers plus opaque body
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportRecord {
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Set by drivers that expose partition offsets
    pub position: Option<RecordPosition>,
}

impl TransportRecord {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
            position: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Events a driver pushes into a subscription callback
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A record delivered to this subscription
    Record(TransportRecord),
    /// The subscription terminated abnormally; no more records will arrive
    Failed(String),
}

/// Callback installed by `subscribe`. Drivers invoke it from their own
/// threads and tasks, so it must return quickly and never block.
pub type TransportCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Handle for one live subscription
#[async_trait]
pub trait TransportSubscription: Send + Sync {
    /// Stop delivery to this subscription
    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError>;
}

/// Optional features a driver exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverFeatures {
    /// Records carry partition offsets that can be committed and sought
    pub offsets: bool,
}

/// Client library of one external broker
#[async_trait]
pub trait TransportDriver: Send + Sync + 'static {
    /// Short transport name used in logs and errors
    fn name(&self) -> &str;

    fn features(&self) -> DriverFeatures;

    fn is_connected(&self) -> bool;

    async fn connect(&self, params: &ConnectionParams) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, record: TransportRecord) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        callback: TransportCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError>;

    /// Mark everything up to and including `position` as consumed by `group`
    async fn commit(
        &self,
        _topic: &str,
        _group: &str,
        _position: RecordPosition,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("commit".to_string()))
    }

    /// Rewind `group` so delivery resumes at `position`
    async fn seek(
        &self,
        _topic: &str,
        _group: &str,
        _position: RecordPosition,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("seek".to_string()))
    }
}

// ============================================================================
// Connection Resolution
// ============================================================================

/// Transport-specific connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub uri: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub options: HashMap<String, String>,
}

impl ConnectionParams {
    /// Parameters pointing at a single broker URI
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    /// Broker address as `uri`, or `host:port` when no URI is set
    pub fn address(&self) -> Option<String> {
        if let Some(uri) = &self.uri {
            return Some(uri.clone());
        }
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            (Some(host), None) => Some(host.clone()),
            _ => None,
        }
    }
}

/// Resolves connection parameters when a queue opens
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, ctx: &Context) -> Result<ConnectionParams, ConfigurationError>;
}

/// Resolver serving a fixed set of parameters
#[derive(Debug, Clone, Default)]
pub struct StaticConnectionResolver {
    params: ConnectionParams,
}

impl StaticConnectionResolver {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl ConnectionResolver for StaticConnectionResolver {
    async fn resolve(&self, _ctx: &Context) -> Result<ConnectionParams, ConfigurationError> {
        if self.params.address().is_none() {
            return Err(ConfigurationError::Resolution {
                message: "neither uri nor host is configured".to_string(),
            });
        }
        Ok(self.params.clone())
    }
}

// ============================================================================
// Connection Ownership
// ============================================================================

/// A driver plus the knowledge of who owns its connection.
///
/// A queue given a shared connection never connects or disconnects it; the
/// owner of the shared connection does that. A queue built with a local
/// connection resolves parameters at open, connects, and disconnects at close.
pub struct BrokerConnection<D: TransportDriver> {
    driver: Arc<D>,
    ownership: Ownership,
}

enum Ownership {
    Local(Arc<dyn ConnectionResolver>),
    Shared,
}

impl<D: TransportDriver> BrokerConnection<D> {
    /// Private connection owned by the queue
    pub fn local(driver: D, resolver: Arc<dyn ConnectionResolver>) -> Self {
        Self {
            driver: Arc::new(driver),
            ownership: Ownership::Local(resolver),
        }
    }

    /// Connection owned elsewhere and shared between queues
    pub fn shared(driver: Arc<D>) -> Self {
        Self {
            driver,
            ownership: Ownership::Shared,
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Local(_))
    }

    /// Resolve parameters and connect if this queue owns the connection
    pub(crate) async fn open(&self, ctx: &Context) -> Result<Option<ConnectionParams>, QueueError> {
        match &self.ownership {
            Ownership::Local(resolver) => {
                let params = resolver.resolve(ctx).await?;
                self.driver.connect(&params).await?;
                Ok(Some(params))
            }
            Ownership::Shared => {
                if !self.driver.is_connected() {
                    return Err(QueueError::ConnectionFailed {
                        message: format!("shared {} connection is not open", self.driver.name()),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Disconnect if this queue owns the connection
    pub(crate) async fn close(&self) -> Result<(), QueueError> {
        if self.is_owned() {
            self.driver.disconnect().await?;
        }
        Ok(())
    }
}
