//! # Courier Core
//!
//! Message queue abstraction with interchangeable transports.
//!
//! This library provides:
//! - One queue contract for send, peek, receive, acknowledge, abandon,
//!   dead-letter and listen
//! - An in-memory reference broker with lease-based at-least-once delivery
//! - A cached-receive adapter turning push-only subscriptions into pollable
//!   queues
//! - A subscription supervisor that resubscribes after transport failures
//! - An in-process loopback broker driver for tests and local development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Envelope, identifiers and delivery references
//! - [`capabilities`] - Capability descriptor declared by every queue
//! - [`options`] - Queue and broker configuration
//! - [`queue`] - The queue contract, receivers and the factory
//! - [`providers`] - Queue implementations
//! - [`supervisor`] - Resilient subscription supervision
//! - [`transport`] - Broker driver contract and the loopback driver

// Module declarations
pub mod capabilities;
pub mod error;
pub mod message;
pub mod options;
pub mod providers;
pub mod queue;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use capabilities::{Capabilities, QueueOperation};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{DeliveryReference, MessageEnvelope, MessageId, QueueName, Timestamp};
pub use options::{BrokerOptions, QueueConfig, QueueKind, QueueOptions, RecordCodec};
pub use providers::{
    BrokerQueue, BrokerTransport, CachedQueue, DeliverySink, MemoryQueue, PushTransport,
    QueueStats,
};
pub use queue::{Context, MessageQueue, MessageQueueExt, MessageReceiver, QueueFactory};
pub use supervisor::{SubscriptionState, SubscriptionSupervisor, SubscriptionTarget};
pub use transport::{
    BrokerConnection, ConnectionParams, ConnectionResolver, LoopbackDriver,
    StaticConnectionResolver, TransportDriver, TransportError,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
