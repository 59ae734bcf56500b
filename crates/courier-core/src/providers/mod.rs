//! Queue implementations.
//!
//! - [`MemoryQueue`]: in-process reference broker with full lease semantics
//! - [`CachedQueue`]: pull-style adapter over any push-only [`PushTransport`]
//! - [`BrokerQueue`]: cached queue over an external broker driver

pub mod broker;
pub mod cached;
pub mod memory;

pub use broker::{BrokerQueue, BrokerTransport};
pub use cached::{CachedQueue, DeliverySink, PushTransport};
pub use memory::{MemoryQueue, QueueStats};
