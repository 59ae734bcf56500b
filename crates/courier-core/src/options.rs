//! Queue configuration types.
//!
//! Durations are carried as milliseconds so the structures deserialize
//! cleanly from YAML files and environment variables; accessors convert them
//! to `chrono::Duration` for the queue code.

use crate::error::{ConfigurationError, ValidationError};
use crate::message::QueueName;
use crate::transport::ConnectionParams;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Timing and subscription options shared by every queue implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Interval between buffer polls while a receive is waiting
    pub poll_interval_ms: u64,
    /// Wait timeout used by each receive issued from the listen loop
    pub listen_timeout_ms: u64,
    /// Lease length applied when a receive is issued without a wait timeout
    pub lease_timeout_ms: u64,
    /// Subscribe at open instead of on first receive/listen
    pub auto_subscribe: bool,
    /// Pause between failed subscription recovery attempts
    pub recovery_pause_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            listen_timeout_ms: 1000,
            lease_timeout_ms: 60_000,
            auto_subscribe: false,
            recovery_pause_ms: 100,
        }
    }
}

impl QueueOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::milliseconds(self.poll_interval_ms.max(1) as i64)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::milliseconds(self.listen_timeout_ms as i64)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::milliseconds(self.lease_timeout_ms as i64)
    }

    pub fn recovery_pause(&self) -> Duration {
        Duration::milliseconds(self.recovery_pause_ms as i64)
    }

    /// Enable subscription at open
    pub fn with_auto_subscribe(mut self, auto_subscribe: bool) -> Self {
        self.auto_subscribe = auto_subscribe;
        self
    }

    /// Override the receive poll interval
    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Override the listen loop receive timeout
    pub fn with_listen_timeout_ms(mut self, listen_timeout_ms: u64) -> Self {
        self.listen_timeout_ms = listen_timeout_ms;
        self
    }
}

/// How envelopes are laid out inside transport records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCodec {
    /// Metadata in record headers, payload as the raw body
    #[default]
    Headers,
    /// Whole envelope in its JSON wire form as the body
    Json,
}

/// Options for queues backed by an external broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Topic/subject to publish to and subscribe on; defaults to the queue name
    pub topic: Option<String>,
    /// Consumer group identity
    pub group: String,
    /// Client identifier presented to the broker
    pub client_id: String,
    pub codec: RecordCodec,
    /// Let the broker commit offsets itself instead of committing on complete
    pub auto_commit: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            topic: None,
            group: "courier".to_string(),
            client_id: format!("courier-{}", uuid::Uuid::new_v4().simple()),
            codec: RecordCodec::default(),
            auto_commit: false,
        }
    }
}

impl BrokerOptions {
    /// Topic for the given queue, falling back to the queue name
    pub fn topic_for(&self, queue: &QueueName) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| queue.as_str().to_string())
    }
}

/// Kind of queue built by the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// In-process reference broker
    #[default]
    Memory,
    /// Broker-backed queue over the in-process loopback transport
    Loopback,
}

/// Complete configuration for one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub kind: QueueKind,
    pub options: QueueOptions,
    pub broker: BrokerOptions,
    pub connection: ConnectionParams,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            kind: QueueKind::default(),
            options: QueueOptions::default(),
            broker: BrokerOptions::default(),
            connection: ConnectionParams::default(),
        }
    }
}

impl QueueConfig {
    /// Validated queue name
    pub fn queue_name(&self) -> Result<QueueName, ValidationError> {
        QueueName::new(self.name.clone())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.queue_name()
            .map_err(|e| ConfigurationError::Invalid {
                message: e.to_string(),
            })?;

        if self.options.listen_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "options.listen_timeout_ms must be positive".to_string(),
            });
        }

        if self.kind == QueueKind::Loopback && self.broker.group.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "broker.group".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;
