//! Capability descriptor declared by every queue implementation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operations a queue may or may not support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    MessageCount,
    Send,
    Receive,
    Peek,
    PeekBatch,
    RenewLock,
    Abandon,
    DeadLetter,
    Clear,
}

impl QueueOperation {
    /// All operations, in declaration order
    pub const ALL: [QueueOperation; 9] = [
        Self::MessageCount,
        Self::Send,
        Self::Receive,
        Self::Peek,
        Self::PeekBatch,
        Self::RenewLock,
        Self::Abandon,
        Self::DeadLetter,
        Self::Clear,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageCount => "message_count",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Peek => "peek",
            Self::PeekBatch => "peek_batch",
            Self::RenewLock => "renew_lock",
            Self::Abandon => "abandon",
            Self::DeadLetter => "dead_letter",
            Self::Clear => "clear",
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed set of flags describing what a queue can do.
///
/// Set once when the queue is constructed and never changed afterwards.
/// Callers and generic test fixtures branch on these flags instead of on the
/// concrete queue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_message_count: bool,
    pub can_send: bool,
    pub can_receive: bool,
    pub can_peek: bool,
    pub can_peek_batch: bool,
    pub can_renew_lock: bool,
    pub can_abandon: bool,
    pub can_dead_letter: bool,
    pub can_clear: bool,
}

impl Capabilities {
    /// Every operation supported (the in-memory broker)
    pub const fn full() -> Self {
        Self {
            can_message_count: true,
            can_send: true,
            can_receive: true,
            can_peek: true,
            can_peek_batch: true,
            can_renew_lock: true,
            can_abandon: true,
            can_dead_letter: true,
            can_clear: true,
        }
    }

    /// Baseline for push-subscribed transports buffered locally: no lease
    /// semantics, everything else served from the local buffer
    pub const fn buffered() -> Self {
        Self {
            can_message_count: true,
            can_send: true,
            can_receive: true,
            can_peek: true,
            can_peek_batch: true,
            can_renew_lock: false,
            can_abandon: false,
            can_dead_letter: false,
            can_clear: true,
        }
    }

    /// Toggle support for a single operation
    pub const fn with(mut self, operation: QueueOperation, supported: bool) -> Self {
        match operation {
            QueueOperation::MessageCount => self.can_message_count = supported,
            QueueOperation::Send => self.can_send = supported,
            QueueOperation::Receive => self.can_receive = supported,
            QueueOperation::Peek => self.can_peek = supported,
            QueueOperation::PeekBatch => self.can_peek_batch = supported,
            QueueOperation::RenewLock => self.can_renew_lock = supported,
            QueueOperation::Abandon => self.can_abandon = supported,
            QueueOperation::DeadLetter => self.can_dead_letter = supported,
            QueueOperation::Clear => self.can_clear = supported,
        }
        self
    }

    /// Check whether an operation is supported
    pub fn supports(&self, operation: QueueOperation) -> bool {
        match operation {
            QueueOperation::MessageCount => self.can_message_count,
            QueueOperation::Send => self.can_send,
            QueueOperation::Receive => self.can_receive,
            QueueOperation::Peek => self.can_peek,
            QueueOperation::PeekBatch => self.can_peek_batch,
            QueueOperation::RenewLock => self.can_renew_lock,
            QueueOperation::Abandon => self.can_abandon,
            QueueOperation::DeadLetter => self.can_dead_letter,
            QueueOperation::Clear => self.can_clear,
        }
    }

    /// Operations this descriptor does not support
    pub fn unsupported(&self) -> Vec<QueueOperation> {
        QueueOperation::ALL
            .into_iter()
            .filter(|op| !self.supports(*op))
            .collect()
    }
}

#[cfg(test)]
#[path = "capabilities_tests.rs"]
mod tests;
