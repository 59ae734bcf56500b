//! Message envelope and the core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use crate::transport::RecordPosition;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Dots are allowed so broker subjects ("orders.created") can double as names
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and dots allowed"
                    .to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages, assigned once when the envelope is built
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp shifted by the given duration
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }

    /// True once the current time has reached this timestamp
    pub fn is_past(&self) -> bool {
        Utc::now() >= self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = DateTime::parse_from_rfc3339(s)?;
        Ok(Self::from_datetime(dt.with_timezone(&Utc)))
    }
}

// ============================================================================
// Delivery Reference
// ============================================================================

/// Opaque token identifying one in-flight delivery of a message.
///
/// Only the queue that delivered a message writes this value. Consumers hand
/// it back implicitly through the envelope and never interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReference(ReferenceKind);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReferenceKind {
    /// Lease token issued by the in-memory broker
    Lease(u64),
    /// Partition offset of the record on an external broker
    Offset(RecordPosition),
}

impl DeliveryReference {
    pub(crate) fn lease(token: u64) -> Self {
        Self(ReferenceKind::Lease(token))
    }

    pub(crate) fn offset(position: RecordPosition) -> Self {
        Self(ReferenceKind::Offset(position))
    }

    pub(crate) fn kind(&self) -> &ReferenceKind {
        &self.0
    }
}

impl fmt::Display for DeliveryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ReferenceKind::Lease(token) => write!(f, "lease:{}", token),
            ReferenceKind::Offset(position) => {
                write!(f, "offset:{}@{}", position.partition, position.offset)
            }
        }
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// The unit of transport: metadata plus an opaque payload.
///
/// The serialized form is the cross-process JSON representation:
/// `{message_id, trace_id, message_type, sent_time, message}` where `message`
/// carries the payload as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub message_type: String,
    #[serde(default)]
    pub sent_time: Option<Timestamp>,
    #[serde(rename = "message", default, with = "payload_base64")]
    pub payload: Bytes,
    #[serde(skip)]
    delivery_reference: Option<DeliveryReference>,
}

/// Custom serialization for the payload bytes
mod payload_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl MessageEnvelope {
    /// Create a new envelope with a fresh message id
    pub fn new(
        trace_id: Option<String>,
        message_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            trace_id,
            message_type: message_type.into(),
            sent_time: None,
            payload: payload.into(),
            delivery_reference: None,
        }
    }

    /// Create an envelope whose payload is the JSON form of `value`
    pub fn from_json_value<T: Serialize + ?Sized>(
        trace_id: Option<String>,
        message_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, SerializationError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(trace_id, message_type, payload))
    }

    /// Attach a trace id for end-to-end correlation
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Payload interpreted as UTF-8 text
    pub fn payload_as_str(&self) -> Result<&str, SerializationError> {
        std::str::from_utf8(&self.payload).map_err(|_| SerializationError::InvalidUtf8)
    }

    /// Payload decoded from JSON
    pub fn payload_as_json<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Reference of the delivery currently leased to a consumer, if any
    pub fn delivery_reference(&self) -> Option<&DeliveryReference> {
        self.delivery_reference.as_ref()
    }

    /// True while the envelope is in flight to a consumer
    pub fn is_leased(&self) -> bool {
        self.delivery_reference.is_some()
    }

    pub(crate) fn set_delivery_reference(&mut self, reference: DeliveryReference) {
        self.delivery_reference = Some(reference);
    }

    pub(crate) fn take_delivery_reference(&mut self) -> Option<DeliveryReference> {
        self.delivery_reference.take()
    }

    /// Copy of the envelope without its delivery reference
    pub(crate) fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.delivery_reference = None;
        copy
    }

    /// Encode into the JSON wire form
    pub fn to_json(&self) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form
    pub fn from_json(json: &str) -> Result<Self, SerializationError> {
        let envelope: Self = serde_json::from_str(json)?;
        if envelope.message_id.as_str().is_empty() {
            return Err(SerializationError::InvalidHeader {
                key: "message_id".to_string(),
            });
        }
        Ok(envelope)
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(50).collect();
        let ellipsis = if text.chars().count() > 50 { "..." } else { "" };
        write!(
            f,
            "[{},{},{}{}]",
            self.message_id, self.message_type, preview, ellipsis
        )
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
