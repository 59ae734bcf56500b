//! Translation between envelopes and transport records.

use super::TransportRecord;
use crate::error::SerializationError;
use crate::message::{DeliveryReference, MessageEnvelope, MessageId, Timestamp};
use crate::options::RecordCodec;
use std::str::FromStr;

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

pub const HEADER_MESSAGE_ID: &str = "message_id";
pub const HEADER_MESSAGE_TYPE: &str = "message_type";
pub const HEADER_TRACE_ID: &str = "trace_id";
pub const HEADER_SENT_TIME: &str = "sent_time";
pub const HEADER_CONTENT_TYPE: &str = "content_type";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Lay an envelope out as a transport record
pub fn encode_record(
    codec: RecordCodec,
    envelope: &MessageEnvelope,
) -> Result<TransportRecord, SerializationError> {
    match codec {
        RecordCodec::Headers => {
            let mut record = TransportRecord::new(envelope.payload.clone())
                .with_header(HEADER_MESSAGE_ID, envelope.message_id.as_str())
                .with_header(HEADER_MESSAGE_TYPE, envelope.message_type.as_str());
            if let Some(trace_id) = &envelope.trace_id {
                record = record.with_header(HEADER_TRACE_ID, trace_id.as_str());
            }
            if let Some(sent_time) = envelope.sent_time {
                record = record.with_header(HEADER_SENT_TIME, sent_time.to_string());
            }
            Ok(record)
        }
        RecordCodec::Json => {
            let body = envelope.to_json()?;
            Ok(TransportRecord::new(body).with_header(HEADER_CONTENT_TYPE, JSON_CONTENT_TYPE))
        }
    }
}

/// Rebuild an envelope from a transport record.
///
/// When the record carries a partition position, the envelope comes back
/// with an offset delivery reference so it can later be committed or
/// rewound.
pub fn decode_record(
    codec: RecordCodec,
    record: &TransportRecord,
) -> Result<MessageEnvelope, SerializationError> {
    let mut envelope = match codec {
        RecordCodec::Headers => decode_headers(record)?,
        RecordCodec::Json => {
            let body =
                std::str::from_utf8(&record.body).map_err(|_| SerializationError::InvalidUtf8)?;
            MessageEnvelope::from_json(body)?
        }
    };

    if let Some(position) = record.position {
        envelope.set_delivery_reference(DeliveryReference::offset(position));
    }
    Ok(envelope)
}

fn decode_headers(record: &TransportRecord) -> Result<MessageEnvelope, SerializationError> {
    let message_id = required_header(record, HEADER_MESSAGE_ID)?;
    let message_id = MessageId::from_str(message_id).map_err(|_| invalid(HEADER_MESSAGE_ID))?;
    let message_type = required_header(record, HEADER_MESSAGE_TYPE)?;

    let sent_time = record
        .header(HEADER_SENT_TIME)
        .map(Timestamp::from_str)
        .transpose()
        .map_err(|_| invalid(HEADER_SENT_TIME))?;

    let mut envelope = MessageEnvelope::new(
        record.header(HEADER_TRACE_ID).map(str::to_string),
        message_type,
        record.body.clone(),
    );
    envelope.message_id = message_id;
    envelope.sent_time = sent_time;
    Ok(envelope)
}

fn required_header<'a>(
    record: &'a TransportRecord,
    key: &str,
) -> Result<&'a str, SerializationError> {
    match record.header(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(SerializationError::MissingHeader {
            key: key.to_string(),
        }),
    }
}

fn invalid(key: &str) -> SerializationError {
    SerializationError::InvalidHeader {
        key: key.to_string(),
    }
}
