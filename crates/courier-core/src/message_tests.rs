//! Tests for message types.

use super::*;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u32,
    customer: String,
}

// ============================================================================
// Identifier Tests
// ============================================================================

#[test]
fn test_queue_name_validation() {
    assert!(QueueName::new("test-queue".to_string()).is_ok());
    assert!(QueueName::new("queue_123".to_string()).is_ok());
    assert!(QueueName::new("orders.created".to_string()).is_ok());

    assert!(QueueName::new("".to_string()).is_err());
    assert!(QueueName::new("-leading-hyphen".to_string()).is_err());
    assert!(QueueName::new("trailing-hyphen-".to_string()).is_err());
    assert!(QueueName::new("double--hyphen".to_string()).is_err());
    assert!(QueueName::new("special@chars".to_string()).is_err());
    assert!(QueueName::new("a".repeat(261)).is_err());
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
    assert!("".parse::<MessageId>().is_err());
}

#[test]
fn test_timestamp_parse_and_shift() {
    let ts: Timestamp = "2024-03-01T12:00:00Z".parse().unwrap();
    let later = ts.add(Duration::seconds(90));
    assert!(later > ts);
    assert_eq!(later.to_string(), "2024-03-01T12:01:30+00:00");
    assert!(ts.is_past());
}

// ============================================================================
// Envelope Tests
// ============================================================================

mod envelope {
    use super::*;

    #[test]
    fn test_new_envelope_is_not_leased() {
        let envelope = MessageEnvelope::new(None, "Test", "hello");
        assert_eq!(envelope.message_type, "Test");
        assert_eq!(envelope.payload_as_str().unwrap(), "hello");
        assert!(envelope.sent_time.is_none());
        assert!(!envelope.is_leased());
        assert!(envelope.delivery_reference().is_none());
    }

    #[test]
    fn test_json_value_payload() {
        let order = OrderPlaced {
            order_id: 42,
            customer: "acme".to_string(),
        };
        let envelope =
            MessageEnvelope::from_json_value(Some("trace-1".to_string()), "OrderPlaced", &order)
                .unwrap();

        assert_eq!(envelope.trace_id.as_deref(), Some("trace-1"));
        let decoded: OrderPlaced = envelope.payload_as_json().unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn test_invalid_utf8_payload() {
        let envelope = MessageEnvelope::new(None, "Binary", vec![0xff, 0xfe, 0x00]);
        assert!(matches!(
            envelope.payload_as_str(),
            Err(SerializationError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_display_truncates_long_payloads() {
        let envelope = MessageEnvelope::new(None, "Long", "x".repeat(80));
        let rendered = envelope.to_string();
        assert!(rendered.starts_with(&format!("[{},Long,", envelope.message_id)));
        assert!(rendered.ends_with("...]"));
    }

    #[test]
    fn test_reference_lifecycle() {
        let mut envelope = MessageEnvelope::new(None, "Test", "hello");
        envelope.set_delivery_reference(DeliveryReference::lease(7));
        assert!(envelope.is_leased());
        assert_eq!(envelope.delivery_reference().unwrap().to_string(), "lease:7");

        let detached = envelope.detached();
        assert!(!detached.is_leased());

        assert_eq!(
            envelope.take_delivery_reference(),
            Some(DeliveryReference::lease(7))
        );
        assert!(!envelope.is_leased());
    }
}

// ============================================================================
// Wire Form Tests
// ============================================================================

mod wire_form {
    use super::*;

    #[test]
    fn test_json_round_trip_preserves_identity_and_payload() {
        let mut envelope = MessageEnvelope::new(
            Some("trace-9".to_string()),
            "Binary",
            vec![0u8, 1, 2, 254, 255],
        );
        envelope.sent_time = Some(Timestamp::now());
        envelope.set_delivery_reference(DeliveryReference::lease(3));

        let json = envelope.to_json().unwrap();
        let decoded = MessageEnvelope::from_json(&json).unwrap();

        assert_eq!(decoded.message_id, envelope.message_id);
        assert_eq!(decoded.trace_id, envelope.trace_id);
        assert_eq!(decoded.message_type, envelope.message_type);
        assert_eq!(decoded.payload, envelope.payload);
        assert_eq!(
            decoded.sent_time.map(|t| t.as_datetime().timestamp()),
            envelope.sent_time.map(|t| t.as_datetime().timestamp())
        );
        // Delivery references never cross process boundaries
        assert!(!decoded.is_leased());
    }

    #[test]
    fn test_wire_field_names() {
        let envelope = MessageEnvelope::new(None, "Test", "hello");
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["message_id"], envelope.message_id.as_str());
        assert_eq!(value["message_type"], "Test");
        assert_eq!(value["message"], "aGVsbG8=");
        assert!(value["trace_id"].is_null());
    }

    #[test]
    fn test_decode_external_json() {
        let json = r#"{
            "message_id": "abc-123",
            "trace_id": "t-1",
            "message_type": "Ping",
            "sent_time": "2024-03-01T12:00:00Z",
            "message": "cGluZw=="
        }"#;

        let envelope = MessageEnvelope::from_json(json).unwrap();
        assert_eq!(envelope.message_id.as_str(), "abc-123");
        assert_eq!(envelope.payload_as_str().unwrap(), "ping");
        assert_eq!(
            envelope.sent_time,
            Some("2024-03-01T12:00:00Z".parse().unwrap())
        );
    }

    #[test]
    fn test_decode_rejects_empty_message_id() {
        let json = r#"{"message_id": "", "message_type": "Ping", "message": null}"#;
        assert!(matches!(
            MessageEnvelope::from_json(json),
            Err(SerializationError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_corrupt_payload() {
        let json = r#"{"message_id": "x", "message_type": "Ping", "message": "%%%"}"#;
        assert!(MessageEnvelope::from_json(json).is_err());
    }
}
