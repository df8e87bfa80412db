//! Wire format tests
//!
//! Tests cover:
//! - Value-change serialization (field names, ISO-8601 timestamps)
//! - Both client write shapes (`sendValue` and `nodeId`/`value`)
//! - Write acknowledgements with and without failure detail
//! - Malformed client input

use chrono::{TimeZone, Utc};
use uabridge_core::{
    decode_client_message, encode_event, encode_write_result, ClientMessage, Error, Event, Value,
    WriteError, WriteRequest, WriteResult,
};

fn sample_event(value: Value) -> Event {
    Event {
        node_id: "ns=2;s=Conveyor.Speed".to_string(),
        display_name: "Conveyor Speed".to_string(),
        value,
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 15).unwrap(),
    }
}

/// Test the value-change message layout
#[test]
fn test_event_wire_layout() {
    let text = encode_event(&sample_event(Value::Int(5))).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();

    assert_eq!(json["node"], "Conveyor Speed");
    assert_eq!(json["value"], 5);
    assert_eq!(json["timestamp"], "2024-03-01T12:30:15.000Z");
    assert_eq!(json.as_object().unwrap().len(), 3);
}

/// Test that structured values keep their JSON shape
#[test]
fn test_event_with_structured_value() {
    let value = Value::Array(vec![Value::Bool(true), Value::Float(1.5), Value::Null]);
    let text = encode_event(&sample_event(value)).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();

    assert_eq!(json["value"], serde_json::json!([true, 1.5, null]));
}

/// Test the addressable write shape
#[test]
fn test_decode_addressable_write() {
    let msg = decode_client_message(r#"{"nodeId": "A", "value": "42"}"#).unwrap();
    assert_eq!(
        msg,
        ClientMessage::Write {
            node_id: Some("A".to_string()),
            value: Value::String("42".to_string()),
        }
    );
}

/// Test that an explicit node id also accepts the `sendValue` key
#[test]
fn test_decode_addressable_write_with_send_value_key() {
    let msg = decode_client_message(r#"{"nodeId": "B", "sendValue": true}"#).unwrap();
    assert_eq!(
        msg,
        ClientMessage::Write {
            node_id: Some("B".to_string()),
            value: Value::Bool(true),
        }
    );
}

/// Test that null is a legitimate written value
#[test]
fn test_decode_null_send_value() {
    let msg = decode_client_message(r#"{"sendValue": null}"#).unwrap();
    assert_eq!(
        msg,
        ClientMessage::Write {
            node_id: None,
            value: Value::Null,
        }
    );
}

/// Test malformed inputs are reported, not panicked on
#[test]
fn test_decode_malformed() {
    assert!(matches!(
        decode_client_message("not json"),
        Err(Error::Json(_))
    ));
    assert!(matches!(
        decode_client_message(r#"{"nodeId": 7, "value": 1}"#),
        Err(Error::InvalidMessage(_))
    ));
    assert!(matches!(
        decode_client_message(r#"{"nodeId": "A"}"#),
        Err(Error::InvalidMessage(_))
    ));
    assert!(matches!(
        decode_client_message(r#"{"hello": "world"}"#),
        Err(Error::UnsupportedMessage(_))
    ));
}

/// Test acknowledgement for a successful write
#[test]
fn test_write_result_success() {
    let request = WriteRequest {
        node_id: "A".to_string(),
        value: Value::Int(42),
        origin: "client-1".to_string(),
    };
    let text = encode_write_result(&WriteResult::applied(&request), true).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();

    assert_eq!(json["type"], "writeResult");
    assert_eq!(json["nodeId"], "A");
    assert_eq!(json["success"], true);
    assert!(json.get("error").is_none());
}

/// Test failure detail is only echoed when enabled
#[test]
fn test_write_result_failure_detail() {
    let request = WriteRequest {
        node_id: "A".to_string(),
        value: Value::Int(42),
        origin: "client-1".to_string(),
    };
    let result = WriteResult::failed(&request, WriteError::SessionUnavailable);

    let quiet: serde_json::Value =
        serde_json::from_str(&encode_write_result(&result, false).unwrap()).unwrap();
    assert_eq!(quiet["success"], false);
    assert!(quiet.get("error").is_none());

    let verbose: serde_json::Value =
        serde_json::from_str(&encode_write_result(&result, true).unwrap()).unwrap();
    assert_eq!(verbose["success"], false);
    assert_eq!(verbose["error"], "session unavailable");
}
