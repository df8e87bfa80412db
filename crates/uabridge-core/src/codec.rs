//! JSON text wire format spoken with web clients
//!
//! Outbound:
//! - value change: `{"node": "...", "timestamp": "<ISO-8601>", "value": ...}`
//! - write acknowledgement: `{"type": "writeResult", "nodeId": "...", "success": true}`
//!
//! Inbound writes come in two shapes:
//! - `{"sendValue": ...}` targets the single monitored node
//! - `{"nodeId": "...", "value": ...}` targets a node explicitly

use chrono::SecondsFormat;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{Event, NodeId, WriteResult};
use crate::value::Value;

/// A message received from a web client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Write `value` to `node_id`, or to the implicit target when `None`
    Write {
        node_id: Option<NodeId>,
        value: Value,
    },
}

#[derive(Serialize)]
struct EventFrame<'a> {
    node: &'a str,
    timestamp: String,
    value: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteResultFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    node_id: &'a str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Serialize a value change for broadcast
pub fn encode_event(event: &Event) -> Result<String> {
    let frame = EventFrame {
        node: &event.display_name,
        timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        value: &event.value,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Serialize a write acknowledgement for its originating client.
///
/// The failure reason is only included when `include_reason` is set.
pub fn encode_write_result(result: &WriteResult, include_reason: bool) -> Result<String> {
    let error = match (&result.outcome, include_reason) {
        (Err(e), true) => Some(e.to_string()),
        _ => None,
    };
    let frame = WriteResultFrame {
        kind: "writeResult",
        node_id: &result.node_id,
        success: result.outcome.is_ok(),
        error,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Parse a text message received from a web client
pub fn decode_client_message(text: &str) -> Result<ClientMessage> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    let obj = json
        .as_object()
        .ok_or_else(|| Error::InvalidMessage("expected a JSON object".to_string()))?;

    let node_id = match obj.get("nodeId") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(other) => {
            return Err(Error::InvalidMessage(format!(
                "nodeId must be a non-empty string, got {}",
                other
            )))
        }
    };

    let value = if node_id.is_some() {
        obj.get("value").or_else(|| obj.get("sendValue"))
    } else {
        obj.get("sendValue")
    };

    match value {
        Some(v) => Ok(ClientMessage::Write {
            node_id,
            value: Value::from(v.clone()),
        }),
        None if node_id.is_some() => Err(Error::InvalidMessage(
            "nodeId given without a value".to_string(),
        )),
        None => Err(Error::UnsupportedMessage(text.chars().take(64).collect())),
    }
}
