//! Bridge data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::value::{Value, ValueKind};

/// Opaque node identifier, e.g. `ns=2;s=Conveyor.Speed`
pub type NodeId = String;

/// Opaque identifier of a connected web client
pub type ClientId = String;

/// Message security mode advertised by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

/// Network address plus security parameters for reaching a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub security_mode: SecurityMode,
    pub security_policy: String,
}

/// A server reported by the discovery service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescription {
    pub application_name: String,
    pub application_uri: String,
    pub discovery_urls: Vec<String>,
}

/// Fixed application identity presented when opening a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationIdentity {
    pub name: String,
    pub uri: String,
    pub product_uri: String,
}

impl Default for ApplicationIdentity {
    fn default() -> Self {
        Self {
            name: "uabridge".to_string(),
            uri: "urn:uabridge:client".to_string(),
            product_uri: "uabridge".to_string(),
        }
    }
}

/// User identity of a session
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    UserName { user: String, password: String },
}

impl Identity {
    /// Credentialed when both parts are present, anonymous otherwise.
    pub fn from_credentials(user: Option<String>, password: Option<String>) -> Self {
        match (user, password) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Identity::UserName { user, password }
            }
            _ => Identity::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => f.write_str("Anonymous"),
            Identity::UserName { user, .. } => f
                .debug_struct("UserName")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Lifecycle state of the industrial session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    #[default]
    Closed,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a web client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientState {
    #[default]
    Open,
    Closing,
    Closed,
}

/// A node that is part of the active subscription
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredPoint {
    pub node_id: NodeId,
    pub display_name: String,
    pub last_value: Option<Value>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl MonitoredPoint {
    pub fn new(node_id: impl Into<NodeId>, display_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: display_name.into(),
            last_value: None,
            last_timestamp: None,
        }
    }

    /// Kind of the last observed value, ignoring nulls.
    pub fn known_kind(&self) -> Option<ValueKind> {
        self.last_value
            .as_ref()
            .filter(|v| !v.is_null())
            .map(Value::kind)
    }
}

/// A raw change notification as delivered by the protocol library
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub node_id: NodeId,
    pub value: Value,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// A normalized value change, ready for fan-out
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub node_id: NodeId,
    pub display_name: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// A write submitted by a web client
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub node_id: NodeId,
    pub value: Value,
    pub origin: ClientId,
}

/// Why a write was not applied
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("write target is ambiguous: more than one node is monitored")]
    AmbiguousTarget,

    #[error("type mismatch on {node_id}: expected {expected}, got {found}")]
    TypeMismatch {
        node_id: NodeId,
        expected: ValueKind,
        found: ValueKind,
    },

    /// The server refused the value's type; it does not say which it wanted
    #[error("type mismatch on {node_id}: {detail}")]
    ServerTypeMismatch { node_id: NodeId, detail: String },

    #[error("session unavailable")]
    SessionUnavailable,

    #[error("write cancelled")]
    Cancelled,

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("server rejected write: {0}")]
    Rejected(String),
}

/// Outcome of a dispatched write, routed back to its origin only
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub node_id: NodeId,
    pub origin: ClientId,
    pub outcome: std::result::Result<(), WriteError>,
}

impl WriteResult {
    pub fn applied(request: &WriteRequest) -> Self {
        Self {
            node_id: request.node_id.clone(),
            origin: request.origin.clone(),
            outcome: Ok(()),
        }
    }

    pub fn failed(request: &WriteRequest, error: WriteError) -> Self {
        Self {
            node_id: request.node_id.clone(),
            origin: request.origin.clone(),
            outcome: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}
