//! Bridge error types
//!
//! Errors are split by where they escalate: discovery and session errors
//! feed the reconnect loop, subscription errors are absorbed per node,
//! client send errors drop one client, write errors go back to one client.

use std::time::Duration;
use thiserror::Error;
use uabridge_core::{ClientId, WriteError};
use uabridge_protocol::ProtocolError;
use uabridge_transport::TransportError;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("discovery at {address} failed: {source}")]
    Unreachable {
        address: String,
        source: ProtocolError,
    },

    #[error("no servers found at {0}")]
    NoServers(String),

    #[error("server {0} advertises no discovery url")]
    NoDiscoveryUrl(String),

    #[error("no endpoints offered at {0}")]
    NoEndpoints(String),

    #[error("discovery timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("connect failed: {0}")]
    Connect(ProtocolError),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("session manager already started")]
    AlreadyStarted,

    #[error("session manager stopped")]
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    #[error("subscription creation failed: {0}")]
    Create(ProtocolError),

    #[error("monitored item creation failed: {0}")]
    MonitoredItems(ProtocolError),

    #[error("none of the configured nodes could be monitored")]
    NoMonitoredItems,

    #[error("subscription request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no active session")]
    SessionUnavailable,

    #[error("subscription engine stopped")]
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientSendError {
    #[error("send to client {client_id} timed out after {timeout:?}")]
    Timeout {
        client_id: ClientId,
        timeout: Duration,
    },

    #[error("send to client {client_id} failed: {reason}")]
    Transport { client_id: ClientId, reason: String },

    #[error("client {0} is closed")]
    Closed(ClientId),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("client send error: {0}")]
    ClientSend(#[from] ClientSendError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire format error: {0}")]
    Core(#[from] uabridge_core::Error),

    #[error("bridge already started")]
    AlreadyStarted,
}
