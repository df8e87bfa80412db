//! uabridge core
//!
//! Shared data model for the bridge between an industrial node-based
//! protocol and WebSocket clients.
//!
//! This crate provides:
//! - Dynamic node values and write-time coercion ([`Value`], [`ValueKind`])
//! - The bridge data model ([`Event`], [`WriteRequest`], [`MonitoredPoint`], ...)
//! - The JSON text wire format spoken with web clients ([`codec`])

pub mod codec;
pub mod error;
pub mod types;
pub mod value;

pub use codec::{decode_client_message, encode_event, encode_write_result, ClientMessage};
pub use error::{Error, Result};
pub use types::*;
pub use value::{Value, ValueKind};

/// Default listen address for the client-facing WebSocket channel
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default publishing interval in milliseconds
pub const DEFAULT_PUBLISHING_INTERVAL_MS: u64 = 500;

/// Default session timeout in milliseconds
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;

/// Security policy URI for unsecured endpoints
pub const SECURITY_POLICY_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
