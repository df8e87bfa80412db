//! Industrial protocol seam
//!
//! The bridge talks to the industrial server only through the traits in
//! this crate, so the protocol stack itself (discovery wire format, session
//! handshake, binary encoding) stays a black box:
//! - [`UaClient`]: server discovery and session establishment
//! - [`UaSession`]: subscriptions, monitored items and writes on one session
//!
//! The `sim` feature adds an in-process simulated server used by tests and by
//! the `sim://` address scheme of the bridge binary. The `opcua` feature adds
//! a client for real `opc.tcp://` servers.

pub mod error;
pub mod traits;

#[cfg(feature = "opcua")]
pub mod opcua_client;
#[cfg(feature = "sim")]
pub mod sim;

pub use error::{ProtocolError, Result};
pub use traits::{
    CloseReason, ConnectRequest, MonitoredItemRequest, MonitoredItemResult, RawSubscription,
    SubscriptionParams, UaClient, UaSession,
};

#[cfg(feature = "opcua")]
pub use opcua_client::OpcUaClient;
#[cfg(feature = "sim")]
pub use sim::{SimClient, SimServer};
