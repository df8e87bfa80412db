//! uabridge bridge core
//!
//! Keeps one industrial session alive and connects it to any number of
//! WebSocket clients:
//! - [`EndpointResolver`]: two-stage discovery of the server endpoint
//! - [`SessionManager`]: session lifecycle, reconnect with backoff
//! - [`SubscriptionEngine`]: monitored items and normalized events
//! - [`FanoutHub`]: client registry, broadcast, inbound writes
//! - [`WriteDispatcher`]: serialized writes with results to the origin only
//!
//! [`Bridge`] wires them together.

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod resolver;
pub mod session;
pub mod subscription;

pub use backoff::{Backoff, BackoffPolicy};
pub use bridge::{Bridge, BridgeStatus};
pub use config::{BridgeConfig, NodeConfig, Password, SubscriptionSettings, TimeoutSettings};
pub use dispatcher::WriteDispatcher;
pub use error::{
    BridgeError, ClientSendError, ConfigError, DiscoveryError, Result, SessionError,
    SubscriptionError,
};
pub use hub::{BroadcastReport, ClientConnection, FanoutHub, HubConfig};
pub use resolver::EndpointResolver;
pub use session::{
    LeaseError, SessionHandle, SessionLease, SessionManager, SessionSettings, SessionWatcher,
};
pub use subscription::{
    point_table, EngineSettings, PointTable, ReadyState, SubscriptionEngine, SubscriptionHandle,
};
