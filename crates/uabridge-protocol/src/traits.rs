//! Client and session traits

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uabridge_core::{
    ApplicationIdentity, DataChange, Endpoint, Identity, NodeId, ServerDescription, Value,
};

use crate::error::Result;

/// Parameters for opening a session against a resolved endpoint
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: Endpoint,
    pub application: ApplicationIdentity,
    pub identity: Identity,
    pub session_name: String,
    pub session_timeout: Duration,
}

/// Parameters for creating a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionParams {
    pub publishing_interval: Duration,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
    pub publishing_enabled: bool,
}

impl Default for SubscriptionParams {
    fn default() -> Self {
        Self {
            publishing_interval: Duration::from_millis(uabridge_core::DEFAULT_PUBLISHING_INTERVAL_MS),
            lifetime_count: 100,
            max_keep_alive_count: 20,
            max_notifications_per_publish: 10,
            priority: 10,
            publishing_enabled: true,
        }
    }
}

/// A subscription as created on the server.
///
/// Data changes for every monitored item attached to it arrive on
/// `notifications`, in server publish order. The channel closes when the
/// subscription or its session goes away.
#[derive(Debug)]
pub struct RawSubscription {
    pub id: u32,
    pub revised_publishing_interval: Duration,
    pub notifications: mpsc::UnboundedReceiver<DataChange>,
}

/// A request to monitor one node's value attribute
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemRequest {
    pub node_id: NodeId,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// Per-item outcome of a monitored item creation call
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemResult {
    pub node_id: NodeId,
    /// Server-assigned item id, or the server's rejection status
    pub status: std::result::Result<u32, String>,
}

/// Why a session stopped being usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by us through [`UaSession::close`]
    Requested,
    /// Lost without being asked to: network drop, server restart, timeout
    Lost(String),
}

/// Discovery and session establishment against one server
#[async_trait]
pub trait UaClient: Send + Sync {
    /// Ask the discovery service at `address` which servers it knows about
    async fn find_servers(&self, address: &str) -> Result<Vec<ServerDescription>>;

    /// List the endpoints offered at a discovery URL
    async fn get_endpoints(&self, discovery_url: &str) -> Result<Vec<Endpoint>>;

    /// Open an activated session
    async fn connect(&self, request: &ConnectRequest) -> Result<Arc<dyn UaSession>>;
}

/// An open session with the industrial server
#[async_trait]
pub trait UaSession: Send + Sync {
    /// Server-assigned session id
    fn session_id(&self) -> String;

    /// Create a subscription. Monitored items are attached separately.
    async fn create_subscription(&self, params: &SubscriptionParams) -> Result<RawSubscription>;

    /// Attach monitored items to a subscription. Items succeed or fail
    /// individually; the call itself only fails on transport errors.
    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> Result<Vec<MonitoredItemResult>>;

    async fn delete_subscription(&self, subscription_id: u32) -> Result<()>;

    /// Write the value attribute of a node
    async fn write(&self, node_id: &str, value: Value) -> Result<()>;

    /// Close the session. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Resolves once the session is no longer usable
    async fn closed(&self) -> CloseReason;
}
