//! In-process simulated industrial server
//!
//! [`SimServer`] holds the address space and the server-side view of every
//! session. [`SimClient`] implements [`UaClient`] against it. Test code drives
//! the server directly: change values, drop sessions, make discovery or
//! connects fail, slow down writes.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uabridge_core::{
    DataChange, Endpoint, NodeId, SecurityMode, ServerDescription, Value, SECURITY_POLICY_NONE,
};

use crate::error::{ProtocolError, Result};
use crate::traits::{
    CloseReason, ConnectRequest, MonitoredItemRequest, MonitoredItemResult, RawSubscription,
    SubscriptionParams, UaClient, UaSession,
};

struct SimSubscription {
    tx: mpsc::UnboundedSender<DataChange>,
    items: HashSet<NodeId>,
}

struct SimSessionState {
    closed_tx: watch::Sender<Option<CloseReason>>,
    subscriptions: HashMap<u32, SimSubscription>,
}

#[derive(Default)]
struct SimState {
    reachable: bool,
    servers: Vec<ServerDescription>,
    endpoints: HashMap<String, Vec<Endpoint>>,
    empty_discoveries: u32,
    connect_failures: u32,
    nodes: HashMap<NodeId, Value>,
    unmonitorable: HashSet<NodeId>,
    sessions: HashMap<String, SimSessionState>,
    write_delay: Option<Duration>,
    writes: Vec<(NodeId, Value)>,
    discovery_attempts: u32,
    connect_attempts: u32,
}

impl SimState {
    fn publish(&mut self, change: DataChange) {
        for session in self.sessions.values_mut() {
            session.subscriptions.retain(|_, sub| {
                if !sub.items.contains(&change.node_id) {
                    return true;
                }
                sub.tx.send(change.clone()).is_ok()
            });
        }
    }
}

/// A simulated server reachable at a single address
pub struct SimServer {
    address: String,
    state: Mutex<SimState>,
    next_id: AtomicU32,
}

impl SimServer {
    /// A reachable server advertising one unsecured endpoint at `address`
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        let address = address.into();
        let mut state = SimState {
            reachable: true,
            ..Default::default()
        };
        state.servers.push(ServerDescription {
            application_name: "uabridge simulator".to_string(),
            application_uri: "urn:uabridge:simulator".to_string(),
            discovery_urls: vec![address.clone()],
        });
        state.endpoints.insert(
            address.clone(),
            vec![Endpoint {
                url: address.clone(),
                security_mode: SecurityMode::None,
                security_policy: SECURITY_POLICY_NONE.to_string(),
            }],
        );

        Arc::new(Self {
            address,
            state: Mutex::new(state),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a node to the address space
    pub fn add_node(&self, node_id: impl Into<NodeId>, value: Value) {
        self.state.lock().nodes.insert(node_id.into(), value);
    }

    /// Make monitored item creation fail for `node_id`
    pub fn reject_monitoring(&self, node_id: impl Into<NodeId>) {
        self.state.lock().unmonitorable.insert(node_id.into());
    }

    /// Replace the discovery answer
    pub fn set_servers(&self, servers: Vec<ServerDescription>) {
        self.state.lock().servers = servers;
    }

    /// Replace the endpoints offered at a discovery URL
    pub fn set_endpoints(&self, discovery_url: impl Into<String>, endpoints: Vec<Endpoint>) {
        self.state
            .lock()
            .endpoints
            .insert(discovery_url.into(), endpoints);
    }

    /// Answer the next `count` discovery requests with no servers
    pub fn return_no_servers(&self, count: u32) {
        self.state.lock().empty_discoveries = count;
    }

    /// Fail the next `count` connect attempts
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Delay every write by `delay` before it is applied
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.lock().write_delay = delay;
    }

    /// Change a node value and notify every subscription monitoring it
    pub fn set_value(&self, node_id: &str, value: Value) {
        let now = Utc::now();
        self.push_change(DataChange {
            node_id: node_id.to_string(),
            value,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        });
    }

    /// Publish a raw data change, timestamps as given
    pub fn push_change(&self, change: DataChange) {
        let mut state = self.state.lock();
        state
            .nodes
            .insert(change.node_id.clone(), change.value.clone());
        state.publish(change);
    }

    pub fn value(&self, node_id: &str) -> Option<Value> {
        self.state.lock().nodes.get(node_id).cloned()
    }

    /// Drop every open session as if the connection was lost
    pub fn drop_sessions(&self, reason: &str) {
        let sessions: Vec<_> = self.state.lock().sessions.drain().collect();
        for (id, session) in sessions {
            info!("Sim server dropping session {}: {}", id, reason);
            let _ = session
                .closed_tx
                .send(Some(CloseReason::Lost(reason.to_string())));
        }
    }

    /// Writes applied so far, in order
    pub fn writes(&self) -> Vec<(NodeId, Value)> {
        self.state.lock().writes.clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .map(|s| s.subscriptions.len())
            .sum()
    }

    pub fn discovery_attempts(&self) -> u32 {
        self.state.lock().discovery_attempts
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    fn ensure_session(state: &SimState, session_id: &str) -> Result<()> {
        if state.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(ProtocolError::SessionClosed(session_id.to_string()))
        }
    }
}

/// [`UaClient`] backed by a [`SimServer`]
#[derive(Clone)]
pub struct SimClient {
    server: Arc<SimServer>,
}

impl SimClient {
    pub fn new(server: Arc<SimServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<SimServer> {
        &self.server
    }
}

#[async_trait]
impl UaClient for SimClient {
    async fn find_servers(&self, address: &str) -> Result<Vec<ServerDescription>> {
        let mut state = self.server.state.lock();
        state.discovery_attempts += 1;

        if !state.reachable || address != self.server.address {
            return Err(ProtocolError::Unreachable(address.to_string()));
        }
        if state.empty_discoveries > 0 {
            state.empty_discoveries -= 1;
            return Ok(Vec::new());
        }
        Ok(state.servers.clone())
    }

    async fn get_endpoints(&self, discovery_url: &str) -> Result<Vec<Endpoint>> {
        let state = self.server.state.lock();
        if !state.reachable {
            return Err(ProtocolError::Unreachable(discovery_url.to_string()));
        }
        Ok(state
            .endpoints
            .get(discovery_url)
            .cloned()
            .unwrap_or_default())
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Arc<dyn UaSession>> {
        let mut state = self.server.state.lock();
        state.connect_attempts += 1;

        let known = state
            .endpoints
            .values()
            .flatten()
            .any(|e| e.url == request.endpoint.url);
        if !state.reachable || !known {
            return Err(ProtocolError::Unreachable(request.endpoint.url.clone()));
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(ProtocolError::Rejected(
                "simulated connect failure".to_string(),
            ));
        }

        let session_id = format!("sim-session-{}", self.server.next_id());
        let (closed_tx, closed_rx) = watch::channel(None);
        state.sessions.insert(
            session_id.clone(),
            SimSessionState {
                closed_tx,
                subscriptions: HashMap::new(),
            },
        );
        debug!(
            "Sim session {} opened as {:?} ({})",
            session_id, request.identity, request.session_name
        );

        Ok(Arc::new(SimSession {
            id: session_id,
            server: Arc::clone(&self.server),
            closed_rx,
        }))
    }
}

struct SimSession {
    id: String,
    server: Arc<SimServer>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

#[async_trait]
impl UaSession for SimSession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn create_subscription(&self, params: &SubscriptionParams) -> Result<RawSubscription> {
        let mut state = self.server.state.lock();
        SimServer::ensure_session(&state, &self.id)?;

        let id = self.server.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.subscriptions.insert(
                id,
                SimSubscription {
                    tx,
                    items: HashSet::new(),
                },
            );
        }

        Ok(RawSubscription {
            id,
            revised_publishing_interval: params.publishing_interval,
            notifications: rx,
        })
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemRequest],
    ) -> Result<Vec<MonitoredItemResult>> {
        let mut state = self.server.state.lock();
        SimServer::ensure_session(&state, &self.id)?;

        let mut results = Vec::with_capacity(items.len());
        let mut accepted = Vec::new();
        for item in items {
            let status = if !state.nodes.contains_key(&item.node_id) {
                Err("BadNodeIdUnknown".to_string())
            } else if state.unmonitorable.contains(&item.node_id) {
                Err("BadNotSupported".to_string())
            } else {
                accepted.push(item.node_id.clone());
                Ok(self.server.next_id())
            };
            results.push(MonitoredItemResult {
                node_id: item.node_id.clone(),
                status,
            });
        }

        let now = Utc::now();
        let initial: Vec<DataChange> = accepted
            .iter()
            .filter_map(|node_id| {
                state.nodes.get(node_id).map(|value| DataChange {
                    node_id: node_id.clone(),
                    value: value.clone(),
                    source_timestamp: Some(now),
                    server_timestamp: Some(now),
                })
            })
            .collect();

        let sub = state
            .sessions
            .get_mut(&self.id)
            .and_then(|s| s.subscriptions.get_mut(&subscription_id))
            .ok_or(ProtocolError::SubscriptionNotFound(subscription_id))?;
        sub.items.extend(accepted);
        // Servers report the current value of every new item once
        for change in initial {
            let _ = sub.tx.send(change);
        }

        Ok(results)
    }

    async fn delete_subscription(&self, subscription_id: u32) -> Result<()> {
        let mut state = self.server.state.lock();
        SimServer::ensure_session(&state, &self.id)?;
        state
            .sessions
            .get_mut(&self.id)
            .and_then(|s| s.subscriptions.remove(&subscription_id))
            .map(|_| ())
            .ok_or(ProtocolError::SubscriptionNotFound(subscription_id))
    }

    async fn write(&self, node_id: &str, value: Value) -> Result<()> {
        let delay = {
            let state = self.server.state.lock();
            SimServer::ensure_session(&state, &self.id)?;
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.server.state.lock();
        SimServer::ensure_session(&state, &self.id)?;

        let current = state
            .nodes
            .get(node_id)
            .ok_or_else(|| ProtocolError::BadNodeId(node_id.to_string()))?;
        if !current.is_null() && current.kind() != value.kind() {
            return Err(ProtocolError::TypeMismatch(format!(
                "{} holds {}, got {}",
                node_id,
                current.kind(),
                value.kind()
            )));
        }

        state.writes.push((node_id.to_string(), value.clone()));
        state.nodes.insert(node_id.to_string(), value.clone());
        let now = Utc::now();
        state.publish(DataChange {
            node_id: node_id.to_string(),
            value,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let removed = self.server.state.lock().sessions.remove(&self.id);
        if let Some(session) = removed {
            debug!("Sim session {} closed", self.id);
            let _ = session.closed_tx.send(Some(CloseReason::Requested));
        }
        Ok(())
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or_else(|| CloseReason::Lost("server gone".to_string()));
            }
        }
    }
}
