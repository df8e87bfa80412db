//! Common test helpers and utilities for uabridge tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - Port allocation
//! - Scripted client senders (recording, stalling)
//! - A bridge wired to a simulated server, cleaned up on drop
//! - A JSON-speaking WebSocket test client

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uabridge_bridge::{BackoffPolicy, Bridge, BridgeConfig, NodeConfig};
use uabridge_core::Value;
use uabridge_protocol::{SimClient, SimServer};
use uabridge_transport::{
    Transport, TransportError, TransportEvent, TransportReceiver, TransportSender,
    WebSocketReceiver, WebSocketSender, WebSocketTransport,
};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Address used for simulated servers
pub const SIM_ADDRESS: &str = "sim://test-plant";

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Scripted Senders
// ============================================================================

/// Sender that records every frame it is given
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail: AtomicBool,
    pub close_count: AtomicU32,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following send fail
    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Recorded frames parsed as JSON
    pub fn json_messages(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSender for RecordingSender {
    async fn send(&self, text: String) -> uabridge_transport::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted failure".into()));
        }
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) -> uabridge_transport::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sender whose sends never complete, like a client that stopped reading
#[derive(Default)]
pub struct StallingSender {
    pub attempts: AtomicU32,
    closed: AtomicBool,
}

impl StallingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSender for StallingSender {
    async fn send(&self, _text: String) -> uabridge_transport::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) -> uabridge_transport::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Bridge Fixtures
// ============================================================================

/// Configuration with short timeouts and fast, jitter-free retries
pub fn fast_config(address: &str, nodes: &[&str]) -> BridgeConfig {
    let mut config = BridgeConfig::new(
        address,
        nodes.iter().map(|n| NodeConfig::new(*n)).collect(),
    );
    config.listen = "127.0.0.1:0".to_string();
    config.publishing_interval_ms = 50;
    config.reconnect = BackoffPolicy {
        initial_delay_ms: 20,
        max_delay_ms: 200,
        multiplier: 2.0,
        jitter: false,
        fatal_after: 3,
    };
    config.timeouts.discovery_ms = 1000;
    config.timeouts.connect_ms = 1000;
    config.timeouts.subscription_ms = 1000;
    config.timeouts.write_ms = 2000;
    config.timeouts.client_send_ms = 200;
    config
}

/// Simulated server holding `nodes` with their initial values
pub fn sim_server(nodes: &[(&str, Value)]) -> Arc<SimServer> {
    let server = SimServer::new(SIM_ADDRESS);
    for (node_id, value) in nodes {
        server.add_node(*node_id, value.clone());
    }
    server
}

/// A started bridge on a simulated server, listening on a free port.
/// Stopped on drop.
pub struct TestBridge {
    pub server: Arc<SimServer>,
    pub bridge: Arc<Bridge>,
    addr: SocketAddr,
}

impl TestBridge {
    /// Start with every node in `nodes` configured and present on the server
    pub async fn start(nodes: &[(&str, Value)]) -> Self {
        let ids: Vec<&str> = nodes.iter().map(|(id, _)| *id).collect();
        Self::start_with(sim_server(nodes), fast_config(SIM_ADDRESS, &ids)).await
    }

    pub async fn start_with(server: Arc<SimServer>, config: BridgeConfig) -> Self {
        let client = Arc::new(SimClient::new(Arc::clone(&server)));
        let bridge = Bridge::new(config, client).expect("valid config");
        timeout(DEFAULT_TIMEOUT, bridge.start())
            .await
            .expect("bridge start timed out")
            .expect("bridge start failed");
        let addr = bridge
            .serve_websocket("127.0.0.1:0")
            .await
            .expect("bind failed");

        Self {
            server,
            bridge,
            addr,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the WebSocket URL for this bridge
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Connect a client and wait until the bridge has registered it
    pub async fn connect_client(&self) -> TestClient {
        let before = self.bridge.hub().client_count();
        let client = TestClient::connect(&self.url()).await;
        let hub = Arc::clone(self.bridge.hub());
        assert!(
            wait_for(
                || {
                    let hub = Arc::clone(&hub);
                    async move { hub.client_count() > before }
                },
                DEFAULT_CHECK_INTERVAL,
                DEFAULT_TIMEOUT,
            )
            .await,
            "client was not registered"
        );
        client
    }

    pub async fn stop(&self) {
        self.bridge.stop().await;
    }
}

impl Drop for TestBridge {
    fn drop(&mut self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let bridge = Arc::clone(&self.bridge);
            handle.spawn(async move { bridge.stop().await });
        }
    }
}

// ============================================================================
// WebSocket Test Client
// ============================================================================

/// WebSocket client speaking the bridge's JSON messages
pub struct TestClient {
    sender: WebSocketSender,
    receiver: WebSocketReceiver,
}

impl TestClient {
    pub async fn connect(url: &str) -> Self {
        let (sender, receiver) = WebSocketTransport::connect(url)
            .await
            .expect("WebSocket connect failed");
        Self { sender, receiver }
    }

    pub async fn send_json(&self, value: serde_json::Value) {
        self.sender
            .send(value.to_string())
            .await
            .expect("send failed");
    }

    pub async fn send_text(&self, text: &str) {
        self.sender
            .send(text.to_string())
            .await
            .expect("send failed");
    }

    /// Next JSON message, or `None` on timeout or disconnect
    pub async fn recv_json(&mut self, max_wait: Duration) -> Option<serde_json::Value> {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match timeout(remaining, self.receiver.recv()).await {
                Ok(Some(TransportEvent::Text(text))) => {
                    if let Ok(json) = serde_json::from_str(&text) {
                        return Some(json);
                    }
                }
                Ok(Some(TransportEvent::Connected)) | Ok(Some(TransportEvent::Error(_))) => {}
                Ok(Some(TransportEvent::Disconnected { .. })) | Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Next JSON message satisfying `predicate`, skipping others
    pub async fn recv_matching<P>(
        &mut self,
        predicate: P,
        max_wait: Duration,
    ) -> Option<serde_json::Value>
    where
        P: Fn(&serde_json::Value) -> bool,
    {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let message = self.recv_json(remaining).await?;
            if predicate(&message) {
                return Some(message);
            }
        }
    }

    /// True if the connection is closed within `max_wait`
    pub async fn wait_closed(&mut self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            match timeout(remaining, self.receiver.recv()).await {
                Ok(Some(TransportEvent::Disconnected { .. })) | Ok(None) => return true,
                Ok(Some(_)) => {}
                Err(_) => return false,
            }
        }
    }

    pub async fn close(&self) {
        let _ = self.sender.close().await;
    }
}

/// True for a value-change message about `node`
pub fn is_event_for(message: &serde_json::Value, node: &str) -> bool {
    message.get("node").and_then(|n| n.as_str()) == Some(node)
}

/// True for a write acknowledgement
pub fn is_write_result(message: &serde_json::Value) -> bool {
    message.get("type").and_then(|t| t.as_str()) == Some("writeResult")
}
