//! Session Management Tests (uabridge-bridge)
//!
//! Tests for endpoint resolution and the session manager including:
//! - Two-stage discovery and its failure modes
//! - Startup retries with backoff after empty discovery answers
//! - Reconnect after session loss, with a new generation
//! - Idempotent stop
//! - Stop while retrying or while the first connect is in flight

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uabridge_bridge::{
    BridgeConfig, DiscoveryError, EndpointResolver, SessionError, SessionManager,
    SessionSettings,
};
use uabridge_core::{Endpoint, SecurityMode, ServerDescription, SessionState, Value};
use uabridge_protocol::{
    ConnectRequest, ProtocolError, SimClient, SimServer, UaClient, UaSession,
};
use uabridge_test_utils::{fast_config, sim_server, wait_for, DEFAULT_TIMEOUT, SIM_ADDRESS};

fn manager(server: &Arc<SimServer>, config: &BridgeConfig) -> Arc<SessionManager> {
    let client: Arc<dyn UaClient> = Arc::new(SimClient::new(Arc::clone(server)));
    let resolver = EndpointResolver::new(Arc::clone(&client), config.discovery_timeout());
    SessionManager::new(client, resolver, SessionSettings::from_config(config))
}

fn resolver(server: &Arc<SimServer>) -> EndpointResolver {
    EndpointResolver::new(
        Arc::new(SimClient::new(Arc::clone(server))),
        Duration::from_secs(1),
    )
}

/// Client whose discovery never answers
struct SilentClient;

#[async_trait]
impl UaClient for SilentClient {
    async fn find_servers(&self, _address: &str) -> uabridge_protocol::Result<Vec<ServerDescription>> {
        std::future::pending().await
    }

    async fn get_endpoints(&self, _url: &str) -> uabridge_protocol::Result<Vec<Endpoint>> {
        std::future::pending().await
    }

    async fn connect(&self, _request: &ConnectRequest) -> uabridge_protocol::Result<Arc<dyn UaSession>> {
        Err(ProtocolError::Rejected("silent".into()))
    }
}

/// Simulated client whose connect takes `delay`
struct SlowConnectClient {
    inner: SimClient,
    delay: Duration,
}

#[async_trait]
impl UaClient for SlowConnectClient {
    async fn find_servers(&self, address: &str) -> uabridge_protocol::Result<Vec<ServerDescription>> {
        self.inner.find_servers(address).await
    }

    async fn get_endpoints(&self, url: &str) -> uabridge_protocol::Result<Vec<Endpoint>> {
        self.inner.get_endpoints(url).await
    }

    async fn connect(&self, request: &ConnectRequest) -> uabridge_protocol::Result<Arc<dyn UaSession>> {
        tokio::time::sleep(self.delay).await;
        self.inner.connect(request).await
    }
}

// ============================================================================
// Endpoint Resolution
// ============================================================================

#[tokio::test]
async fn test_resolve_selects_first_endpoint() {
    let server = sim_server(&[]);
    server.set_servers(vec![
        ServerDescription {
            application_name: "first".into(),
            application_uri: "urn:first".into(),
            discovery_urls: vec!["sim://first/discovery".into(), "sim://ignored".into()],
        },
        ServerDescription {
            application_name: "second".into(),
            application_uri: "urn:second".into(),
            discovery_urls: vec!["sim://second".into()],
        },
    ]);
    server.set_endpoints(
        "sim://first/discovery",
        vec![
            Endpoint {
                url: "sim://first/a".into(),
                security_mode: SecurityMode::None,
                security_policy: "none".into(),
            },
            Endpoint {
                url: "sim://first/b".into(),
                security_mode: SecurityMode::SignAndEncrypt,
                security_policy: "basic256".into(),
            },
        ],
    );

    let endpoint = resolver(&server).resolve(SIM_ADDRESS).await.unwrap();
    assert_eq!(endpoint.url, "sim://first/a");
    assert_eq!(endpoint.security_mode, SecurityMode::None);
}

#[tokio::test]
async fn test_resolve_failures() {
    let server = sim_server(&[]);
    let resolver = resolver(&server);

    server.return_no_servers(1);
    assert!(matches!(
        resolver.resolve(SIM_ADDRESS).await,
        Err(DiscoveryError::NoServers(_))
    ));

    server.set_endpoints(SIM_ADDRESS, vec![]);
    assert!(matches!(
        resolver.resolve(SIM_ADDRESS).await,
        Err(DiscoveryError::NoEndpoints(_))
    ));

    server.set_servers(vec![ServerDescription {
        application_name: "bare".into(),
        application_uri: "urn:bare".into(),
        discovery_urls: vec![],
    }]);
    assert!(matches!(
        resolver.resolve(SIM_ADDRESS).await,
        Err(DiscoveryError::NoDiscoveryUrl(_))
    ));

    server.set_reachable(false);
    assert!(matches!(
        resolver.resolve(SIM_ADDRESS).await,
        Err(DiscoveryError::Unreachable { .. })
    ));
}

#[tokio::test]
async fn test_resolve_timeout() {
    let resolver = EndpointResolver::new(Arc::new(SilentClient), Duration::from_millis(50));
    let result = timeout(Duration::from_secs(2), resolver.resolve("sim://silent"))
        .await
        .expect("resolve should time out on its own");
    assert_eq!(result, Err(DiscoveryError::Timeout(Duration::from_millis(50))));
}

// ============================================================================
// Session Lifecycle
// ============================================================================

/// Discovery answers empty twice, then succeeds on the third attempt
#[tokio::test]
async fn test_startup_retries_empty_discovery() {
    let server = sim_server(&[("A", Value::Int(0))]);
    server.return_no_servers(2);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));

    let handle = timeout(DEFAULT_TIMEOUT, manager.connect())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(server.discovery_attempts(), 3);
    assert_eq!(handle.generation(), 1);
    assert_eq!(manager.current_state(), SessionState::Active);
    assert_eq!(server.session_count(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn test_startup_retries_connect_failures() {
    let server = sim_server(&[("A", Value::Int(0))]);
    server.fail_connects(2);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));

    timeout(DEFAULT_TIMEOUT, manager.connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.connect_attempts(), 3);

    manager.stop().await;
}

#[tokio::test]
async fn test_connect_twice_rejected() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));

    manager.connect().await.unwrap();
    assert_eq!(
        manager.connect().await.unwrap_err(),
        SessionError::AlreadyStarted
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_reconnect_after_session_loss() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));
    let watcher = manager.watcher();

    manager.connect().await.unwrap();
    assert_eq!(watcher.generation(), 1);

    server.drop_sessions("network down");

    let reconnected = timeout(DEFAULT_TIMEOUT, watcher.wait_active(2))
        .await
        .unwrap()
        .expect("manager alive");
    assert_eq!(reconnected.generation(), 2);
    assert_eq!(watcher.state(), SessionState::Active);
    assert_eq!(server.session_count(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn test_faulted_while_server_down() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));
    let watcher = manager.watcher();
    manager.connect().await.unwrap();

    server.set_reachable(false);
    server.drop_sessions("server restart");

    let faulted = {
        let watcher = watcher.clone();
        wait_for(
            || {
                let watcher = watcher.clone();
                async move { watcher.state() == SessionState::Faulted }
            },
            Duration::from_millis(5),
            DEFAULT_TIMEOUT,
        )
        .await
    };
    assert!(faulted);
    assert!(watcher.current().is_none());

    // Keeps retrying past the fatal threshold
    let attempts = server.discovery_attempts();
    assert!(
        wait_for(
            || {
                let server = Arc::clone(&server);
                async move { server.discovery_attempts() >= attempts + 4 }
            },
            Duration::from_millis(10),
            DEFAULT_TIMEOUT,
        )
        .await
    );

    server.set_reachable(true);
    let handle = timeout(DEFAULT_TIMEOUT, watcher.wait_active(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.generation(), 2);

    manager.stop().await;
}

#[tokio::test]
async fn test_stop_idempotent() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));
    manager.connect().await.unwrap();
    assert_eq!(server.session_count(), 1);

    manager.stop().await;
    assert_eq!(server.session_count(), 0);
    assert_eq!(manager.current_state(), SessionState::Closed);

    manager.stop().await;
    assert_eq!(manager.current_state(), SessionState::Closed);
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn test_stop_while_retrying() {
    let server = sim_server(&[("A", Value::Int(0))]);
    server.set_reachable(false);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.connect().await })
    };
    assert!(
        wait_for(
            || {
                let server = Arc::clone(&server);
                async move { server.discovery_attempts() >= 2 }
            },
            Duration::from_millis(5),
            DEFAULT_TIMEOUT,
        )
        .await
    );

    timeout(DEFAULT_TIMEOUT, manager.stop()).await.unwrap();
    let result = timeout(DEFAULT_TIMEOUT, connecting).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), SessionError::Stopped);
}

#[tokio::test]
async fn test_lease_waits_for_session() {
    let server = sim_server(&[("A", Value::Int(0))]);
    server.set_reachable(false);
    let manager = manager(&server, &fast_config(SIM_ADDRESS, &["A"]));
    let watcher = manager.watcher();

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.connect().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
    assert!(watcher.lease(0, deadline).await.is_err());

    server.set_reachable(true);
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    let lease = watcher.lease(0, deadline).await.unwrap();
    assert_eq!(lease.generation(), 1);
    drop(lease);

    connecting.await.unwrap().unwrap();
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_during_first_connect() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let config = fast_config(SIM_ADDRESS, &["A"]);
    let client: Arc<dyn UaClient> = Arc::new(SlowConnectClient {
        inner: SimClient::new(Arc::clone(&server)),
        delay: Duration::from_millis(200),
    });
    let resolver = EndpointResolver::new(Arc::clone(&client), config.discovery_timeout());
    let manager = SessionManager::new(client, resolver, SessionSettings::from_config(&config));

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    timeout(DEFAULT_TIMEOUT, manager.stop()).await.unwrap();

    let result = timeout(DEFAULT_TIMEOUT, connecting).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), SessionError::Stopped);
    assert_eq!(manager.current_state(), SessionState::Closed);
    assert_eq!(server.session_count(), 0);

    manager.stop().await;
    assert_eq!(manager.current_state(), SessionState::Closed);
    assert_eq!(server.session_count(), 0);
}
