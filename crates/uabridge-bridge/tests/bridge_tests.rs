//! End-to-end Bridge Tests (uabridge-bridge)
//!
//! Tests the assembled bridge over real WebSocket connections:
//! - Writes acknowledged to the writer, resulting changes to everyone
//! - One event per value change
//! - Implicit `sendValue` targeting
//! - Client disconnects and session reconnects
//! - Ordered, idempotent shutdown

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uabridge_bridge::{Bridge, BridgeConfig, BridgeError, SubscriptionError};
use uabridge_core::{SessionState, Value};
use uabridge_protocol::SimClient;
use uabridge_test_utils::{
    fast_config, is_event_for, is_write_result, sim_server, wait_for, TestBridge,
    DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT, SIM_ADDRESS,
};
use uabridge_transport::{Transport, WebSocketTransport};

const RECV_WAIT: Duration = Duration::from_secs(5);
const QUIET_WAIT: Duration = Duration::from_millis(300);

/// Wait until the bridge has seen a value for every node in `nodes`
async fn wait_for_values(bridge: &Arc<Bridge>, nodes: &[&str]) {
    let bridge = Arc::clone(bridge);
    let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
    assert!(
        wait_for(
            || {
                let bridge = Arc::clone(&bridge);
                let nodes = nodes.clone();
                async move { nodes.iter().all(|n| bridge.last_value(n).is_some()) }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await,
        "initial values never arrived"
    );
}

#[tokio::test]
async fn test_write_acknowledged_and_broadcast() {
    let test = TestBridge::start(&[("A", Value::Int(0)), ("B", Value::Int(0))]).await;
    wait_for_values(&test.bridge, &["A", "B"]).await;

    let mut writer = test.connect_client().await;
    let mut watcher = test.connect_client().await;

    writer
        .send_json(json!({"nodeId": "A", "value": "42"}))
        .await;

    let ack = writer
        .recv_matching(is_write_result, RECV_WAIT)
        .await
        .expect("writer gets an acknowledgement");
    assert_eq!(ack["nodeId"], "A");
    assert_eq!(ack["success"], true);
    assert!(ack.get("error").is_none());

    let change = |m: &serde_json::Value| is_event_for(m, "A") && m["value"] == 42;
    assert!(writer.recv_matching(change, RECV_WAIT).await.is_some());
    assert!(watcher.recv_matching(change, RECV_WAIT).await.is_some());
    assert!(watcher
        .recv_matching(is_write_result, QUIET_WAIT)
        .await
        .is_none());

    assert_eq!(test.server.value("A"), Some(Value::Int(42)));
    assert_eq!(test.bridge.last_value("A"), Some(Value::Int(42)));

    test.stop().await;
}

#[tokio::test]
async fn test_one_event_per_change() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    wait_for_values(&test.bridge, &["A"]).await;
    let mut client = test.connect_client().await;

    for i in 1..=5 {
        test.server.set_value("A", Value::Int(i));
    }

    let mut seen = Vec::new();
    while seen.last() != Some(&5) {
        let message = client
            .recv_matching(|m| is_event_for(m, "A"), RECV_WAIT)
            .await
            .expect("event for A");
        let value = message["value"].as_i64().unwrap();
        if value != 0 {
            seen.push(value);
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert!(client
        .recv_matching(|m| is_event_for(m, "A"), QUIET_WAIT)
        .await
        .is_none());

    test.stop().await;
}

#[tokio::test]
async fn test_event_uses_display_name() {
    let server = sim_server(&[("ns=2;s=Line1.Speed", Value::Float(1.0))]);
    let mut config = fast_config(SIM_ADDRESS, &[]);
    config.nodes = vec!["ns=2;s=Line1.Speed|Speed".parse().unwrap()];
    let test = TestBridge::start_with(server, config).await;
    wait_for_values(&test.bridge, &["ns=2;s=Line1.Speed"]).await;
    let mut client = test.connect_client().await;

    test.server.set_value("ns=2;s=Line1.Speed", Value::Float(2.5));
    let message = client
        .recv_matching(|m| is_event_for(m, "Speed") && m["value"] == 2.5, RECV_WAIT)
        .await
        .expect("event under display name");
    assert!(message["timestamp"].is_string());

    test.stop().await;
}

#[tokio::test]
async fn test_send_value_single_node() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    wait_for_values(&test.bridge, &["A"]).await;
    let mut client = test.connect_client().await;

    client.send_json(json!({"sendValue": 7})).await;

    let ack = client
        .recv_matching(is_write_result, RECV_WAIT)
        .await
        .expect("acknowledgement");
    assert_eq!(ack["nodeId"], "A");
    assert_eq!(ack["success"], true);
    assert_eq!(test.server.value("A"), Some(Value::Int(7)));

    test.stop().await;
}

#[tokio::test]
async fn test_send_value_ambiguous_with_many_nodes() {
    let test = TestBridge::start(&[("A", Value::Int(0)), ("B", Value::Int(0))]).await;
    let mut client = test.connect_client().await;

    client.send_json(json!({"sendValue": 7})).await;

    let ack = client
        .recv_matching(is_write_result, RECV_WAIT)
        .await
        .expect("acknowledgement");
    assert_eq!(ack["success"], false);
    assert!(test.server.writes().is_empty());

    test.stop().await;
}

#[tokio::test]
async fn test_write_errors_echoed_when_enabled() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let mut config = fast_config(SIM_ADDRESS, &["A"]);
    config.echo_write_errors = true;
    let test = TestBridge::start_with(server, config).await;
    let mut client = test.connect_client().await;

    client
        .send_json(json!({"nodeId": "Z", "value": 1}))
        .await;

    let ack = client
        .recv_matching(is_write_result, RECV_WAIT)
        .await
        .expect("acknowledgement");
    assert_eq!(ack["nodeId"], "Z");
    assert_eq!(ack["success"], false);
    assert!(ack["error"].as_str().unwrap().contains("unknown node"));

    test.stop().await;
}

#[tokio::test]
async fn test_malformed_message_keeps_client() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    wait_for_values(&test.bridge, &["A"]).await;
    let mut client = test.connect_client().await;

    client.send_text("definitely not json").await;
    client.send_text(r#"{"hello": "world"}"#).await;
    test.server.set_value("A", Value::Int(3));

    assert!(client
        .recv_matching(|m| is_event_for(m, "A") && m["value"] == 3, RECV_WAIT)
        .await
        .is_some());
    assert_eq!(test.bridge.hub().client_count(), 1);

    test.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_isolated() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    let mut stays = test.connect_client().await;
    let leaves = test.connect_client().await;
    assert_eq!(test.bridge.hub().client_count(), 2);

    leaves.close().await;
    drop(leaves);
    for i in 1..=3 {
        test.server.set_value("A", Value::Int(i));
    }

    assert!(stays
        .recv_matching(|m| is_event_for(m, "A") && m["value"] == 3, RECV_WAIT)
        .await
        .is_some());

    let hub = Arc::clone(test.bridge.hub());
    assert!(
        wait_for(
            || {
                let hub = Arc::clone(&hub);
                async move { hub.client_count() == 1 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );

    test.stop().await;
}

#[tokio::test]
async fn test_idle_tcp_peer_isolated() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    let _idle = tokio::net::TcpStream::connect(test.addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_first_tx, _first_rx) =
        tokio::time::timeout(Duration::from_secs(3), WebSocketTransport::connect(&test.url()))
            .await
            .expect("client connects while another peer idles")
            .unwrap();

    let mut client = test.connect_client().await;
    test.server.set_value("A", Value::Int(4));
    assert!(client
        .recv_matching(|m| is_event_for(m, "A") && m["value"] == 4, RECV_WAIT)
        .await
        .is_some());

    test.stop().await;
}

#[tokio::test]
async fn test_clients_survive_reconnect() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    let mut client = test.connect_client().await;

    test.server.drop_sessions("server restart");
    let watcher = test.bridge.session_watcher();
    tokio::time::timeout(DEFAULT_TIMEOUT, watcher.wait_active(2))
        .await
        .unwrap()
        .unwrap();

    // The subscription comes back on the new session
    let server = Arc::clone(&test.server);
    assert!(
        wait_for(
            || {
                let server = Arc::clone(&server);
                async move { server.subscription_count() == 1 }
            },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    );

    test.server.set_value("A", Value::Int(9));
    assert!(client
        .recv_matching(|m| is_event_for(m, "A") && m["value"] == 9, RECV_WAIT)
        .await
        .is_some());

    let status = test.bridge.status();
    assert_eq!(status.session_state, SessionState::Active);
    assert_eq!(status.session_generation, 2);
    assert_eq!(status.clients, 1);

    test.stop().await;
}

#[tokio::test]
async fn test_status() {
    let test = TestBridge::start(&[("B", Value::Int(0)), ("A", Value::Bool(false))]).await;
    let _client = test.connect_client().await;

    let status = test.bridge.status();
    assert_eq!(status.session_state, SessionState::Active);
    assert_eq!(status.session_generation, 1);
    assert_eq!(status.clients, 1);
    assert_eq!(status.monitored, vec!["A".to_string(), "B".to_string()]);

    test.stop().await;
}

#[tokio::test]
async fn test_stop_closes_everything() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    let mut first = test.connect_client().await;
    let mut second = test.connect_client().await;

    test.stop().await;

    assert!(first.wait_closed(RECV_WAIT).await);
    assert!(second.wait_closed(RECV_WAIT).await);
    assert_eq!(test.bridge.hub().client_count(), 0);
    assert_eq!(test.server.session_count(), 0);
    assert_eq!(test.server.subscription_count(), 0);
    assert_eq!(test.bridge.status().session_state, SessionState::Closed);
    assert!(WebSocketTransport::connect(&test.url()).await.is_err());

    // Idempotent
    test.stop().await;
    assert_eq!(test.bridge.status().session_state, SessionState::Closed);
}

#[tokio::test]
async fn test_start_fails_when_nothing_monitorable() {
    let server = sim_server(&[("A", Value::Int(0))]);
    server.reject_monitoring("A");
    let config = fast_config(SIM_ADDRESS, &["A"]);
    let bridge = Bridge::new(config, Arc::new(SimClient::new(Arc::clone(&server)))).unwrap();

    let result = tokio::time::timeout(DEFAULT_TIMEOUT, bridge.start())
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(BridgeError::Subscription(SubscriptionError::NoMonitoredItems))
    ));
    assert_eq!(server.session_count(), 0);
    assert_eq!(bridge.status().session_state, SessionState::Closed);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let server = sim_server(&[]);
    let config = BridgeConfig::new(SIM_ADDRESS, vec![]);
    assert!(matches!(
        Bridge::new(config, Arc::new(SimClient::new(server))),
        Err(BridgeError::Config(_))
    ));
}

#[tokio::test]
async fn test_start_twice_rejected() {
    let test = TestBridge::start(&[("A", Value::Int(0))]).await;
    assert!(matches!(
        test.bridge.start().await,
        Err(BridgeError::AlreadyStarted)
    ));
    test.stop().await;
}
