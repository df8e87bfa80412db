//! Write Dispatcher Tests (uabridge-bridge)
//!
//! Tests for the write dispatcher including:
//! - Coercion to the node's last known type
//! - Local refusal of unknown nodes and impossible coercions
//! - Writes that span a reconnect
//! - Timeouts and cancellation
//! - Submission order

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uabridge_bridge::{
    point_table, EndpointResolver, PointTable, SessionManager, SessionSettings, WriteDispatcher,
};
use uabridge_core::{Value, ValueKind, WriteError, WriteRequest, WriteResult};
use uabridge_protocol::{SimClient, SimServer, UaClient};
use uabridge_test_utils::{fast_config, sim_server, DEFAULT_TIMEOUT, SIM_ADDRESS};

struct Harness {
    manager: Arc<SessionManager>,
    points: PointTable,
    dispatcher: Arc<WriteDispatcher>,
    cancel: CancellationToken,
}

impl Harness {
    async fn start(server: &Arc<SimServer>, nodes: &[&str], write_timeout: Duration) -> Self {
        let config = fast_config(SIM_ADDRESS, nodes);
        let client: Arc<dyn UaClient> = Arc::new(SimClient::new(Arc::clone(server)));
        let resolver = EndpointResolver::new(Arc::clone(&client), config.discovery_timeout());
        let manager = SessionManager::new(client, resolver, SessionSettings::from_config(&config));
        manager.connect().await.expect("connect");

        let points = point_table(config.monitored_points());
        let cancel = CancellationToken::new();
        let dispatcher = WriteDispatcher::new(
            manager.watcher(),
            Arc::clone(&points),
            write_timeout,
            cancel.clone(),
        );

        Self {
            manager,
            points,
            dispatcher,
            cancel,
        }
    }

    /// Record `value` as the last observed value of `node`
    fn observe(&self, node: &str, value: Value) {
        if let Some(point) = self.points.write().get_mut(node) {
            point.last_value = Some(value);
        }
    }
}

fn write(node: &str, value: Value) -> WriteRequest {
    WriteRequest {
        node_id: node.to_string(),
        value,
        origin: "client-1".to_string(),
    }
}

#[tokio::test]
async fn test_string_coerced_to_int() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(2)).await;
    harness.observe("A", Value::Int(0));

    let result = harness
        .dispatcher
        .dispatch(write("A", Value::String("42".into())))
        .await;

    assert!(result.is_success());
    assert_eq!(result.origin, "client-1");
    assert_eq!(server.value("A"), Some(Value::Int(42)));
    assert_eq!(server.writes(), vec![("A".to_string(), Value::Int(42))]);

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_unknown_node_refused() {
    let server = sim_server(&[("A", Value::Int(0)), ("Z", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(2)).await;

    let result = harness.dispatcher.dispatch(write("Z", Value::Int(1))).await;
    assert_eq!(result.outcome, Err(WriteError::UnknownNode("Z".into())));
    assert!(server.writes().is_empty());

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_type_mismatch_refused() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(2)).await;
    harness.observe("A", Value::Int(0));

    let result = harness
        .dispatcher
        .dispatch(write("A", Value::String("fast".into())))
        .await;
    assert_eq!(
        result.outcome,
        Err(WriteError::TypeMismatch {
            node_id: "A".into(),
            expected: ValueKind::Int,
            found: ValueKind::String,
        })
    );
    assert!(server.writes().is_empty());

    harness.manager.stop().await;
}

/// Without an observed value the server decides
#[tokio::test]
async fn test_server_type_mismatch_reported() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(2)).await;

    let result = harness
        .dispatcher
        .dispatch(write("A", Value::String("fast".into())))
        .await;
    assert!(matches!(
        result.outcome,
        Err(WriteError::ServerTypeMismatch { ref node_id, .. }) if node_id == "A"
    ));

    let result = harness.dispatcher.dispatch(write("A", Value::Int(3))).await;
    assert!(result.is_success());

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_write_waits_for_reconnect() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(3)).await;
    let watcher = harness.manager.watcher();

    server.set_reachable(false);
    server.drop_sessions("link down");

    let pending = {
        let dispatcher = Arc::clone(&harness.dispatcher);
        tokio::spawn(async move { dispatcher.dispatch(write("A", Value::Int(5))).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());
    assert!(server.writes().is_empty());

    server.set_reachable(true);
    let result = timeout(DEFAULT_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(watcher.generation(), 2);
    assert_eq!(server.writes(), vec![("A".to_string(), Value::Int(5))]);

    harness.manager.stop().await;
}

/// A session lost mid-write is retried once the next session is up
#[tokio::test]
async fn test_write_retried_on_new_session() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(5)).await;
    server.set_write_delay(Some(Duration::from_millis(200)));

    let pending = {
        let dispatcher = Arc::clone(&harness.dispatcher);
        tokio::spawn(async move { dispatcher.dispatch(write("A", Value::Int(8))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.drop_sessions("link down");

    let result = timeout(DEFAULT_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(harness.manager.watcher().generation(), 2);
    assert_eq!(server.writes(), vec![("A".to_string(), Value::Int(8))]);

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_session_unavailable_after_timeout() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_millis(200)).await;

    server.set_reachable(false);
    server.drop_sessions("link down");

    let result = timeout(
        DEFAULT_TIMEOUT,
        harness.dispatcher.dispatch(write("A", Value::Int(1))),
    )
    .await
    .unwrap();
    assert_eq!(result.outcome, Err(WriteError::SessionUnavailable));

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_slow_write_times_out() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_millis(100)).await;
    server.set_write_delay(Some(Duration::from_millis(500)));

    let result = harness.dispatcher.dispatch(write("A", Value::Int(1))).await;
    assert_eq!(
        result.outcome,
        Err(WriteError::Timeout(Duration::from_millis(100)))
    );

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_in_flight_write_cancelled() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(5)).await;
    server.set_write_delay(Some(Duration::from_millis(500)));

    let pending = {
        let dispatcher = Arc::clone(&harness.dispatcher);
        tokio::spawn(async move { dispatcher.dispatch(write("A", Value::Int(1))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.cancel.cancel();

    let result = timeout(Duration::from_millis(300), pending)
        .await
        .expect("cancellation should be prompt")
        .unwrap();
    assert_eq!(result.outcome, Err(WriteError::Cancelled));
    assert!(server.writes().is_empty());

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_run_preserves_order() {
    let server = sim_server(&[("A", Value::Int(0)), ("B", Value::Int(0))]);
    let harness = Harness::start(&server, &["A", "B"], Duration::from_secs(2)).await;

    let (requests_tx, requests_rx) = mpsc::channel(32);
    let (results_tx, mut results_rx) = mpsc::channel(32);
    let task = tokio::spawn(Arc::clone(&harness.dispatcher).run(requests_rx, results_tx));

    let expected: Vec<(String, Value)> = (0..10)
        .map(|i| {
            let node = if i % 2 == 0 { "A" } else { "B" };
            (node.to_string(), Value::Int(i))
        })
        .collect();
    for (node, value) in &expected {
        requests_tx.send(write(node, value.clone())).await.unwrap();
    }

    let mut results: Vec<WriteResult> = Vec::new();
    for _ in 0..expected.len() {
        results.push(
            timeout(DEFAULT_TIMEOUT, results_rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert!(results.iter().all(WriteResult::is_success));
    let result_nodes: Vec<_> = results.iter().map(|r| r.node_id.clone()).collect();
    let expected_nodes: Vec<_> = expected.iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(result_nodes, expected_nodes);
    assert_eq!(server.writes(), expected);

    drop(requests_tx);
    timeout(DEFAULT_TIMEOUT, task).await.unwrap().unwrap();
    harness.manager.stop().await;
}

#[tokio::test]
async fn test_queued_writes_cancelled_on_stop() {
    let server = sim_server(&[("A", Value::Int(0))]);
    let harness = Harness::start(&server, &["A"], Duration::from_secs(2)).await;

    let (requests_tx, requests_rx) = mpsc::channel(8);
    let (results_tx, mut results_rx) = mpsc::channel(8);
    for i in 0..3 {
        requests_tx.send(write("A", Value::Int(i))).await.unwrap();
    }
    harness.cancel.cancel();

    timeout(
        DEFAULT_TIMEOUT,
        Arc::clone(&harness.dispatcher).run(requests_rx, results_tx),
    )
    .await
    .unwrap();

    for _ in 0..3 {
        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.outcome, Err(WriteError::Cancelled));
    }
    assert!(results_rx.recv().await.is_none());
    assert!(server.writes().is_empty());

    harness.manager.stop().await;
}
