//! Bridge orchestration
//!
//! Wires the components together and owns the process lifecycle:
//! resolve, connect, subscribe, accept clients; on stop, stop accepting,
//! close the subscription, close the session, close the listening socket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uabridge_bridge::{Bridge, BridgeConfig, NodeConfig};
//! use uabridge_core::Value;
//! use uabridge_protocol::{SimClient, SimServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SimServer::new("sim://plant");
//! server.add_node("ns=2;s=Speed", Value::Int(0));
//!
//! let config = BridgeConfig::new("sim://plant", vec![NodeConfig::new("ns=2;s=Speed")]);
//! let bridge = Bridge::new(config, Arc::new(SimClient::new(server)))?;
//! bridge.start().await?;
//! bridge.serve_websocket("127.0.0.1:8080").await?;
//! // ...
//! bridge.stop().await;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uabridge_core::{Event, NodeId, SessionState, Value, WriteRequest};
use uabridge_protocol::UaClient;
use uabridge_transport::{TransportServer, WebSocketServer};

use crate::config::BridgeConfig;
use crate::dispatcher::WriteDispatcher;
use crate::error::{BridgeError, Result, SubscriptionError};
use crate::hub::{FanoutHub, HubConfig};
use crate::resolver::EndpointResolver;
use crate::session::{SessionManager, SessionSettings, SessionWatcher};
use crate::subscription::{point_table, EngineSettings, PointTable, SubscriptionEngine};

/// Snapshot of the bridge for operators
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    pub session_state: SessionState,
    pub session_generation: u64,
    pub clients: usize,
    pub monitored: Vec<NodeId>,
}

struct Channels {
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    writes_rx: mpsc::Receiver<WriteRequest>,
}

#[derive(Default)]
struct Tasks {
    events: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    results: Option<JoinHandle<()>>,
    serve: Option<JoinHandle<()>>,
}

pub struct Bridge {
    config: BridgeConfig,
    session: Arc<SessionManager>,
    engine: Arc<SubscriptionEngine>,
    hub: Arc<FanoutHub>,
    dispatcher: Arc<WriteDispatcher>,
    points: PointTable,
    channels: Mutex<Option<Channels>>,
    tasks: Mutex<Tasks>,
    events_cancel: CancellationToken,
    dispatch_cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Bridge {
    /// Build a bridge from a validated configuration
    pub fn new(config: BridgeConfig, client: Arc<dyn UaClient>) -> Result<Arc<Self>> {
        config.validate()?;

        let resolver = EndpointResolver::new(Arc::clone(&client), config.discovery_timeout());
        let session = SessionManager::new(client, resolver, SessionSettings::from_config(&config));

        let points = point_table(config.monitored_points());
        let engine = SubscriptionEngine::new(
            session.watcher(),
            Arc::clone(&points),
            EngineSettings::from_config(&config),
        );

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let (writes_tx, writes_rx) = mpsc::channel(config.event_buffer);

        let hub = FanoutHub::new(
            HubConfig {
                send_timeout: config.client_send_timeout(),
                echo_write_errors: config.echo_write_errors,
                implicit_target: config.implicit_target(),
            },
            writes_tx,
        );

        let dispatch_cancel = CancellationToken::new();
        let dispatcher = WriteDispatcher::new(
            session.watcher(),
            Arc::clone(&points),
            config.write_timeout(),
            dispatch_cancel.clone(),
        );

        Ok(Arc::new(Self {
            config,
            session,
            engine,
            hub,
            dispatcher,
            points,
            channels: Mutex::new(Some(Channels {
                events_tx,
                events_rx,
                writes_rx,
            })),
            tasks: Mutex::new(Tasks::default()),
            events_cancel: CancellationToken::new(),
            dispatch_cancel,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    pub fn session_watcher(&self) -> SessionWatcher {
        self.session.watcher()
    }

    /// Connect to the server and bring up the subscription. Discovery and
    /// connect failures are retried with backoff until success or
    /// [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted);
        }
        let channels = self
            .channels
            .lock()
            .take()
            .ok_or(BridgeError::AlreadyStarted)?;

        info!(
            "Starting bridge for {} ({} nodes)",
            self.config.server_address,
            self.config.nodes.len()
        );
        self.session.connect().await?;

        if let Err(e) = self.engine.spawn(channels.events_tx) {
            self.stop().await;
            return Err(e.into());
        }
        let ready = timeout(self.config.subscription_timeout() * 2, self.engine.wait_ready())
            .await
            .unwrap_or(Err(SubscriptionError::Timeout(
                self.config.subscription_timeout() * 2,
            )));
        if let Err(e) = ready {
            self.stop().await;
            return Err(e.into());
        }

        let (results_tx, results_rx) = mpsc::channel(self.config.event_buffer);
        let mut tasks = self.tasks.lock();
        tasks.events = Some(tokio::spawn(
            Arc::clone(&self.hub).run_events(channels.events_rx, self.events_cancel.clone()),
        ));
        tasks.dispatcher = Some(tokio::spawn(
            Arc::clone(&self.dispatcher).run(channels.writes_rx, results_tx),
        ));
        tasks.results = Some(tokio::spawn(Arc::clone(&self.hub).run_results(results_rx)));

        info!("Bridge running, monitoring {:?}", self.engine.monitored());
        Ok(())
    }

    /// Serve web clients on any transport
    pub fn serve_on<S>(&self, server: S)
    where
        S: TransportServer + 'static,
        S::Sender: 'static,
        S::Receiver: 'static,
    {
        let task = tokio::spawn(Arc::clone(&self.hub).serve_on(server));
        if let Some(previous) = self.tasks.lock().serve.replace(task) {
            warn!("Replacing an existing listener");
            previous.abort();
        }
    }

    /// Listen for WebSocket clients on `addr`, returning the bound address
    pub async fn serve_websocket(&self, addr: &str) -> Result<SocketAddr> {
        let server = WebSocketServer::bind(addr).await?;
        let local = server.local_addr()?;
        self.serve_on(server);
        Ok(local)
    }

    /// Start and listen on the configured address
    pub async fn run(&self) -> Result<SocketAddr> {
        self.start().await?;
        let listen = self.config.listen.clone();
        self.serve_websocket(&listen).await
    }

    /// Shut down in order. Idempotent; no event reaches a client after
    /// this returns.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping bridge");

        self.hub.stop_accepting();
        self.dispatch_cancel.cancel();

        self.events_cancel.cancel();
        let events = self.tasks.lock().events.take();
        if let Some(task) = events {
            let _ = task.await;
        }
        self.engine.stop().await;
        self.session.stop().await;

        let (dispatcher, results) = {
            let mut tasks = self.tasks.lock();
            (tasks.dispatcher.take(), tasks.results.take())
        };
        if let Some(task) = dispatcher {
            let _ = task.await;
        }
        if let Some(task) = results {
            let _ = task.await;
        }

        self.hub.close().await;
        let serve = self.tasks.lock().serve.take();
        if let Some(task) = serve {
            let _ = task.await;
        }
        info!("Bridge stopped");
    }

    pub fn status(&self) -> BridgeStatus {
        let watcher = self.session.watcher();
        BridgeStatus {
            session_state: watcher.state(),
            session_generation: watcher.generation(),
            clients: self.hub.client_count(),
            monitored: self.engine.monitored(),
        }
    }

    /// Last value seen for a node
    pub fn last_value(&self, node_id: &str) -> Option<Value> {
        self.points
            .read()
            .get(node_id)
            .and_then(|p| p.last_value.clone())
    }
}
