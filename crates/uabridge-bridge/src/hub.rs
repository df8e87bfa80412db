//! Fan-out hub
//!
//! Tracks connected web clients, relays every event to all of them and
//! turns their inbound messages into write requests. A client that fails or
//! stalls on a send is dropped without holding up the others.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uabridge_core::{
    codec, ClientId, ClientMessage, ClientState, Event, NodeId, WriteError, WriteRequest,
    WriteResult,
};
use uabridge_transport::{TransportEvent, TransportReceiver, TransportSender, TransportServer};
use uuid::Uuid;

use crate::error::ClientSendError;

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bound on every single send to a client
    pub send_timeout: Duration,
    /// Include failure reasons in write acknowledgements
    pub echo_write_errors: bool,
    /// Target of `sendValue` messages, when exactly one node is monitored
    pub implicit_target: Option<NodeId>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            echo_write_errors: false,
            implicit_target: None,
        }
    }
}

/// A connected web client
pub struct ClientConnection {
    pub id: ClientId,
    pub addr: Option<SocketAddr>,
    pub connected_at: Instant,
    sender: Arc<dyn TransportSender>,
    state: Mutex<ClientState>,
}

impl ClientConnection {
    fn new(sender: Arc<dyn TransportSender>, addr: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            addr,
            connected_at: Instant::now(),
            sender,
            state: Mutex::new(ClientState::Open),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Send one text frame, bounded by `limit`
    pub async fn send(&self, text: String, limit: Duration) -> Result<(), ClientSendError> {
        if self.state() != ClientState::Open {
            return Err(ClientSendError::Closed(self.id.clone()));
        }
        match timeout(limit, self.sender.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClientSendError::Transport {
                client_id: self.id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ClientSendError::Timeout {
                client_id: self.id.clone(),
                timeout: limit,
            }),
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<ClientId>,
}

pub struct FanoutHub {
    config: HubConfig,
    clients: DashMap<ClientId, Arc<ClientConnection>>,
    writes: mpsc::Sender<WriteRequest>,
    accept_stop: CancellationToken,
    shutdown: CancellationToken,
}

impl FanoutHub {
    pub fn new(config: HubConfig, writes: mpsc::Sender<WriteRequest>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clients: DashMap::new(),
            writes,
            accept_stop: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|c| c.key().clone()).collect()
    }

    pub fn is_accepting(&self) -> bool {
        !self.accept_stop.is_cancelled()
    }

    /// Add a client to the broadcast set
    pub fn register(
        &self,
        sender: Arc<dyn TransportSender>,
        addr: Option<SocketAddr>,
    ) -> Arc<ClientConnection> {
        let client = Arc::new(ClientConnection::new(sender, addr));
        self.clients.insert(client.id.clone(), Arc::clone(&client));
        info!(
            "Client {} connected from {:?} ({} total)",
            client.id,
            addr,
            self.clients.len()
        );
        client
    }

    /// Register a client and read its messages until it disconnects
    pub fn accept<R>(
        self: &Arc<Self>,
        sender: Arc<dyn TransportSender>,
        mut receiver: R,
        addr: SocketAddr,
    ) -> Arc<ClientConnection>
    where
        R: TransportReceiver + 'static,
    {
        let client = self.register(sender, Some(addr));
        let hub = Arc::clone(self);
        let client_id = client.id.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Some(TransportEvent::Text(text)) => {
                        hub.on_client_message(&client_id, &text).await;
                    }
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected { reason }) => {
                        info!("Client {} disconnected: {:?}", client_id, reason);
                        break;
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!("Transport error from client {}: {}", client_id, e);
                    }
                    None => break,
                }
            }
            hub.remove(&client_id).await;
        });

        client
    }

    /// Send an event to every open client, concurrently. Clients that fail
    /// or exceed the send timeout are removed.
    pub async fn broadcast(&self, event: &Event) -> BroadcastReport {
        let text = match codec::encode_event(event) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode event for {}: {}", event.node_id, e);
                return BroadcastReport::default();
            }
        };

        let targets: Vec<Arc<ClientConnection>> =
            self.clients.iter().map(|c| Arc::clone(c.value())).collect();
        let limit = self.config.send_timeout;

        let outcomes = join_all(targets.iter().map(|client| {
            let text = text.clone();
            async move { client.send(text, limit).await }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (client, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping client: {}", e);
                    if self.remove(&client.id).await {
                        report.removed.push(client.id.clone());
                    }
                }
            }
        }
        report
    }

    /// Handle one text message from a client
    pub async fn on_client_message(&self, client_id: &str, raw: &str) {
        let message = match codec::decode_client_message(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from client {}: {}", client_id, e);
                return;
            }
        };

        match message {
            ClientMessage::Write { node_id, value } => {
                let request = WriteRequest {
                    node_id: node_id
                        .or_else(|| self.config.implicit_target.clone())
                        .unwrap_or_default(),
                    value,
                    origin: client_id.to_string(),
                };
                if request.node_id.is_empty() {
                    debug!("Client {} sent a write without a target", client_id);
                    self.deliver_result(WriteResult::failed(&request, WriteError::AmbiguousTarget))
                        .await;
                    return;
                }

                if let Err(mpsc::error::SendError(request)) = self.writes.send(request).await {
                    self.deliver_result(WriteResult::failed(&request, WriteError::Cancelled))
                        .await;
                }
            }
        }
    }

    /// Route a write result to its originating client only
    pub async fn deliver_result(&self, result: WriteResult) {
        let Some(client) = self.clients.get(&result.origin).map(|c| Arc::clone(c.value())) else {
            debug!(
                "Origin {} of write to {} is gone",
                result.origin, result.node_id
            );
            return;
        };

        let text = match codec::encode_write_result(&result, self.config.echo_write_errors) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode write result: {}", e);
                return;
            }
        };

        if let Err(e) = client.send(text, self.config.send_timeout).await {
            warn!("Dropping client: {}", e);
            self.remove(&client.id).await;
        }
    }

    /// Remove a client and close its connection. Returns false if it was
    /// already gone.
    pub async fn remove(&self, client_id: &str) -> bool {
        let Some((_, client)) = self.clients.remove(client_id) else {
            return false;
        };
        *client.state.lock() = ClientState::Closing;
        if timeout(self.config.send_timeout, client.sender.close())
            .await
            .is_err()
        {
            debug!("Timed out closing client {}", client_id);
        }
        *client.state.lock() = ClientState::Closed;
        info!(
            "Client {} removed ({} remaining)",
            client_id,
            self.clients.len()
        );
        true
    }

    /// Broadcast events until the channel closes or `cancel` fires
    pub async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let report = self.broadcast(&event).await;
            debug!(
                "Event for {} delivered to {} clients",
                event.node_id, report.delivered
            );
        }
    }

    /// Deliver write results until the dispatcher hangs up
    pub async fn run_results(self: Arc<Self>, mut results: mpsc::Receiver<WriteResult>) {
        while let Some(result) = results.recv().await {
            self.deliver_result(result).await;
        }
    }

    /// Accept clients from `server` until [`stop_accepting`](Self::stop_accepting),
    /// then hold the listening socket until [`close`](Self::close).
    pub async fn serve_on<S>(self: Arc<Self>, mut server: S)
    where
        S: TransportServer + 'static,
        S::Sender: 'static,
        S::Receiver: 'static,
    {
        info!("Accepting clients");
        loop {
            tokio::select! {
                biased;
                _ = self.accept_stop.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok((sender, receiver, addr)) => {
                        self.accept(Arc::new(sender), receiver, addr);
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                },
            }
        }
        info!("No longer accepting clients");

        self.shutdown.cancelled().await;
        drop(server);
        info!("Listening socket closed");
    }

    pub fn stop_accepting(&self) {
        self.accept_stop.cancel();
    }

    /// Disconnect every client and release the listening socket
    pub async fn close(&self) {
        self.accept_stop.cancel();
        self.shutdown.cancel();
        for client_id in self.client_ids() {
            self.remove(&client_id).await;
        }
    }
}
