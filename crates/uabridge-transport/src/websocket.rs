//! WebSocket transport implementation

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::protocol::{Message as WsMessage, WebSocketConfig as WsProtocolConfig},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    Transport, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before `send` waits
    pub send_buffer: usize,
    /// Inbound events buffered per connection
    pub recv_buffer: usize,
    /// Time a new TCP peer gets to complete the upgrade
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64KB
            send_buffer: 64,
            recv_buffer: 100,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConfig {
    fn protocol_config(&self) -> WsProtocolConfig {
        WsProtocolConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_message_size),
            ..Default::default()
        }
    }
}

/// WebSocket transport
pub struct WebSocketTransport;

/// WebSocket sender
pub struct WebSocketSender {
    tx: mpsc::Sender<WsMessage>,
    connected: Arc<Mutex<bool>>,
}

#[async_trait]
impl TransportSender for WebSocketSender {
    async fn send(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.tx
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    async fn close(&self) -> Result<()> {
        let was_connected = std::mem::replace(&mut *self.connected.lock(), false);
        if was_connected {
            // A full buffer means the peer stopped reading; don't wait on it
            let _ = self.tx.try_send(WsMessage::Close(None));
        }
        Ok(())
    }
}

/// WebSocket receiver
pub struct WebSocketReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Split an upgraded stream into a sender/receiver pair driven by a writer
/// task and a reader task.
fn spawn_io<S>(
    ws_stream: WebSocketStream<S>,
    config: &WebSocketConfig,
) -> (WebSocketSender, WebSocketReceiver)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws_stream.split();

    let (send_tx, mut send_rx) = mpsc::channel::<WsMessage>(config.send_buffer.max(1));
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(config.recv_buffer.max(1));

    let connected = Arc::new(Mutex::new(true));
    let connected_write = connected.clone();
    let connected_read = connected.clone();

    // Writer task
    tokio::spawn(async move {
        while let Some(msg) = send_rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("WebSocket write error: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
        *connected_write.lock() = false;
    });

    // Reader task
    tokio::spawn(async move {
        let _ = event_tx.send(TransportEvent::Connected).await;

        let reason = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if event_tx.send(TransportEvent::Text(text)).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if event_tx.send(TransportEvent::Text(text)).await.is_err() {
                            break None;
                        }
                    }
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame");
                        let _ = event_tx
                            .send(TransportEvent::Error("binary frame is not UTF-8".into()))
                            .await;
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame.map(|f| f.reason.to_string());
                }
                // Pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket read error: {}", e);
                    let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                    break Some(e.to_string());
                }
                None => break None,
            }
        };

        *connected_read.lock() = false;
        let _ = event_tx
            .send(TransportEvent::Disconnected { reason })
            .await;
    });

    (
        WebSocketSender {
            tx: send_tx,
            connected,
        },
        WebSocketReceiver { rx: event_rx },
    )
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Sender = WebSocketSender;
    type Receiver = WebSocketReceiver;

    async fn connect(url: &str) -> Result<(Self::Sender, Self::Receiver)> {
        debug!("Connecting to WebSocket: {}", url);
        let config = WebSocketConfig::default();

        let (ws_stream, response) =
            connect_async_with_config(url, Some(config.protocol_config()), false)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!("WebSocket connected, response: {:?}", response.status());

        Ok(spawn_io(ws_stream, &config))
    }
}

type Upgraded = (WebSocketStream<TcpStream>, SocketAddr);

/// WebSocket server
///
/// Each TCP peer is upgraded on its own task, so a peer that never finishes
/// the handshake only costs itself `handshake_timeout`.
pub struct WebSocketServer {
    listener: TcpListener,
    config: WebSocketConfig,
    upgraded_tx: mpsc::Sender<Upgraded>,
    upgraded_rx: mpsc::Receiver<Upgraded>,
}

impl WebSocketServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        info!("WebSocket server listening on {}", listener.local_addr()?);

        let (upgraded_tx, upgraded_rx) = mpsc::channel(32);
        Ok(Self {
            listener,
            config: WebSocketConfig::default(),
            upgraded_tx,
            upgraded_rx,
        })
    }

    pub fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    fn spawn_handshake(&self, stream: TcpStream, addr: SocketAddr) {
        let protocol_config = self.config.protocol_config();
        let handshake_timeout = self.config.handshake_timeout;
        let upgraded_tx = self.upgraded_tx.clone();

        tokio::spawn(async move {
            let handshake =
                tokio_tungstenite::accept_async_with_config(stream, Some(protocol_config));
            match tokio::time::timeout(handshake_timeout, handshake).await {
                Ok(Ok(ws_stream)) => {
                    // Fails only once the server is gone
                    let _ = upgraded_tx.send((ws_stream, addr)).await;
                }
                Ok(Err(e)) => error!("WebSocket handshake with {} failed: {}", addr, e),
                Err(_) => warn!(
                    "WebSocket handshake with {} timed out after {:?}",
                    addr, handshake_timeout
                ),
            }
        });
    }
}

#[async_trait]
impl TransportServer for WebSocketServer {
    type Sender = WebSocketSender;
    type Receiver = WebSocketReceiver;

    /// Wait for the next peer that completes the upgrade. Cancel safe.
    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!("Accepted TCP connection from {}", addr);
                    self.spawn_handshake(stream, addr);
                }
                Some((ws_stream, addr)) = self.upgraded_rx.recv() => {
                    info!("WebSocket client connected from {}", addr);
                    let (sender, receiver) = spawn_io(ws_stream, &self.config);
                    return Ok((sender, receiver, addr));
                }
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
