//! uabridge transport layer
//!
//! Text-frame WebSocket transport for the client-facing channel. Each
//! connection is split into a [`TransportSender`] and a
//! [`TransportReceiver`] backed by dedicated writer and reader tasks.

pub mod error;
pub mod traits;
pub mod websocket;

pub use error::{Result, TransportError};
pub use traits::{Transport, TransportEvent, TransportReceiver, TransportSender, TransportServer};
pub use websocket::{
    WebSocketConfig, WebSocketReceiver, WebSocketSender, WebSocketServer, WebSocketTransport,
};
