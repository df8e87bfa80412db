//! Protocol error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("bad node id: {0}")]
    BadNodeId(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(u32),

    #[error("timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Other(String),
}
