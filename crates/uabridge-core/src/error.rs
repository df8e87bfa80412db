//! Error types for the core wire format

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Text was not valid JSON
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON was well-formed but not a message we understand
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Message carried no payload the bridge acts on
    #[error("unsupported message: {0}")]
    UnsupportedMessage(String),
}
