//! Network error types

use std::io;

use crate::connection::ClientId;
use crate::frame::FrameError;
use crate::handshake::HandshakeError;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Server full")]
    ServerFull,
}

/// Returned by application handlers; the router logs it and moves on.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Net(#[from] Error),
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        HandlerError::Failed(msg.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError::Failed(msg)
    }
}

/// Handler result type
pub type HandlerResult = std::result::Result<(), HandlerError>;
