//! Client error types.

use p4rpc_protocol::{AddressError, FrameError, ProtocolError, TransportError, WireError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid server address: {0}")]
    Address(#[from] AddressError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("handler error: {0}")]
    Handler(String),
}

impl From<WireError> for ClientError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Frame(e) => ClientError::Frame(e),
            WireError::Transport(e) => ClientError::Transport(e),
        }
    }
}

impl ClientError {
    /// Returns whether this error invalidates the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Frame(_) | ClientError::Transport(_))
    }
}
