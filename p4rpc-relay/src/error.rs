//! Relay error types.

use crate::config::ConfigError;
use p4rpc_protocol::WireError;
use std::net::SocketAddr;
use thiserror::Error;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("no address found for upstream {0}")]
    UnresolvedUpstream(String),

    #[error("timed out connecting to upstream {0}")]
    UpstreamTimeout(String),

    #[error("relay for {0} shut down")]
    ShuttingDown(SocketAddr),
}
