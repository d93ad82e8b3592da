//! # p4rpc-relay
//!
//! Logging relay for the p4 RPC protocol.
//!
//! This crate provides:
//! - A TCP relay that pairs every client with its own server connection
//! - Frame-level logging of both directions through `tracing`
//! - YAML configuration with environment variable overrides

pub mod config;
pub mod error;
pub mod relay;

pub use config::{Config, ConfigError, NetworkConfig, UpstreamConfig};
pub use error::RelayError;
pub use relay::{forward, Direction, Relay, RelayConfig, RelayStats};
