//! # p4rpc-protocol
//!
//! Wire protocol for the Perforce-style RPC used by p4rpc.
//!
//! This crate provides:
//! - Binary framing with an XOR length checksum
//! - Field encoding for positional arguments and named symbols
//! - Buffered and async-stream decoders
//! - Server address parsing

pub mod address;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use address::{ServerAddress, DEFAULT_SERVER_ADDRESS};
pub use codec::{write_message, Decoder, FrameReader};
pub use error::{AddressError, FrameError, ProtocolError, TransportError, WireError};
pub use frame::{FrameHeader, FRAME_HEADER_SIZE};
pub use message::{Message, Symbols, FUNC};

/// API level announced in the protocol handshake.
pub const API_LEVEL: &str = "99999";

/// Client protocol level announced in the protocol handshake.
pub const CLIENT_LEVEL: &str = "84";

/// Default maximum frame body size (64 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;
