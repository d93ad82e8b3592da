//! Protocol error types.
//!
//! Codec failures are split by what they invalidate: a [`FrameError`] means
//! the peer sent bytes that do not form a valid frame, a [`TransportError`]
//! means the byte stream itself failed. Both are fatal to a connection.
//! [`ProtocolError`] covers well-formed frames the client cannot act on.

use thiserror::Error;

/// Structural errors in a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("header checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("malformed field at offset {offset}: {reason}")]
    MalformedField { offset: usize, reason: &'static str },
}

/// Failures of the underlying byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed inside frame {stage}: got {received} of {expected} bytes")]
    UnexpectedEof {
        stage: &'static str,
        received: usize,
        expected: usize,
    },
}

/// Result of reading or writing one frame.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Transport(TransportError::Io(e))
    }
}

/// Well-formed frames the client cannot process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unhandled function {0:?}")]
    UnhandledFunction(String),

    #[error("unhandled client function {0:?}")]
    UnhandledClientFunction(String),

    #[error("frame has no func symbol")]
    MissingFunction,

    #[error("missing required symbol {0:?}")]
    MissingSymbol(&'static str),

    #[error("release received with no command in flight")]
    UnsolicitedRelease,

    #[error("client function {0:?} received with no command in flight")]
    NoActiveCommand(String),

    #[error("invalid message code {0:?}")]
    InvalidMessageCode(String),
}

/// Server address parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("missing port in server address {0:?}")]
    MissingPort(String),

    #[error("unterminated '[' in server address {0:?}")]
    UnterminatedBracket(String),

    #[error("unexpected text after ']' in server address {0:?}")]
    TrailingText(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_display() {
        let err = FrameError::ChecksumMismatch {
            expected: 0x0a,
            actual: 0xff,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x0a"));
        assert!(msg.contains("0xff"));

        let err = FrameError::TooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = FrameError::MalformedField {
            offset: 7,
            reason: "name is not NUL-terminated",
        };
        assert!(err.to_string().contains("offset 7"));
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::UnexpectedEof {
            stage: "header",
            received: 3,
            expected: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("header"));
        assert!(msg.contains("3 of 5"));
    }

    #[test]
    fn test_wire_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = WireError::from(io);
        assert!(matches!(err, WireError::Transport(TransportError::Io(_))));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnhandledFunction("bogus".to_string());
        assert!(err.to_string().contains("bogus"));

        let err = ProtocolError::UnhandledClientFunction("Prompt".to_string());
        assert!(err.to_string().contains("Prompt"));

        let err = ProtocolError::MissingSymbol("confirm");
        assert!(err.to_string().contains("confirm"));
    }
}
