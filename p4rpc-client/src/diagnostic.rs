//! Server diagnostic codes.
//!
//! Each diagnostic carries a numeric code, sent as decimal text, that packs
//! several fields:
//!
//! ```text
//!  31    28 27  24 23       16 15      10 9          0
//! +--------+------+-----------+----------+------------+
//! |severity| argc |  generic  | subsystem|   subcode  |
//! +--------+------+-----------+----------+------------+
//! ```

use p4rpc_protocol::ProtocolError;
use std::fmt;

/// Diagnostic severity. Larger is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Severity(pub u8);

impl Severity {
    pub const EMPTY: Severity = Severity(0);
    pub const INFO: Severity = Severity(1);
    pub const WARN: Severity = Severity(2);
    pub const FAILED: Severity = Severity(3);
    pub const FATAL: Severity = Severity(4);

    /// Returns whether this severity is error-class. Error-class diagnostics
    /// are delivered even in quiet mode.
    pub fn is_error(self) -> bool {
        self >= Severity::WARN
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "empty",
            1 => "info",
            2 => "warning",
            3 => "error",
            4 => "fatal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded diagnostic code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(pub u32);

impl MessageCode {
    /// Parses the decimal code text sent by the server.
    pub fn parse(text: &[u8]) -> Result<Self, ProtocolError> {
        std::str::from_utf8(text)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(MessageCode)
            .ok_or_else(|| {
                ProtocolError::InvalidMessageCode(String::from_utf8_lossy(text).into_owned())
            })
    }

    pub fn severity(self) -> Severity {
        Severity((self.0 >> 28) as u8)
    }

    /// Number of arguments the message template expects.
    pub fn argc(self) -> u8 {
        ((self.0 >> 24) & 0x0f) as u8
    }

    pub fn generic(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub fn subsystem(self) -> u8 {
        ((self.0 >> 10) & 0x3f) as u8
    }

    pub fn subcode(self) -> u16 {
        (self.0 & 0x3ff) as u16
    }
}
