//! Server address parsing.
//!
//! Addresses take the form `[proto:]host:port`. The host may be written in
//! brackets (`[::1]:1666`), which is required for IPv6 literals but accepted
//! for any host.

use crate::error::AddressError;
use std::fmt;
use std::str::FromStr;

/// Address used when none is configured.
pub const DEFAULT_SERVER_ADDRESS: &str = "perforce:1666";

/// Host used when an address only names a port.
pub const DEFAULT_HOST: &str = "localhost";

/// Recognized transport prefixes. The `ssl` family marks the connection as
/// encrypted.
const PROTOCOLS: &[&str] = &[
    "tcp", "tcp4", "tcp6", "tcp46", "tcp64", "ssl", "ssl4", "ssl6", "ssl46", "ssl64",
];

/// A parsed server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    /// Transport prefix, lowercased, if one was given.
    pub protocol: Option<String>,
    /// Whether the prefix requests an encrypted transport.
    pub encrypted: bool,
    pub host: String,
    pub port: String,
}

impl ServerAddress {
    /// Parses an address string. An empty string yields the default address.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let text = s.trim();
        let text = if text.is_empty() {
            DEFAULT_SERVER_ADDRESS
        } else {
            text
        };

        let (protocol, rest) = match text.split_once(':') {
            Some((prefix, rest)) if PROTOCOLS.contains(&prefix.to_ascii_lowercase().as_str()) => {
                (Some(prefix.to_ascii_lowercase()), rest)
            }
            _ => (None, text),
        };

        let (host, port) = if let Some(inner) = rest.strip_prefix('[') {
            let close = inner
                .find(']')
                .ok_or_else(|| AddressError::UnterminatedBracket(s.to_string()))?;
            let after = &inner[close + 1..];
            let port = match after.strip_prefix(':') {
                Some(port) => port,
                None if after.is_empty() => return Err(AddressError::MissingPort(s.to_string())),
                None => return Err(AddressError::TrailingText(s.to_string())),
            };
            (&inner[..close], port)
        } else {
            rest.rsplit_once(':').unwrap_or(("", rest))
        };

        if port.is_empty() {
            return Err(AddressError::MissingPort(s.to_string()));
        }

        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        let encrypted = protocol.as_deref().is_some_and(|p| p.starts_with("ssl"));

        Ok(Self {
            protocol,
            encrypted,
            host: host.to_string(),
            port: port.to_string(),
        })
    }

    /// Returns `host:port`, bracketing hosts that contain a colon.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self {
            protocol: None,
            encrypted: false,
            host: "perforce".to_string(),
            port: "1666".to_string(),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.protocol {
            Some(protocol) => write!(f, "{}:{}", protocol, self.host_port()),
            None => write!(f, "{}", self.host_port()),
        }
    }
}
