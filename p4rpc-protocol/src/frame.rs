//! Binary frame format.
//!
//! Frame layout (5 byte header + body):
//!
//! ```text
//! +----------+-----------------+
//! | checksum | body_len (LE)   |
//! | 1 byte   | 4 bytes         |
//! +----------+-----------------+
//! | field | field | ...        |
//! +----------------------------+
//! ```
//!
//! The checksum is the XOR of the four length bytes. It only protects the
//! length; the body carries no checksum at all.
//!
//! Each field is laid out as:
//!
//! ```text
//! +------+------+-----------+-------+------+
//! | name | 0x00 | len (LE)  | value | 0x00 |
//! +------+------+-----------+-------+------+
//! ```
//!
//! A field with an empty name is a positional argument.

use crate::error::FrameError;
use bytes::{BufMut, BytesMut};

/// Size of the frame header in bytes (1 + 4).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Computes the header checksum for the little-endian length bytes.
pub fn checksum(len: [u8; 4]) -> u8 {
    len.iter().fold(0, |acc, b| acc ^ b)
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the body that follows the header.
    pub body_len: u32,
}

impl FrameHeader {
    pub fn new(body_len: u32) -> Self {
        Self { body_len }
    }

    /// Encodes the header into its 5 wire bytes.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let len = self.body_len.to_le_bytes();
        [checksum(len), len[0], len[1], len[2], len[3]]
    }

    /// Decodes and validates a header.
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, FrameError> {
        let len = [bytes[1], bytes[2], bytes[3], bytes[4]];
        let expected = checksum(len);
        if bytes[0] != expected {
            return Err(FrameError::ChecksumMismatch {
                expected,
                actual: bytes[0],
            });
        }
        Ok(Self {
            body_len: u32::from_le_bytes(len),
        })
    }
}

/// Appends one field to a frame body. The name must not contain NUL.
pub fn put_field(buf: &mut BytesMut, name: &[u8], value: &[u8]) -> Result<(), FrameError> {
    if name.contains(&0) {
        return Err(FrameError::MalformedField {
            offset: buf.len(),
            reason: "name contains NUL",
        });
    }
    let len = u32::try_from(value.len()).map_err(|_| FrameError::TooLarge {
        size: value.len() as u64,
        max: u32::MAX as u64,
    })?;
    buf.reserve(name.len() + value.len() + 6);
    buf.put_slice(name);
    buf.put_u8(0);
    buf.put_u32_le(len);
    buf.put_slice(value);
    buf.put_u8(0);
    Ok(())
}

/// Iterates over the `(name, value)` fields of a frame body.
///
/// Yields an error (and then stops) when a field runs past the end of the
/// body.
pub struct Fields<'a> {
    body: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Fields<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            body,
            pos: 0,
            failed: false,
        }
    }

    fn next_field(&mut self) -> Result<(&'a [u8], &'a [u8]), FrameError> {
        let start = self.pos;
        let body: &'a [u8] = self.body;
        let rest = &body[start..];

        let name_len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FrameError::MalformedField {
                offset: start,
                reason: "name is not NUL-terminated",
            })?;
        let name = &rest[..name_len];

        let len_at = name_len + 1;
        let len_bytes: [u8; 4] = rest
            .get(len_at..len_at + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or(FrameError::MalformedField {
                offset: start,
                reason: "value length is truncated",
            })?;
        let value_len = u32::from_le_bytes(len_bytes) as usize;

        let value_at = len_at + 4;
        // The value is followed by a terminator byte, which must exist.
        let end = value_at
            .checked_add(value_len)
            .filter(|&end| end < rest.len())
            .ok_or(FrameError::MalformedField {
                offset: start,
                reason: "value runs past end of body",
            })?;

        self.pos = start + end + 1;
        Ok((name, &rest[value_at..end]))
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.body.len() {
            return None;
        }
        let field = self.next_field();
        self.failed = field.is_err();
        Some(field)
    }
}
