//! Encoders and decoders for protocol frames.
//!
//! [`Decoder`] is a buffered, sans-IO decoder fed with whatever bytes are at
//! hand. [`FrameReader`] and [`write_message`] work directly on async
//! streams and are what connections use.

use crate::error::{FrameError, TransportError, WireError};
use crate::frame::{FrameHeader, FRAME_HEADER_SIZE};
use crate::message::Message;
use crate::DEFAULT_MAX_BODY_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn check_body_size(body_len: u32, max: u32) -> Result<(), FrameError> {
    if body_len > max {
        return Err(FrameError::TooLarge {
            size: body_len as u64,
            max: max as u64,
        });
    }
    Ok(())
}

/// Buffered frame decoder.
pub struct Decoder {
    buffer: BytesMut,
    max_body_size: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max: u32) -> Self {
        self.max_body_size = max;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode_message(&mut self) -> Result<Option<Message>, FrameError> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header: [u8; FRAME_HEADER_SIZE] = [
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ];
        let header = FrameHeader::decode(&header)?;
        check_body_size(header.body_len, self.max_body_size)?;

        let total_len = FRAME_HEADER_SIZE + header.body_len as usize;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_SIZE);
        let body = self.buffer.split_to(header.body_len as usize).freeze();
        Message::decode_body(body).map(Some)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads whole frames from an async stream.
pub struct FrameReader<R> {
    reader: R,
    max_body_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max: u32) -> Self {
        self.max_body_size = max;
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads the next message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before the first
    /// header byte. Ending anywhere inside a frame is a transport error.
    pub async fn read_message(&mut self) -> Result<Option<Message>, WireError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let n = read_full(&mut self.reader, &mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        if n < FRAME_HEADER_SIZE {
            return Err(TransportError::UnexpectedEof {
                stage: "header",
                received: n,
                expected: FRAME_HEADER_SIZE,
            }
            .into());
        }

        let header = FrameHeader::decode(&header)?;
        check_body_size(header.body_len, self.max_body_size)?;

        let body_len = header.body_len as usize;
        let mut body = vec![0u8; body_len];
        let n = read_full(&mut self.reader, &mut body).await?;
        if n < body_len {
            return Err(TransportError::UnexpectedEof {
                stage: "body",
                received: n,
                expected: body_len,
            }
            .into());
        }

        Ok(Some(Message::decode_body(Bytes::from(body))?))
    }
}

/// Fills `buf` from the reader, returning fewer bytes only at end of stream.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encodes a message and writes it as a single buffer.
///
/// Returns the number of bytes written.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<usize, WireError> {
    let frame = message.encode()?;
    writer
        .write_all(&frame)
        .await
        .map_err(TransportError::Io)?;
    writer.flush().await.map_err(TransportError::Io)?;
    Ok(frame.len())
}
