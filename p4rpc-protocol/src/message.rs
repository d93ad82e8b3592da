//! Protocol messages: positional arguments plus named symbols.

use crate::error::FrameError;
use crate::frame::{put_field, Fields, FrameHeader, FRAME_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use std::fmt;

/// Named fields of a message, kept in insertion order so that a decoded
/// frame re-encodes to the same bytes.
pub type Symbols = IndexMap<Bytes, Bytes>;

/// Symbol naming the function a message invokes.
pub const FUNC: &str = "func";

/// One protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Positional arguments in wire order.
    pub args: Vec<Bytes>,
    /// Named symbols in insertion order.
    pub symbols: Symbols,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message whose `func` symbol is set.
    pub fn function(func: impl Into<Bytes>) -> Self {
        Self::new().with_symbol(FUNC, func)
    }

    pub fn with_arg(mut self, value: impl Into<Bytes>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_symbol(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a symbol. An existing symbol keeps its position.
    pub fn set(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Option<Bytes> {
        self.symbols.insert(name.into(), value.into())
    }

    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<&Bytes> {
        self.symbols.get(name.as_ref())
    }

    /// Returns a symbol as UTF-8, if present and valid.
    pub fn get_str(&self, name: impl AsRef<[u8]>) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: impl AsRef<[u8]>) -> bool {
        self.symbols.contains_key(name.as_ref())
    }

    /// Returns the `func` symbol.
    pub fn func(&self) -> Option<&Bytes> {
        self.get(FUNC)
    }

    /// Iterates `{prefix}0`, `{prefix}1`, ... stopping at the first missing index.
    pub fn indexed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Bytes> + 'a {
        (0..).map_while(move |i| self.get(format!("{}{}", prefix, i)))
    }

    /// Encodes the body: positional arguments, then symbols.
    pub fn encode_body(&self) -> Result<BytesMut, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        for value in &self.args {
            put_field(&mut buf, b"", value)?;
        }
        for (name, value) in &self.symbols {
            // An empty name would decode as a positional argument
            if name.is_empty() {
                return Err(FrameError::MalformedField {
                    offset: buf.len(),
                    reason: "symbol name is empty",
                });
            }
            put_field(&mut buf, name, value)?;
        }
        Ok(buf)
    }

    /// Encodes the complete frame (header followed by body).
    pub fn encode(&self) -> Result<BytesMut, FrameError> {
        let body = self.encode_body()?;
        let body_len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
            size: body.len() as u64,
            max: u32::MAX as u64,
        })?;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        buf.put_slice(&FrameHeader::new(body_len).encode());
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Decodes a frame body.
    pub fn decode_body(body: Bytes) -> Result<Self, FrameError> {
        let mut message = Message::new();
        for field in Fields::new(&body) {
            let (name, value) = field?;
            let value = body.slice_ref(value);
            if name.is_empty() {
                message.args.push(value);
            } else {
                message.symbols.insert(body.slice_ref(name), value);
            }
        }
        Ok(message)
    }

    fn encoded_len_hint(&self) -> usize {
        let args: usize = self.args.iter().map(|v| v.len() + 6).sum();
        let symbols: usize = self
            .symbols
            .iter()
            .map(|(k, v)| k.len() + v.len() + 6)
            .sum();
        args + symbols
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", arg.escape_ascii().to_string())?;
        }
        write!(f, "] {{")?;
        for (i, (name, value)) in self.symbols.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", name.escape_ascii(), value.escape_ascii().to_string())?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let msg = Message::function("flush2").with_arg("a");
        let encoded = msg.encode().unwrap();

        let body = b"\0\x01\0\0\0a\0func\0\x06\0\0\0flush2\0";
        assert_eq!(encoded[0], crate::frame::checksum((body.len() as u32).to_le_bytes()));
        assert_eq!(&encoded[1..5], &(body.len() as u32).to_le_bytes());
        assert_eq!(&encoded[5..], &body[..]);
    }

    #[test]
    fn test_args_precede_symbols_on_the_wire() {
        let mut msg = Message::new().with_symbol("x", "1");
        msg.args.push(Bytes::from_static(b"late"));
        let body = msg.encode_body().unwrap();
        assert!(body.starts_with(b"\0\x04\0\0\0late\0"));
    }

    #[test]
    fn test_decode_later_symbol_overwrites_in_place() {
        let mut body = BytesMut::new();
        put_field(&mut body, b"a", b"1").unwrap();
        put_field(&mut body, b"b", b"2").unwrap();
        put_field(&mut body, b"a", b"3").unwrap();

        let msg = Message::decode_body(body.freeze()).unwrap();
        let keys: Vec<_> = msg.symbols.keys().cloned().collect();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b")]);
        assert_eq!(msg.get("a").unwrap(), "3");
    }

    #[test]
    fn test_encode_rejects_empty_symbol_name() {
        let msg = Message::new().with_arg("a").with_symbol("", "v");
        assert!(matches!(
            msg.encode(),
            Err(FrameError::MalformedField {
                offset: 7,
                reason: "symbol name is empty"
            })
        ));
    }

    #[test]
    fn test_encode_rejects_nul_in_symbol_name() {
        let msg = Message::function("user-info").with_symbol("a\0func", "x");
        assert!(matches!(
            msg.encode_body(),
            Err(FrameError::MalformedField {
                reason: "name contains NUL",
                ..
            })
        ));
    }

    #[test]
    fn test_set_keeps_position() {
        let mut msg = Message::function("user-info").with_symbol("client", "ws");
        msg.set(FUNC, "flush2");
        let keys: Vec<_> = msg.symbols.keys().cloned().collect();
        assert_eq!(keys, vec![Bytes::from("func"), Bytes::from("client")]);
        assert_eq!(msg.func().unwrap(), "flush2");
    }

    #[test]
    fn test_indexed_stops_at_first_gap() {
        let msg = Message::new()
            .with_symbol("code0", "a")
            .with_symbol("code1", "b")
            .with_symbol("code3", "d");
        let values: Vec<_> = msg.indexed("code").cloned().collect();
        assert_eq!(values, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[test]
    fn test_get_str() {
        let msg = Message::new()
            .with_symbol("ok", "text")
            .with_symbol("bin", vec![0xffu8, 0xfe]);
        assert_eq!(msg.get_str("ok"), Some("text"));
        assert_eq!(msg.get_str("bin"), None);
        assert_eq!(msg.get_str("missing"), None);
    }

    #[test]
    fn test_display() {
        let msg = Message::function("protocol").with_arg("x\0y");
        assert_eq!(msg.to_string(), r#"["x\\x00y"] {func="protocol"}"#);
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        let arg = prop::collection::vec(any::<u8>(), 0..32);
        let name = prop::collection::vec(1u8..=255, 1..12);
        let value = prop::collection::vec(any::<u8>(), 0..32);
        (
            prop::collection::vec(arg, 0..6),
            prop::collection::vec((name, value), 0..8),
        )
            .prop_map(|(args, symbols)| {
                let mut msg = Message::new();
                msg.args = args.into_iter().map(Bytes::from).collect();
                for (name, value) in symbols {
                    msg.set(name, value);
                }
                msg
            })
    }

    proptest! {
        #[test]
        fn prop_decode_reproduces_encoded_message(msg in arb_message()) {
            let mut encoded = msg.encode().unwrap();
            let header: [u8; FRAME_HEADER_SIZE] = encoded[..FRAME_HEADER_SIZE].try_into().unwrap();
            let header = FrameHeader::decode(&header).unwrap();
            let body = encoded.split_off(FRAME_HEADER_SIZE).freeze();
            prop_assert_eq!(header.body_len as usize, body.len());

            let decoded = Message::decode_body(body).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn prop_names_with_nul_never_encode(
            msg in arb_message(),
            prefix in prop::collection::vec(any::<u8>(), 0..6),
            suffix in prop::collection::vec(any::<u8>(), 0..6),
        ) {
            let mut name = prefix;
            name.push(0);
            name.extend(suffix);

            let mut msg = msg;
            msg.set(name, "x");
            let is_malformed = matches!(msg.encode(), Err(FrameError::MalformedField { .. }));
            prop_assert!(is_malformed);
        }
    }
}
