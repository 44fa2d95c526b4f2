//! Frame-level types and the server-side encoder.
//!
//! Wire layout (RFC 6455 Section 5.2):
//!
//! ```text
//! byte 0: [FIN][RSV1][RSV2][RSV3][opcode:4]
//! byte 1: [MASK][len7:7]
//! len7 == 126: [u16 BE length]
//! len7 == 127: [u64 BE length]
//! MASK set:    [mask key: 4 bytes]
//! payload
//! ```
//!
//! Frames written by the server are never masked.

use super::error::ProtocolError;

/// FIN bit in the first header byte.
pub const FIN_BIT: u8 = 0x80;
/// RSV1..RSV3 bits in the first header byte.
pub const RSV_BITS: u8 = 0x70;
/// Opcode nibble in the first header byte.
pub const OPCODE_MASK: u8 = 0x0F;
/// MASK bit in the second header byte.
pub const MASK_BIT: u8 = 0x80;
/// 7-bit length field in the second header byte.
pub const LEN7_MASK: u8 = 0x7F;
/// `len7` marker for a 16-bit extended length.
pub const LEN16_MARKER: u8 = 126;
/// `len7` marker for a 64-bit extended length.
pub const LEN64_MARKER: u8 = 127;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// 0x0: continuation of a fragmented message.
    Continuation,
    /// 0x1: UTF-8 text.
    Text,
    /// 0x2: binary data.
    Binary,
    /// 0x8: close handshake.
    Close,
    /// 0x9: ping.
    Ping,
    /// 0xA: pong.
    Pong,
}

impl Opcode {
    /// Wire nibble for this opcode.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Whether this is a control opcode (Close, Ping, Pong).
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// A single decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of its message.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Mask key, present on client-to-server frames.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
}

/// An application-level message, possibly reassembled from fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
}

impl Message {
    /// Data opcode used to send this message.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Text(_) => Opcode::Text,
            Self::Binary(_) => Opcode::Binary,
        }
    }

    /// Payload bytes of this message.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Consume the message, returning its payload bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(data) => data,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

/// Number of header bytes (without mask) needed for a payload of `len` bytes.
#[must_use]
pub fn header_len(len: usize) -> usize {
    match len {
        0..=125 => 2,
        126..=65535 => 4,
        _ => 10,
    }
}

/// Write the two header bytes and any extended length.
fn push_header(buf: &mut Vec<u8>, fin: bool, opcode: Opcode, mask_bit: u8, len: usize) {
    let mut b1 = opcode.as_u8();
    if fin {
        b1 |= FIN_BIT;
    }
    buf.push(b1);

    if len <= 125 {
        buf.push(mask_bit | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        buf.push(mask_bit | LEN16_MARKER);
        buf.extend_from_slice(&short.to_be_bytes());
    } else {
        buf.push(mask_bit | LEN64_MARKER);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Encode one unmasked server frame.
///
/// `fin` marks the final frame of a message and sets [`FIN_BIT`]; fragments
/// that will be followed by more data leave it clear.
#[must_use]
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(payload.len()) + payload.len());
    push_header(&mut buf, fin, opcode, 0, payload.len());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a masked client frame.
///
/// The server never sends these; they model what a browser puts on the wire
/// and are used to drive the decoder in tests and tooling.
#[must_use]
pub fn encode_masked_frame(fin: bool, opcode: Opcode, mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(payload.len()) + 4 + payload.len());
    push_header(&mut buf, fin, opcode, MASK_BIT, payload.len());
    buf.extend_from_slice(&mask);
    buf.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    buf
}
