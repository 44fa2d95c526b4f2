//! Error types for the WebSocket protocol engine.

use thiserror::Error;

use super::close::CloseCode;

/// A violation of RFC 6455 framing detected while decoding client bytes.
///
/// Every variant is fatal for the connection that produced it; the event loop
/// maps it to a Close status via [`ProtocolError::close_code`] and tears the
/// connection down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// One of the RSV1..RSV3 bits was set (no extensions are negotiated).
    #[error("RSV bit must be 0")]
    RsvBit,
    /// A control frame declared a payload larger than 125 bytes.
    #[error("control frame length can not be > 125")]
    ControlFrameOverLimit,
    /// The opcode nibble is reserved.
    #[error("unknown opcode 0x{0:x}")]
    UnknownOpcode(u8),
    /// A control frame arrived with FIN cleared.
    #[error("control messages can not be fragmented")]
    FragmentedControlFrame,
    /// Continuation without a started sequence, or a new sequence started
    /// while one was still open.
    #[error("fragmentation protocol error")]
    FragmentProtocol,
    /// A Text message (or fragment) is not valid UTF-8.
    #[error("invalid utf-8 payload")]
    InvalidUtf8Payload,
    /// A header, frame or message exceeded its configured limit.
    #[error("exceeded allowable size: {0}")]
    ExceedSize(&'static str),
}

impl ProtocolError {
    /// Status code reported to the peer in the best-effort Close frame.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUtf8Payload => CloseCode::InvalidPayload,
            Self::ExceedSize(_) => CloseCode::TooBig,
            _ => CloseCode::Protocol,
        }
    }
}

/// Failure to complete the HTTP upgrade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The request line or header block could not be parsed.
    #[error("malformed upgrade request: {0}")]
    InvalidRequest(String),
    /// A header required for the upgrade is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
}
