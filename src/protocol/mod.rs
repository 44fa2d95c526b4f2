//! RFC 6455 protocol engine.
//!
//! Pure codec: nothing in this module performs I/O. The proxy feeds raw
//! client bytes into a [`FrameDecoder`] and writes whatever [`encode_frame`]
//! produces.
//!
//! - [`frame`]: opcodes, messages and the server-side encoder
//! - [`decoder`]: byte-driven frame decoder with fragment reassembly
//! - [`close`]: close status normalization
//! - [`handshake`]: HTTP upgrade parsing and the 101 response
//! - [`error`]: protocol and handshake errors

pub mod close;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod handshake;

pub use close::{CloseCode, CloseFrame};
pub use decoder::{DecoderState, Event, FrameDecoder, Utf8Stream};
pub use error::{HandshakeError, ProtocolError};
pub use frame::{encode_frame, encode_masked_frame, Frame, Message, Opcode};
pub use handshake::{compute_accept_key, HttpRequest};
