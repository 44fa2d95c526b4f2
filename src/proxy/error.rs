//! Per-connection failure taxonomy.

use std::io;

use thiserror::Error;

use crate::protocol::{CloseCode, HandshakeError, ProtocolError};

/// Why a client connection is being torn down.
///
/// Every variant is local to one connection; none of them stops the loop.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The client violated RFC 6455 framing.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The HTTP upgrade could not be completed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The client closed its end of the socket.
    #[error("remote socket closed")]
    RemoteSocketClose,
    /// Socket read or write failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// A [`Handler`](super::Handler) callback returned an error.
    #[error("handler error: {0:#}")]
    Handler(anyhow::Error),
}

impl ConnectionError {
    /// Close status to send before tearing down, if the peer should get one.
    ///
    /// Only protocol and handler failures on an upgraded connection are
    /// reported; a peer that is gone or never upgraded gets nothing.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Protocol(e) => Some(e.close_code()),
            Self::Handler(_) => Some(CloseCode::InternalError),
            Self::Handshake(_) | Self::RemoteSocketClose | Self::Io(_) => None,
        }
    }
}
