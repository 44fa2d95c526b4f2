//! Close handshake payloads (RFC 6455 Section 7).
//!
//! An incoming Close frame is never rejected: anything the peer sends is
//! normalized into a [`CloseFrame`] whose status is either one of the codes
//! this proxy accepts or `1002` (protocol error). The normalized frame is
//! what gets echoed back.

/// Status codes this proxy recognizes in a Close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1001: endpoint going away.
    GoingAway,
    /// 1002: protocol error.
    Protocol,
    /// 1003: unsupported data.
    Unsupported,
    /// 1007: payload inconsistent with the message type (bad UTF-8).
    InvalidPayload,
    /// 1008: policy violation.
    Policy,
    /// 1009: message too big.
    TooBig,
    /// 1010: client expected an extension.
    MandatoryExtension,
    /// 1011: unexpected server condition.
    InternalError,
    /// Accepted application codes: 3000, 3999, 4000, 4999.
    Application(u16),
}

/// Application-range codes accepted verbatim.
const APPLICATION_CODES: [u16; 4] = [3000, 3999, 4000, 4999];

impl CloseCode {
    /// Normalize a raw status, mapping anything outside the accepted set to
    /// [`CloseCode::Protocol`].
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1007 => Self::InvalidPayload,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            code if APPLICATION_CODES.contains(&code) => Self::Application(code),
            _ => Self::Protocol,
        }
    }

    /// Wire value of this code.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::Protocol => 1002,
            Self::Unsupported => 1003,
            Self::InvalidPayload => 1007,
            Self::Policy => 1008,
            Self::TooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::Application(code) => code,
        }
    }

    /// Generic reason text for a Close frame the proxy originates.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal | Self::Application(_) => "",
            Self::GoingAway => "going away",
            Self::Protocol => "protocol error",
            Self::Unsupported => "unsupported data",
            Self::InvalidPayload => "invalid payload data",
            Self::Policy => "policy violation",
            Self::TooBig => "message too big",
            Self::MandatoryExtension => "extension required",
            Self::InternalError => "internal error",
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

/// A parsed (and normalized) Close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code.
    pub code: CloseCode,
    /// UTF-8 reason text, possibly empty.
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame with the given code and reason.
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parse an incoming Close payload.
    ///
    /// - empty: 1000, no reason
    /// - one byte: 1002
    /// - two or more: big-endian status, then an optional UTF-8 reason;
    ///   an unknown status or a reason that is not UTF-8 yields 1002
    #[must_use]
    pub fn parse(payload: &[u8]) -> Self {
        match payload {
            [] => Self::new(CloseCode::Normal, ""),
            [_] => Self::new(CloseCode::Protocol, ""),
            [hi, lo, rest @ ..] => {
                let mut code = CloseCode::from_status(u16::from_be_bytes([*hi, *lo]));
                let reason = match std::str::from_utf8(rest) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        code = CloseCode::Protocol;
                        String::new()
                    }
                };
                Self { code, reason }
            }
        }
    }

    /// Serialize into a Close payload: status followed by the reason bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&self.code.as_u16().to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        payload
    }
}
