//! HTTP/1.1 upgrade request parsing and the server's 101 response.
//!
//! The request head is parsed with `httparse`. Header values that are not
//! valid UTF-8 (obs-text) are kept, decoded lossily. Query parameters are
//! percent-decoded once at parse time.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use url::form_urlencoded;

use super::error::HandshakeError;
use crate::constants::{MAX_REQUEST_HEADERS, WS_GUID};

/// Header block terminator.
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed upgrade request: request line plus lowercase-keyed headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method (`GET`).
    pub method: String,
    /// Request target including any query string.
    pub path: String,
    /// HTTP version token (`HTTP/1.1`).
    pub version: String,
    headers: HashMap<String, String>,
    query: Vec<(String, String)>,
}

impl HttpRequest {
    /// Parse a complete header block, terminator included.
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
        let mut request = httparse::Request::new(&mut slots);
        match request.parse(raw) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HandshakeError::InvalidRequest("incomplete request".into()));
            }
            Err(e) => return Err(HandshakeError::InvalidRequest(e.to_string())),
        }

        let (Some(method), Some(path), Some(minor)) =
            (request.method, request.path, request.version)
        else {
            return Err(HandshakeError::InvalidRequest("incomplete request line".into()));
        };

        let headers: HashMap<String, String> = request
            .headers
            .iter()
            .map(|header| {
                (
                    header.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(header.value).trim().to_string(),
                )
            })
            .collect();
        let query: Vec<(String, String)> = path
            .split_once('?')
            .map(|(_, query)| {
                form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: format!("HTTP/1.{minor}"),
            headers,
            query,
        })
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Decoded value of the first query-string parameter called `name`.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The `Sec-WebSocket-Key` header, required for the upgrade.
    pub fn websocket_key(&self) -> Result<&str, HandshakeError> {
        self.header("sec-websocket-key")
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
    }
}

/// `base64(sha1(key + GUID))`.
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The literal 101 response sent on a successful upgrade.
#[must_use]
pub fn response_bytes(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
    .into_bytes()
}

/// Offset just past the `\r\n\r\n` terminator, if present.
#[must_use]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len())
        .position(|window| window == TERMINATOR)
        .map(|pos| pos + TERMINATOR.len())
}

/// Parse a complete header block and build the upgrade response.
pub fn accept(raw: &[u8]) -> Result<(HttpRequest, Vec<u8>), HandshakeError> {
    let request = HttpRequest::parse(raw)?;
    let key = request.websocket_key()?;
    let response = response_bytes(&compute_accept_key(key));
    Ok((request, response))
}
