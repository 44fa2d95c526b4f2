//! WebSocket backend on top of `tungstenite`.
//!
//! The link moves through three phases without ever blocking the proxy:
//! a non-blocking TCP connect, the client handshake driven by
//! `tungstenite`'s [`MidHandshake`] each time the socket becomes ready, and
//! the open socket. `tungstenite` surfaces would-block as `Error::Io`, which
//! maps onto [`Received::Pending`] and [`SendStatus::WouldBlock`].
//!
//! Messages sent before the handshake finishes are held in a queue and
//! written once the socket is open.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use anyhow::{anyhow, bail, Context, Result};
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::{ClientHandshake, Request};
use tungstenite::handshake::MidHandshake;
use tungstenite::protocol::WebSocket;
use tungstenite::HandshakeError;

use super::{connect_finished, connect_nonblocking, BackendLink, Received, SendStatus};
use crate::protocol::Message;

enum Phase {
    Connecting(TcpStream, Box<Request>),
    Handshaking(Box<MidHandshake<ClientHandshake<TcpStream>>>),
    Open(Box<WebSocket<TcpStream>>),
    Failed,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Connecting(..) => "connecting",
            Self::Handshaking(_) => "handshaking",
            Self::Open(_) => "open",
            Self::Failed => "failed",
        }
    }
}

/// Upstream WebSocket connection (e.g. a container attach endpoint).
pub struct WsBackend {
    url: String,
    phase: Phase,
    queued: VecDeque<tungstenite::Message>,
    closed: bool,
}

impl fmt::Debug for WsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsBackend")
            .field("url", &self.url)
            .field("phase", &self.phase.name())
            .field("queued", &self.queued.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl WsBackend {
    /// Start connecting to a `ws://` URL. The handshake completes later, as
    /// the proxy drives the link.
    pub fn connect(url: &str) -> Result<Self> {
        let request = url
            .into_client_request()
            .with_context(|| format!("invalid WebSocket URL: {url}"))?;
        let host = request
            .uri()
            .host()
            .with_context(|| format!("WebSocket URL has no host: {url}"))?
            .to_string();
        let port = request.uri().port_u16().unwrap_or(80);

        let stream = connect_nonblocking(&format!("{host}:{port}"))?;
        Ok(Self {
            url: url.to_string(),
            phase: Phase::Connecting(stream, Box::new(request)),
            queued: VecDeque::new(),
            closed: false,
        })
    }

    /// Move the connect and handshake forward as far as the socket allows.
    /// Returns whether the socket is open.
    fn advance(&mut self) -> Result<bool> {
        loop {
            let next = match std::mem::replace(&mut self.phase, Phase::Failed) {
                Phase::Open(socket) => {
                    self.phase = Phase::Open(socket);
                    return Ok(true);
                }
                Phase::Failed => bail!("WebSocket backend {} failed", self.url),
                Phase::Connecting(stream, request) => {
                    if !connect_finished(&stream)
                        .with_context(|| format!("WebSocket backend {}", self.url))?
                    {
                        self.phase = Phase::Connecting(stream, request);
                        return Ok(false);
                    }
                    tungstenite::client(*request, stream)
                }
                Phase::Handshaking(mid) => (*mid).handshake(),
            };

            match next {
                Ok((socket, response)) => {
                    log::info!(
                        "[Backend] WebSocket link established to {} ({})",
                        self.url,
                        response.status()
                    );
                    self.phase = Phase::Open(Box::new(socket));
                }
                Err(HandshakeError::Interrupted(mid)) => {
                    self.phase = Phase::Handshaking(Box::new(mid));
                    return Ok(false);
                }
                Err(HandshakeError::Failure(e)) => {
                    bail!("WebSocket handshake with {} failed: {e}", self.url)
                }
            }
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.phase {
            Phase::Connecting(stream, _) => Ok(stream),
            Phase::Handshaking(mid) => Ok(mid.get_mut().get_mut()),
            Phase::Open(socket) => Ok(socket.get_mut()),
            Phase::Failed => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn map_send(result: tungstenite::Result<()>) -> Result<SendStatus> {
        match result {
            Ok(()) => Ok(SendStatus::Sent),
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(SendStatus::WouldBlock)
            }
            Err(e) => Err(anyhow!("WebSocket send failed: {e}")),
        }
    }
}

impl BackendLink for WsBackend {
    fn is_connecting(&self) -> bool {
        !self.closed && matches!(self.phase, Phase::Connecting(..) | Phase::Handshaking(_))
    }

    fn receive(&mut self) -> Result<Received> {
        if self.closed {
            return Ok(Received::Closed);
        }
        if !self.advance()? {
            return Ok(Received::Pending);
        }
        let Phase::Open(socket) = &mut self.phase else {
            return Ok(Received::Pending);
        };
        loop {
            match socket.read() {
                Ok(tungstenite::Message::Text(text)) => {
                    return Ok(Received::Data(Message::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    return Ok(Received::Data(Message::Binary(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    log::info!("[Backend] Upstream sent close: {frame:?}");
                    self.closed = true;
                    return Ok(Received::Closed);
                }
                // Pongs for upstream pings are queued by tungstenite itself.
                Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                ) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Received::Pending);
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.closed = true;
                    return Ok(Received::Closed);
                }
                Err(e) => return Err(anyhow!("WebSocket read error: {e}")),
            }
        }
    }

    fn send(&mut self, message: &Message) -> Result<SendStatus> {
        if self.closed {
            bail!("backend link is closed");
        }
        self.queued.push_back(match message {
            Message::Text(text) => tungstenite::Message::Text(text.clone()),
            Message::Binary(data) => tungstenite::Message::Binary(data.clone()),
        });
        self.flush()
    }

    fn flush(&mut self) -> Result<SendStatus> {
        if self.closed {
            bail!("backend link is closed");
        }
        if !self.advance()? {
            return Ok(SendStatus::WouldBlock);
        }
        let Phase::Open(socket) = &mut self.phase else {
            return Ok(SendStatus::WouldBlock);
        };
        // A would-block write still leaves the frame in tungstenite's buffer.
        while let Some(message) = self.queued.pop_front() {
            if Self::map_send(socket.write(message))? == SendStatus::WouldBlock {
                return Ok(SendStatus::WouldBlock);
            }
        }
        Self::map_send(socket.flush())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.queued.clear();
        if let Phase::Open(socket) = &mut self.phase {
            if let Err(e) = socket.close(None) {
                log::debug!("[Backend] Close frame not sent: {e}");
            }
            let _ = socket.flush();
        }
    }
}

impl Source for WsBackend {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream_mut()?.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream_mut()?.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self.stream_mut() {
            Ok(stream) => stream.deregister(registry),
            // The socket was dropped with the failed phase; the kernel
            // already forgot the registration.
            Err(_) => Ok(()),
        }
    }
}
