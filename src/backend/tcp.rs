//! Raw TCP backend: client payload bytes go upstream verbatim and upstream
//! bytes come back as Binary messages.
//!
//! Bytes sent before the connect completes wait in the pending buffer.

use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use mio::event::Source;
use mio::{Interest, Registry, Token};

use super::{connect_finished, connect_nonblocking, BackendLink, Received, SendStatus};
use crate::constants::READ_CHUNK;
use crate::protocol::Message;

/// Non-blocking TCP upstream.
#[derive(Debug)]
pub struct TcpBackend {
    addr: String,
    stream: mio::net::TcpStream,
    connected: bool,
    pending: Vec<u8>,
    closed: bool,
}

impl TcpBackend {
    /// Start connecting to `host:port`. Returns before the upstream
    /// answers.
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = connect_nonblocking(addr)?;
        Ok(Self {
            addr: addr.to_string(),
            stream,
            connected: false,
            pending: Vec::new(),
            closed: false,
        })
    }

    /// Advance the connect. A failed connect closes the link.
    fn ready(&mut self) -> Result<bool> {
        if !self.connected {
            match connect_finished(&self.stream) {
                Ok(true) => {
                    self.connected = true;
                    log::info!("[Backend] TCP link established to {}", self.addr);
                }
                Ok(false) => {}
                Err(e) => {
                    self.closed = true;
                    return Err(e.context(format!("TCP backend {}", self.addr)));
                }
            }
        }
        Ok(self.connected)
    }

    /// Write as much of `pending` as the socket accepts.
    fn drain_pending(&mut self) -> Result<SendStatus> {
        if !self.ready()? {
            return Ok(SendStatus::WouldBlock);
        }
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => anyhow::bail!("backend socket accepted zero bytes"),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendStatus::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("backend write failed"),
            }
        }
        Ok(SendStatus::Sent)
    }
}

impl BackendLink for TcpBackend {
    fn is_connecting(&self) -> bool {
        !self.connected && !self.closed
    }

    fn receive(&mut self) -> Result<Received> {
        if self.closed {
            return Ok(Received::Closed);
        }
        if !self.ready()? {
            return Ok(Received::Pending);
        }
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(Received::Closed),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Received::Data(Message::Binary(buf)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Received::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("backend read failed"),
            }
        }
    }

    fn send(&mut self, message: &Message) -> Result<SendStatus> {
        if self.closed {
            anyhow::bail!("backend link is closed");
        }
        self.pending.extend_from_slice(message.as_bytes());
        self.drain_pending()
    }

    fn flush(&mut self) -> Result<SendStatus> {
        if self.closed {
            anyhow::bail!("backend link is closed");
        }
        self.drain_pending()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Source for TcpBackend {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}
