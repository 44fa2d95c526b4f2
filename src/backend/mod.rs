//! Upstream links the proxy relays client traffic to.
//!
//! A [`BackendLink`] is a non-blocking, pollable connection to the real
//! target (typically a container attach stream). The proxy registers it with
//! its readiness loop under a token derived from the owning connection and
//! drives it through the narrow `receive / send / flush / close` contract.
//!
//! Links connect without blocking. A fresh link reports
//! [`BackendLink::is_connecting`] until its transport is up; the proxy keeps
//! flushing it on writable events and receiving on readable ones, and both
//! calls advance the connect. Data sent meanwhile is buffered and reported
//! as [`SendStatus::WouldBlock`].
//!
//! [`DefaultConnector`] picks a transport from the target URL scheme:
//!
//! - `ws://host:port/path`: WebSocket via `tungstenite` ([`WsBackend`])
//! - `tcp://host:port`: raw byte stream ([`TcpBackend`])

// Rust guideline compliant 2026-02

use std::fmt;
use std::io;
use std::net::ToSocketAddrs;

use anyhow::{bail, Context, Result};

use crate::protocol::Message;

pub mod tcp;
pub mod websocket;

pub use tcp::TcpBackend;
pub use websocket::WsBackend;

/// Outcome of handing data to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything reached the socket.
    Sent,
    /// Data is buffered by the link; call [`BackendLink::flush`] once the
    /// link's source reports writable.
    WouldBlock,
}

/// Outcome of a single receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One unit of upstream data.
    Data(Message),
    /// Nothing available right now.
    Pending,
    /// The upstream ended the stream.
    Closed,
}

/// A pollable upstream connection.
///
/// Implementations must never block: every method returns immediately,
/// reporting [`Received::Pending`] or [`SendStatus::WouldBlock`] when the
/// socket is not ready.
pub trait BackendLink: mio::event::Source + fmt::Debug {
    /// Whether data can be received without waiting for socket readiness
    /// (e.g. it is already buffered inside the link).
    fn is_readable(&self) -> bool {
        false
    }

    /// Whether the upstream connection is still being established.
    fn is_connecting(&self) -> bool {
        false
    }

    /// Receive at most one unit of upstream data.
    fn receive(&mut self) -> Result<Received>;

    /// Send one client message upstream.
    fn send(&mut self, message: &Message) -> Result<SendStatus>;

    /// Push out data buffered by an earlier [`SendStatus::WouldBlock`].
    fn flush(&mut self) -> Result<SendStatus>;

    /// Close the upstream connection. Must be idempotent.
    fn close(&mut self);
}

/// Establishes backend links for resolved targets.
pub trait BackendConnector {
    /// Start connecting to `target`, returning a link ready to be
    /// registered. Must not wait for the upstream to answer.
    fn connect(&self, target: &str) -> Result<Box<dyn BackendLink>>;
}

impl<F> BackendConnector for F
where
    F: Fn(&str) -> Result<Box<dyn BackendLink>>,
{
    fn connect(&self, target: &str) -> Result<Box<dyn BackendLink>> {
        self(target)
    }
}

/// Scheme-dispatching connector for `ws://` and `tcp://` targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl BackendConnector for DefaultConnector {
    fn connect(&self, target: &str) -> Result<Box<dyn BackendLink>> {
        log::info!("[Backend] Connecting to {target}");
        if target.starts_with("ws://") {
            Ok(Box::new(WsBackend::connect(target)?))
        } else if let Some(addr) = target.strip_prefix("tcp://") {
            Ok(Box::new(TcpBackend::connect(addr)?))
        } else if target.starts_with("wss://") {
            bail!("TLS backends are not supported: {target}")
        } else {
            bail!("unsupported backend scheme: {target}")
        }
    }
}

/// Resolve `host:port` and start a non-blocking connect to the first
/// address.
pub(crate) fn connect_nonblocking(addr: &str) -> Result<mio::net::TcpStream> {
    let resolved = addr
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve backend address: {addr}"))?
        .next()
        .with_context(|| format!("backend address resolved to nothing: {addr}"))?;
    let stream = mio::net::TcpStream::connect(resolved)
        .with_context(|| format!("failed to connect to backend {addr}"))?;
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("[Backend] set_nodelay failed for {addr}: {e}");
    }
    Ok(stream)
}

/// Whether a connect started by [`connect_nonblocking`] has completed.
/// `Ok(false)` while it is still in flight.
pub(crate) fn connect_finished(stream: &mio::net::TcpStream) -> Result<bool> {
    if let Some(e) = stream.take_error().context("failed to query backend socket")? {
        return Err(e).context("failed to connect to backend");
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e).context("failed to connect to backend"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connector_rejects_unknown_scheme() {
        let connector = DefaultConnector;
        let err = connector.connect("http://localhost:1").unwrap_err();
        assert!(err.to_string().contains("unsupported backend scheme"));
    }

    #[test]
    fn test_default_connector_rejects_tls() {
        let connector = DefaultConnector;
        let err = connector.connect("wss://localhost:1/attach").unwrap_err();
        assert!(err.to_string().contains("TLS"));
    }

    #[test]
    fn test_tcp_connect_refused_is_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let outcome = DefaultConnector
            .connect(&format!("tcp://127.0.0.1:{port}"))
            .and_then(|mut link| {
                for _ in 0..200 {
                    link.flush()?;
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Ok(())
            });
        assert!(outcome.is_err());
    }

    #[test]
    fn test_closure_connector() {
        let connector = |target: &str| -> Result<Box<dyn BackendLink>> {
            bail!("no backend for {target}")
        };
        let err = connector.connect("token-1").unwrap_err();
        assert_eq!(err.to_string(), "no backend for token-1");
    }
}
