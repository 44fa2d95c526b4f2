//! Single-threaded readiness loop multiplexing clients and their backends.
//!
//! One [`ProxyServer`] owns the listener, every [`Connection`] and every
//! backend link. Each iteration of [`ProxyServer::run_once`] performs one
//! bounded `mio` poll and then works in three phases:
//!
//! 1. **writable**: drain client outbound queues and flush backends
//! 2. **readable**: accept one client, read one chunk per client, receive
//!    one message per backend
//! 3. **errored**: tear down sockets that reported errors
//!
//! Backend links connect without blocking; a link still connecting when its
//! deadline passes is dropped and the client closed with 1011.
//!
//! A client is not read while its backend holds data it could not write, so
//! a slow upstream pushes back on the browser through TCP.
//!
//! `mio` is edge-triggered, so each socket keeps "readable"/"writable"
//! flags that stay set until an operation returns `WouldBlock`. While any
//! flagged work remains the poll timeout is zero.
//!
//! # Tokens
//!
//! ```text
//! Token(0)            listener
//! Token(id << 1)      client socket of connection `id`
//! Token(id << 1 | 1)  backend link of connection `id`
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use super::connection::{Connection, ConnectionId, Drain, Inbound};
use super::error::ConnectionError;
use super::handler::{Context, Handler};
use crate::backend::{Received, SendStatus};
use crate::config::Config;
use crate::constants::{EVENTS_CAPACITY, LISTEN_BACKLOG, READ_CHUNK};
use crate::protocol::CloseCode;

/// Token of the listening socket.
pub const LISTENER: Token = Token(0);

fn client_token(id: ConnectionId) -> Token {
    Token((id as usize) << 1)
}

fn backend_token(id: ConnectionId) -> Token {
    Token(((id as usize) << 1) | 1)
}

/// Owning connection id and whether the token is the backend side.
fn token_owner(token: Token) -> (ConnectionId, bool) {
    ((token.0 >> 1) as ConnectionId, token.0 & 1 == 1)
}

/// Bind a non-blocking listener with `SO_REUSEADDR` and a small backlog.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Close and deregister a connection's backend link, if it has one.
fn detach_backend(registry: &Registry, conn: &mut Connection) {
    if let Some(mut backend) = conn.take_backend() {
        backend.close();
        if let Err(e) = registry.deregister(&mut *backend) {
            log::debug!("[Conn {}] Backend deregister failed: {e}", conn.id());
        }
    }
}

/// WebSocket console proxy: listener, connection registry and event loop.
pub struct ProxyServer<H> {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    listener_ready: bool,
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
    handler: H,
    poll_interval: Duration,
    connect_timeout: Duration,
    max_header_bytes: usize,
    max_payload_bytes: usize,
    read_buf: Vec<u8>,
}

impl<H> fmt::Debug for ProxyServer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .field("listening", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

impl<H: Handler> ProxyServer<H> {
    /// Bind the listener described by `config`.
    pub fn bind(config: &Config, handler: H) -> Result<Self> {
        let listen = config.listen_addr();
        let addr = listen
            .to_socket_addrs()
            .with_context(|| format!("Invalid listen address: {listen}"))?
            .next()
            .with_context(|| format!("Listen address resolved to nothing: {listen}"))?;

        let std_listener =
            bind_listener(addr).with_context(|| format!("Failed to bind listener on {addr}"))?;
        let mut listener = TcpListener::from_std(std_listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new().context("Failed to create poll instance")?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("Failed to register listener")?;

        log::info!("[Proxy] Listening on {local_addr}");

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: Some(listener),
            local_addr,
            listener_ready: true,
            connections: HashMap::new(),
            next_id: 1,
            handler,
            poll_interval: config.poll_interval(),
            connect_timeout: config.backend_connect_timeout(),
            max_header_bytes: config.max_header_bytes,
            max_payload_bytes: config.max_payload_bytes,
            read_buf: vec![0u8; READ_CHUNK],
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Look up a live connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// The application handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The application handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Run until `shutdown` is set or the listener fails, then close
    /// every connection.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("[Proxy] Shutdown requested");
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                log::error!("[Proxy] Fatal: {e:#}");
                break Err(e);
            }
        };
        self.close();
        result
    }

    /// One poll plus the writable, readable and errored phases.
    ///
    /// An error means the listener failed; the caller should [`close`]
    /// the server.
    ///
    /// [`close`]: Self::close
    pub fn run_once(&mut self) -> Result<()> {
        let timeout = if self.has_pending_work() {
            Duration::ZERO
        } else {
            self.poll_interval
        };
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e).context("Poll failed");
        }

        let (listener_error, errored) = self.record_readiness();

        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort_unstable();

        for &id in &ids {
            self.write_ready(id);
        }

        self.accept_one()?;
        for &id in &ids {
            self.read_client(id);
            self.read_backend(id);
        }

        for id in errored {
            if self.connections.contains_key(&id) {
                log::warn!("[Conn {id}] Socket error, tearing down");
                self.teardown(id);
            }
        }
        self.expire_backend_connects();
        if listener_error {
            anyhow::bail!("Listener socket reported an error");
        }
        Ok(())
    }

    /// Tear down every connection and the listener. Established clients get
    /// a best-effort Close 1001 first. Safe to call repeatedly.
    pub fn close(&mut self) {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.close(CloseCode::GoingAway, "server shutting down");
                let _ = conn.write_pending();
            }
            self.teardown(id);
        }

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            log::info!("[Proxy] Listener on {} closed", self.local_addr);
        }
        self.listener_ready = false;
    }

    // ------------------------------------------------------------------
    // Readiness bookkeeping
    // ------------------------------------------------------------------

    fn has_pending_work(&self) -> bool {
        (self.listener_ready && self.listener.is_some())
            || self.connections.values().any(|conn| {
                conn.client_read_ready()
                    || (conn.writable && conn.has_outbound())
                    || conn.backend_read_ready()
                    || conn.backend_flush_ready()
            })
    }

    /// Fold poll events into the per-socket flags. Returns whether the
    /// listener errored and which connections' client sockets errored.
    fn record_readiness(&mut self) -> (bool, Vec<ConnectionId>) {
        let mut listener_error = false;
        let mut errored = Vec::new();

        for event in &self.events {
            if event.token() == LISTENER {
                listener_error |= event.is_error();
                self.listener_ready |= event.is_readable();
                continue;
            }

            let (id, is_backend) = token_owner(event.token());
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if is_backend {
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    conn.backend_readable = true;
                }
                if event.is_writable() {
                    conn.backend_writable = true;
                }
            } else {
                if event.is_readable() || event.is_read_closed() {
                    conn.readable = true;
                }
                if event.is_writable() || event.is_write_closed() {
                    conn.writable = true;
                }
                if event.is_error() {
                    errored.push(id);
                }
            }
        }

        (listener_error, errored)
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    fn write_ready(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        if conn.backend_flush_ready() {
            match conn.backend_mut().map(|backend| backend.flush()) {
                Some(Ok(SendStatus::Sent)) | None => conn.backend_pending = false,
                Some(Ok(SendStatus::WouldBlock)) => conn.backend_writable = false,
                Some(Err(e)) => {
                    log::warn!("[Conn {id}] Backend flush failed: {e:#}");
                    detach_backend(self.poll.registry(), conn);
                    conn.close(CloseCode::InternalError, "backend error");
                }
            }
        }

        if !(conn.writable && conn.has_outbound()) {
            return;
        }
        match conn.write_pending() {
            Ok(Drain::Blocked) => conn.writable = false,
            Ok(Drain::Idle | Drain::Partial) => {}
            Ok(Drain::CloseSent) => {
                log::debug!("[Conn {id}] Close frame sent");
                self.teardown(id);
            }
            Err(e) => self.fail(id, e),
        }
    }

    fn accept_one(&mut self) -> Result<()> {
        if !self.listener_ready {
            return Ok(());
        }
        let Some(listener) = self.listener.as_ref() else {
            return Ok(());
        };

        let (mut stream, peer_addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.listener_ready = false;
                return Ok(());
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                log::debug!("[Proxy] Transient accept error: {e}");
                return Ok(());
            }
            Err(e) => return Err(e).context("Accept failed"),
        };

        let id = self.next_id;
        self.next_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Conn {id}] set_nodelay failed: {e}");
        }
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            client_token(id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::warn!("[Proxy] Failed to register client {peer_addr}: {e}");
            return Ok(());
        }

        log::info!("[Proxy] Accepted {peer_addr} as connection {id}");
        self.connections.insert(
            id,
            Connection::new(
                id,
                stream,
                peer_addr,
                self.max_header_bytes,
                self.max_payload_bytes,
            ),
        );
        Ok(())
    }

    fn read_client(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.client_read_ready() {
            return;
        }

        let limit = conn.read_limit().min(self.read_buf.len());
        let mut inbound = Vec::new();
        let received = match conn.read_socket(&mut self.read_buf[..limit]) {
            Ok(None) => {
                conn.readable = false;
                return;
            }
            Ok(Some(n)) => conn.receive(&self.read_buf[..n], &mut inbound),
            Err(e) => Err(e),
        };

        // Whatever completed before a bad frame is still delivered.
        for item in inbound {
            let result = match item {
                Inbound::Upgraded => self.connected(id),
                Inbound::Message(message) => self
                    .with_context(id, |handler, ctx| handler.on_message(ctx, message))
                    .unwrap_or(Ok(()))
                    .map_err(ConnectionError::Handler),
                Inbound::Closed(_) => Ok(()),
            };
            if let Err(e) = result {
                self.fail(id, e);
                return;
            }
        }
        if let Err(e) = received {
            self.fail(id, e);
        }
    }

    fn read_backend(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.backend_read_ready() {
            return;
        }
        let Some(backend) = conn.backend_mut() else {
            return;
        };

        let was_connecting = backend.is_connecting();
        let received = backend.receive();
        if was_connecting && !backend.is_connecting() {
            // The writable edge may have fired before the handshake ended.
            conn.backend_writable = true;
        }

        match received {
            Ok(Received::Data(message)) => conn.send_message(message),
            Ok(Received::Pending) => conn.backend_readable = false,
            Ok(Received::Closed) => {
                log::info!("[Conn {id}] Backend closed the stream");
                detach_backend(self.poll.registry(), conn);
                conn.close(CloseCode::Normal, "");
            }
            Err(e) => {
                log::warn!("[Conn {id}] Backend receive failed: {e:#}");
                detach_backend(self.poll.registry(), conn);
                conn.close(CloseCode::InternalError, "backend error");
            }
        }
    }

    /// Drop backends that are still connecting past their deadline.
    fn expire_backend_connects(&mut self) {
        let now = Instant::now();
        for conn in self.connections.values_mut() {
            if conn.backend_connect_expired(now) {
                log::warn!(
                    "[Conn {}] Backend connect timed out after {:?}",
                    conn.id(),
                    self.connect_timeout
                );
                detach_backend(self.poll.registry(), conn);
                conn.close(CloseCode::InternalError, "backend error");
            }
        }
    }

    // ------------------------------------------------------------------
    // Callbacks and teardown
    // ------------------------------------------------------------------

    /// Run a handler callback with the connection lifted out of the registry
    /// so the rest of the registry can be offered as [`Peers`](super::Peers).
    fn with_context<R>(
        &mut self,
        id: ConnectionId,
        f: impl FnOnce(&mut H, &mut Context<'_>) -> R,
    ) -> Option<R> {
        let mut conn = self.connections.remove(&id)?;
        let result = {
            let mut ctx = Context::new(&mut conn, &mut self.connections);
            f(&mut self.handler, &mut ctx)
        };
        self.connections.insert(id, conn);
        Some(result)
    }

    fn connected(&mut self, id: ConnectionId) -> Result<(), ConnectionError> {
        let Some(result) = self.with_context(id, |handler, ctx| handler.on_connected(ctx)) else {
            return Ok(());
        };
        let Some(mut backend) = result.map_err(ConnectionError::Handler)? else {
            return Ok(());
        };

        self.poll.registry().register(
            &mut *backend,
            backend_token(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        match self.connections.get_mut(&id) {
            Some(conn) => conn.attach_backend(backend, Instant::now() + self.connect_timeout),
            None => {
                backend.close();
                let _ = self.poll.registry().deregister(&mut *backend);
            }
        }
        Ok(())
    }

    /// Report `err`, send a best-effort Close when the peer is a WebSocket,
    /// and tear the connection down. The Close carries only the generic
    /// reason for its code; `err` itself goes to the log.
    fn fail(&mut self, id: ConnectionId, err: ConnectionError) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        match &err {
            ConnectionError::RemoteSocketClose => log::info!("[Conn {id}] {err}"),
            _ => log::warn!("[Conn {id}] {err}"),
        }

        if let Some(code) = err.close_code() {
            if conn.is_established() && !conn.is_closed() {
                conn.close(code, code.reason());
                let _ = conn.write_pending();
            }
        }
        self.teardown(id);
    }

    /// Remove a connection: close its backend, deregister its sources and
    /// run `on_closed`. No-op if it is already gone.
    fn teardown(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };

        detach_backend(self.poll.registry(), &mut conn);
        if let Err(e) = self.poll.registry().deregister(conn.socket_mut()) {
            log::debug!("[Conn {id}] Deregister failed: {e}");
        }

        {
            let mut ctx = Context::new(&mut conn, &mut self.connections);
            self.handler.on_closed(&mut ctx);
        }
        log::info!("[Proxy] Connection {id} ({}) closed", conn.peer_addr());
    }
}
