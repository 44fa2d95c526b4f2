//! One accepted client socket and its protocol state.
//!
//! A [`Connection`] owns everything about a browser peer: the handshake
//! accumulator, the frame decoder, the outbound frame queue and the paired
//! backend link. It never polls; the server feeds it bytes it read and asks
//! it to drain its queue when the socket is writable.
//!
//! Outbound data is always queued, never written inline. Each entry keeps
//! its opcode so the writer knows when a Close frame has fully left.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use mio::net::TcpStream;

use super::error::ConnectionError;
use crate::backend::{BackendLink, SendStatus};
use crate::constants::{
    HANDSHAKE_READ_CHUNK, MAX_CONTROL_PAYLOAD, OUTBOUND_HIGH_WATER, READ_CHUNK,
};
use crate::protocol::handshake::{self, find_header_end};
use crate::protocol::{
    encode_frame, CloseCode, CloseFrame, Event, FrameDecoder, HttpRequest, Message, Opcode,
    ProtocolError,
};

/// Registry key for a connection. Allocated monotonically, never reused.
pub type ConnectionId = u64;

/// Upgrade progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Accumulating the HTTP upgrade request.
    AwaitingRequest,
    /// 101 response queued; bytes are WebSocket frames.
    Established,
}

/// What a batch of client bytes produced, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The upgrade completed; the 101 response is queued.
    Upgraded,
    /// A complete data message.
    Message(Message),
    /// The client sent Close; the echo is queued.
    Closed(CloseFrame),
}

/// Result of one attempt to drain the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Queue is empty.
    Idle,
    /// The socket took part of a frame; try again next iteration.
    Partial,
    /// The socket would block.
    Blocked,
    /// A Close frame finished sending.
    CloseSent,
}

#[derive(Debug)]
struct QueuedWrite {
    /// `None` for the raw handshake response.
    opcode: Option<Opcode>,
    bytes: Vec<u8>,
}

/// A client connection owned by the proxy registry.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    socket: TcpStream,
    peer_addr: SocketAddr,
    handshake: HandshakeState,
    header_buf: Vec<u8>,
    max_header_bytes: usize,
    decoder: FrameDecoder,
    outbound: VecDeque<QueuedWrite>,
    outbound_bytes: usize,
    closed: bool,
    backend: Option<Box<dyn BackendLink>>,
    backend_deadline: Option<Instant>,
    request: Option<HttpRequest>,

    // Readiness emulation: set by poll events, cleared on WouldBlock.
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) backend_readable: bool,
    pub(crate) backend_writable: bool,
    pub(crate) backend_pending: bool,
}

impl Connection {
    /// Wrap a freshly accepted socket.
    pub fn new(
        id: ConnectionId,
        socket: TcpStream,
        peer_addr: SocketAddr,
        max_header_bytes: usize,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            id,
            socket,
            peer_addr,
            handshake: HandshakeState::AwaitingRequest,
            header_buf: Vec::new(),
            max_header_bytes,
            decoder: FrameDecoder::with_max_payload(max_payload_bytes),
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            closed: false,
            backend: None,
            backend_deadline: None,
            request: None,
            readable: true,
            writable: true,
            backend_readable: false,
            backend_writable: false,
            backend_pending: false,
        }
    }

    /// Registry id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current upgrade state.
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    /// Whether the WebSocket upgrade completed.
    pub fn is_established(&self) -> bool {
        self.handshake == HandshakeState::Established
    }

    /// Whether a Close frame has been queued; no further data is sent.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The parsed upgrade request, once established.
    pub fn request(&self) -> Option<&HttpRequest> {
        self.request.as_ref()
    }

    /// Frames (and the handshake response) waiting to be written.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Bytes waiting to be written.
    pub fn outbound_bytes(&self) -> usize {
        self.outbound_bytes
    }

    /// Whether anything is waiting to be written.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Whether a backend link is attached.
    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// The attached backend link, if any.
    pub fn backend_mut(&mut self) -> Option<&mut (dyn BackendLink + 'static)> {
        self.backend.as_deref_mut()
    }

    /// Whether the backend should be read this iteration: it has data, the
    /// client is open, and the client's queue is under the high-water mark.
    pub(crate) fn backend_read_ready(&self) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        self.is_established()
            && !self.closed
            && self.outbound_bytes <= OUTBOUND_HIGH_WATER
            && (self.backend_readable || backend.is_readable())
    }

    /// Whether the client socket should be read this iteration. Reads pause
    /// while the backend holds client data it could not yet write.
    pub(crate) fn client_read_ready(&self) -> bool {
        self.readable && !self.backend_pending
    }

    /// Whether the backend should be flushed: it is writable and either has
    /// queued data or is still connecting.
    pub(crate) fn backend_flush_ready(&self) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        self.backend_writable && (self.backend_pending || backend.is_connecting())
    }

    /// Whether the backend is still connecting past its deadline.
    pub(crate) fn backend_connect_expired(&self, now: Instant) -> bool {
        match (self.backend.as_deref(), self.backend_deadline) {
            (Some(backend), Some(deadline)) => backend.is_connecting() && now >= deadline,
            _ => false,
        }
    }

    pub(crate) fn attach_backend(&mut self, backend: Box<dyn BackendLink>, deadline: Instant) {
        self.backend = Some(backend);
        self.backend_deadline = Some(deadline);
        self.backend_readable = true;
        self.backend_writable = true;
        self.backend_pending = false;
    }

    pub(crate) fn take_backend(&mut self) -> Option<Box<dyn BackendLink>> {
        self.backend_readable = false;
        self.backend_writable = false;
        self.backend_pending = false;
        self.backend_deadline = None;
        self.backend.take()
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Forward a client message to the backend.
    ///
    /// Messages arriving with no backend attached are dropped.
    pub fn send_to_backend(&mut self, message: &Message) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            log::debug!("[Conn {}] No backend, dropping {} bytes", self.id, message.len());
            return Ok(());
        };
        if backend.send(message)? == SendStatus::WouldBlock {
            self.backend_pending = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn enqueue(&mut self, opcode: Option<Opcode>, bytes: Vec<u8>) {
        self.outbound_bytes += bytes.len();
        self.outbound.push_back(QueuedWrite { opcode, bytes });
    }

    fn enqueue_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) {
        if self.closed || !self.is_established() {
            log::trace!("[Conn {}] Dropping {:?} frame", self.id, opcode);
            return;
        }
        self.enqueue(Some(opcode), encode_frame(fin, opcode, payload));
    }

    /// Queue a complete message as a single frame.
    pub fn send_message(&mut self, message: impl Into<Message>) {
        let message = message.into();
        self.enqueue_frame(true, message.opcode(), message.as_bytes());
    }

    /// Queue the first frame of a fragmented message.
    pub fn send_fragment_start(&mut self, message: impl Into<Message>) {
        let message = message.into();
        self.enqueue_frame(false, message.opcode(), message.as_bytes());
    }

    /// Queue a middle fragment.
    pub fn send_fragment(&mut self, payload: &[u8]) {
        self.enqueue_frame(false, Opcode::Continuation, payload);
    }

    /// Queue the final fragment.
    pub fn send_fragment_end(&mut self, payload: &[u8]) {
        self.enqueue_frame(true, Opcode::Continuation, payload);
    }

    /// Queue a Close frame. Later data is dropped and the connection is torn
    /// down once the frame has been written.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        if self.closed || !self.is_established() {
            return;
        }
        let frame = CloseFrame::new(code, truncate_reason(reason));
        self.enqueue(
            Some(Opcode::Close),
            encode_frame(true, Opcode::Close, &frame.encode()),
        );
        self.closed = true;
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Bytes to read from the socket per pass.
    pub(crate) fn read_limit(&self) -> usize {
        match self.handshake {
            HandshakeState::AwaitingRequest => HANDSHAKE_READ_CHUNK,
            HandshakeState::Established => READ_CHUNK,
        }
    }

    /// Read once from the socket. `Ok(None)` means it would block.
    pub(crate) fn read_socket(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ConnectionError> {
        loop {
            match self.socket.read(buf) {
                Ok(0) => return Err(ConnectionError::RemoteSocketClose),
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Process bytes read from the client, appending what they produced to
    /// `out`.
    ///
    /// Before the upgrade the bytes accumulate until the header terminator;
    /// anything after it in the same read is decoded as frames. Pings are
    /// answered and Close is echoed here; messages are handed back for the
    /// handler. Input after Close is ignored.
    ///
    /// On error `out` still holds everything completed before the bad input,
    /// including [`Inbound::Upgraded`].
    pub fn receive(&mut self, bytes: &[u8], out: &mut Vec<Inbound>) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }

        let frames = match self.handshake {
            HandshakeState::Established => bytes,
            HandshakeState::AwaitingRequest => {
                self.header_buf.extend_from_slice(bytes);
                let Some(end) = find_header_end(&self.header_buf) else {
                    if self.header_buf.len() > self.max_header_bytes {
                        return Err(ProtocolError::ExceedSize("Header").into());
                    }
                    return Ok(());
                };
                if end > self.max_header_bytes {
                    return Err(ProtocolError::ExceedSize("Header").into());
                }

                let (request, response) = handshake::accept(&self.header_buf[..end])?;
                log::info!(
                    "[Conn {}] Handshake complete for {} {}",
                    self.id,
                    self.peer_addr,
                    request.path
                );
                self.enqueue(None, response);
                self.request = Some(request);
                self.handshake = HandshakeState::Established;
                out.push(Inbound::Upgraded);

                // Bytes already past the terminator are the first frames.
                let consumed = self.header_buf.len() - bytes.len();
                let offset = end.saturating_sub(consumed);
                self.header_buf = Vec::new();
                &bytes[offset..]
            }
        };

        if frames.is_empty() {
            return Ok(());
        }

        let mut events = Vec::new();
        let decoded = self.decoder.feed(frames, &mut events);
        for event in events {
            match event {
                Event::Message(message) => out.push(Inbound::Message(message)),
                Event::Ping(payload) => self.enqueue_frame(true, Opcode::Pong, &payload),
                Event::Pong(_) => {}
                Event::Close(frame) => {
                    log::info!(
                        "[Conn {}] Peer closed with {} {:?}",
                        self.id,
                        frame.code.as_u16(),
                        frame.reason
                    );
                    self.close(frame.code, &frame.reason);
                    out.push(Inbound::Closed(frame));
                }
            }
        }
        decoded.map_err(ConnectionError::from)
    }

    /// Write queued data until the queue empties or the socket pushes back.
    pub(crate) fn write_pending(&mut self) -> Result<Drain, ConnectionError> {
        loop {
            let Some(front) = self.outbound.front_mut() else {
                return Ok(Drain::Idle);
            };
            match self.socket.write(&front.bytes) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) if n < front.bytes.len() => {
                    front.bytes.drain(..n);
                    self.outbound_bytes -= n;
                    return Ok(Drain::Partial);
                }
                Ok(n) => {
                    self.outbound_bytes -= n;
                    let sent = self.outbound.pop_front();
                    if sent.and_then(|w| w.opcode) == Some(Opcode::Close) {
                        return Ok(Drain::CloseSent);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Drain::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Close reasons must fit a control frame alongside the 2-byte status.
fn truncate_reason(reason: &str) -> &str {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MAX_HEADER_BYTES, MAX_PAYLOAD_BYTES};
    use crate::protocol::encode_masked_frame;
    use std::net::TcpListener;
    use std::time::Duration;

    const KEY: [u8; 4] = [1, 2, 3, 4];
    const UPGRADE: &[u8] = b"GET /?token=t1 HTTP/1.1\r\n\
Host: localhost\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

    /// A connection plus the blocking client end of its socket.
    fn connection() -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            1,
            TcpStream::from_std(server),
            peer,
            MAX_HEADER_BYTES,
            MAX_PAYLOAD_BYTES,
        );
        (conn, client)
    }

    fn receive(conn: &mut Connection, bytes: &[u8]) -> Result<Vec<Inbound>, ConnectionError> {
        let mut out = Vec::new();
        conn.receive(bytes, &mut out).map(|()| out)
    }

    fn established() -> (Connection, std::net::TcpStream) {
        let (mut conn, client) = connection();
        assert_eq!(receive(&mut conn, UPGRADE).unwrap(), vec![Inbound::Upgraded]);
        (conn, client)
    }

    fn drain_all(conn: &mut Connection) -> Drain {
        loop {
            match conn.write_pending().unwrap() {
                Drain::Partial => {}
                other => return other,
            }
        }
    }

    #[test]
    fn test_handshake_in_pieces() {
        let (mut conn, _client) = connection();
        assert!(receive(&mut conn, &UPGRADE[..20]).unwrap().is_empty());
        assert_eq!(conn.handshake_state(), HandshakeState::AwaitingRequest);
        assert_eq!(receive(&mut conn, &UPGRADE[20..]).unwrap(), vec![Inbound::Upgraded]);
        assert!(conn.is_established());
        assert_eq!(conn.request().unwrap().query_param("token"), Some("t1"));
        assert_eq!(conn.outbound_len(), 1);
    }

    #[test]
    fn test_frames_after_terminator_in_same_read() {
        let (mut conn, _client) = connection();
        let mut bytes = UPGRADE.to_vec();
        bytes.extend(encode_masked_frame(true, Opcode::Text, KEY, b"hello"));
        assert_eq!(
            receive(&mut conn, &bytes).unwrap(),
            vec![
                Inbound::Upgraded,
                Inbound::Message(Message::Text("hello".into()))
            ]
        );
    }

    #[test]
    fn test_frames_after_terminator_split_across_reads() {
        let (mut conn, _client) = connection();
        let mut bytes = UPGRADE.to_vec();
        bytes.extend(encode_masked_frame(true, Opcode::Binary, KEY, b"abc"));
        let split = UPGRADE.len() - 3;
        assert!(receive(&mut conn, &bytes[..split]).unwrap().is_empty());
        assert_eq!(
            receive(&mut conn, &bytes[split..]).unwrap(),
            vec![
                Inbound::Upgraded,
                Inbound::Message(Message::Binary(b"abc".to_vec()))
            ]
        );
    }

    #[test]
    fn test_upgrade_survives_bad_frame_in_same_read() {
        let (mut conn, _client) = connection();
        let mut bytes = UPGRADE.to_vec();
        bytes.extend_from_slice(&[0xC1, 0x80, 0, 0, 0, 0]);

        let mut out = Vec::new();
        let result = conn.receive(&bytes, &mut out);
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ProtocolError::RsvBit))
        ));
        assert_eq!(out, vec![Inbound::Upgraded]);
        assert!(conn.is_established());
    }

    #[test]
    fn test_message_before_bad_frame_is_kept() {
        let (mut conn, _client) = established();
        let mut bytes = encode_masked_frame(true, Opcode::Text, KEY, b"hello");
        bytes.extend(encode_masked_frame(true, Opcode::Ping, KEY, b"tick"));
        bytes.extend_from_slice(&[0xC1, 0x80, 0, 0, 0, 0]);

        let mut out = Vec::new();
        assert!(conn.receive(&bytes, &mut out).is_err());
        assert_eq!(out, vec![Inbound::Message(Message::Text("hello".into()))]);
        // The Pong decoded ahead of the error is still queued.
        assert_eq!(conn.outbound_len(), 2);
    }

    #[test]
    fn test_oversized_header_rejected() {
        let (mut conn, _client) = connection();
        let junk = vec![b'a'; MAX_HEADER_BYTES + 1];
        assert!(matches!(
            receive(&mut conn, &junk),
            Err(ConnectionError::Protocol(ProtocolError::ExceedSize(_)))
        ));
    }

    #[test]
    fn test_missing_key_is_handshake_error() {
        let (mut conn, _client) = connection();
        assert!(matches!(
            receive(&mut conn, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            Err(ConnectionError::Handshake(_))
        ));
    }

    #[test]
    fn test_ping_queues_single_pong() {
        let (mut conn, _client) = established();
        let ping = encode_masked_frame(true, Opcode::Ping, KEY, b"tick");
        let inbound = receive(&mut conn, &ping).unwrap();
        assert!(inbound.is_empty());
        // 101 response plus one Pong.
        assert_eq!(conn.outbound_len(), 2);
    }

    #[test]
    fn test_close_is_echoed_and_input_ignored_afterwards() {
        let (mut conn, mut client) = established();
        let close = encode_masked_frame(true, Opcode::Close, KEY, &1001u16.to_be_bytes());
        let inbound = receive(&mut conn, &close).unwrap();
        assert_eq!(
            inbound,
            vec![Inbound::Closed(CloseFrame::new(CloseCode::GoingAway, ""))]
        );
        assert!(conn.is_closed());

        // Data after Close is neither decoded nor sent.
        conn.send_message("late");
        let late = encode_masked_frame(true, Opcode::Text, KEY, b"late");
        assert!(receive(&mut conn, &late).unwrap().is_empty());

        assert_eq!(drain_all(&mut conn), Drain::CloseSent);

        let mut buf = vec![0u8; 512];
        let mut received = Vec::new();
        while !received.ends_with(&[0x88, 0x02, 0x03, 0xe9]) {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "socket closed early");
            received.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_send_helpers_shape_frames() {
        let (mut conn, _client) = established();
        let before = conn.outbound_bytes();
        conn.send_fragment_start(Message::Text("ab".into()));
        conn.send_fragment(b"cd");
        conn.send_fragment_end(b"ef");
        assert_eq!(conn.outbound_len(), 4);
        assert_eq!(conn.outbound_bytes() - before, 12);

        let frames: Vec<u8> = conn.outbound.iter().skip(1).map(|w| w.bytes[0]).collect();
        assert_eq!(frames, vec![0x01, 0x00, 0x80]);
    }

    #[test]
    fn test_nothing_sent_before_upgrade() {
        let (mut conn, _client) = connection();
        conn.send_message("early");
        conn.close(CloseCode::Normal, "");
        assert!(!conn.has_outbound());
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_write_pending_delivers_handshake_then_frames() {
        let (mut conn, mut client) = established();
        conn.send_message(vec![1u8, 2, 3]);
        assert_eq!(drain_all(&mut conn), Drain::Idle);
        assert_eq!(conn.outbound_bytes(), 0);

        let mut received = Vec::new();
        let mut buf = [0u8; 512];
        while !received.ends_with(&[0x82, 0x03, 1, 2, 3]) {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert!(received.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let truncated = truncate_reason(&reason);
        assert!(truncated.len() <= 123);
        assert_eq!(truncated.len() % 2, 0);
    }

    #[test]
    fn test_read_socket_reports_remote_close() {
        let (mut conn, client) = connection();
        drop(client);
        let mut buf = [0u8; 64];
        let mut outcome = conn.read_socket(&mut buf);
        for _ in 0..100 {
            if !matches!(outcome, Ok(None)) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            outcome = conn.read_socket(&mut buf);
        }
        assert!(matches!(outcome, Err(ConnectionError::RemoteSocketClose)));
    }
}
