// Shared helpers for the proxy integration tests: a server running on its
// own thread and a minimal blocking WebSocket client speaking raw frames.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use wsconsole::protocol::handshake::find_header_end;
use wsconsole::protocol::{encode_masked_frame, CloseFrame, Event, FrameDecoder, Opcode};
use wsconsole::{Config, Handler, ProxyServer};

/// The sample nonce from RFC 6455 Section 1.3.
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn loopback_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        ..Config::default()
    }
}

/// A proxy running on a background thread until dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a server whose handler is built on the server thread.
    pub fn start<H, F>(config: Config, make_handler: F) -> Self
    where
        H: Handler + 'static,
        F: FnOnce() -> H + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let (tx, rx) = mpsc::channel();

        let thread = thread::spawn(move || {
            let mut server = ProxyServer::bind(&config, make_handler()).unwrap();
            tx.send(server.local_addr()).unwrap();
            server.run(&flag).unwrap();
        });

        let addr = rx.recv_timeout(IO_TIMEOUT).unwrap();
        Self {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Blocking client that masks what it sends and decodes what it receives.
pub struct WsClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    events: VecDeque<Event>,
    pub response: String,
}

impl WsClient {
    /// Connect and complete the opening handshake on `path`.
    pub fn connect(addr: SocketAddr, path: &str) -> Self {
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        let (stream, head, rest) = raw_exchange(addr, request.as_bytes());
        let response = String::from_utf8(head).unwrap();
        assert!(
            response.starts_with("HTTP/1.1 101"),
            "unexpected response: {response}"
        );

        let mut client = Self {
            stream,
            decoder: FrameDecoder::new(),
            events: VecDeque::new(),
            response,
        };
        client.absorb(&rest);
        client
    }

    pub fn send_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) {
        self.send_raw(&encode_masked_frame(fin, opcode, MASK, payload));
    }

    pub fn send_text(&mut self, text: &str) {
        self.send_frame(true, Opcode::Text, text.as_bytes());
    }

    pub fn send_close(&mut self, status: u16, reason: &str) {
        let mut payload = status.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.send_frame(true, Opcode::Close, &payload);
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Send a frame, handing back a write that timed out instead of
    /// panicking.
    pub fn try_send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> std::io::Result<()> {
        self.stream
            .write_all(&encode_masked_frame(true, opcode, MASK, payload))
    }

    pub fn set_write_timeout(&self, timeout: Duration) {
        self.stream.set_write_timeout(Some(timeout)).unwrap();
    }

    /// Next decoded event, blocking up to the I/O timeout.
    pub fn next_event(&mut self) -> Event {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(event) = self.events.pop_front() {
                return event;
            }
            let n = self.stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed the socket before the next event");
            self.absorb(&buf[..n]);
        }
    }

    /// Next event, which must be a Close.
    pub fn expect_close(&mut self) -> CloseFrame {
        match self.next_event() {
            Event::Close(frame) => frame,
            other => panic!("expected Close, got {other:?}"),
        }
    }

    /// The server must close the TCP connection with no further events.
    pub fn expect_eof(&mut self) {
        assert!(self.events.is_empty(), "pending events: {:?}", self.events);
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => panic!("expected EOF, got {n} more bytes"),
            }
        }
    }

    /// Read and discard raw bytes, returning how many arrived.
    pub fn drain_raw(&mut self, limit: usize) -> usize {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        while total < limit {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        total
    }

    fn absorb(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut events = Vec::new();
        self.decoder.feed(bytes, &mut events).unwrap();
        self.events.extend(events);
    }
}

/// Open a socket, send `request` and read up to the end of the response
/// head. Returns the socket, the head and any bytes that followed it.
pub fn raw_exchange(addr: SocketAddr, request: &[u8]) -> (TcpStream, Vec<u8>, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.write_all(request).unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_header_end(&buf) {
            let rest = buf.split_off(end);
            return (stream, buf, rest);
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed the socket during the handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
}
