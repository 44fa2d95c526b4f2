//! Protocol limits and loop tuning constants.
//!
//! Centralizes the magic numbers used by the codec and the proxy loop.
//! Values that operators may want to change are mirrored as defaults in
//! [`crate::config::Config`].

use std::time::Duration;

// ============================================================================
// Protocol limits
// ============================================================================

/// Maximum number of bytes buffered while waiting for the HTTP upgrade
/// request terminator (`\r\n\r\n`).
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Most header lines accepted in an upgrade request.
pub const MAX_REQUEST_HEADERS: usize = 64;

/// Maximum payload size of a single frame or reassembled message (32 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Largest payload a control frame (Close, Ping, Pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// RFC 6455 GUID appended to `Sec-WebSocket-Key` before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// ============================================================================
// Event loop
// ============================================================================

/// Upper bound on a single readiness poll.
///
/// Keeps the loop responsive to the shutdown flag when every socket is idle.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Listen backlog for the proxy socket.
pub const LISTEN_BACKLOG: i32 = 5;

/// Bytes read from a client socket per readiness pass.
pub const READ_CHUNK: usize = 16 * 1024;

/// Bytes read per handshake pass while accumulating the upgrade request.
pub const HANDSHAKE_READ_CHUNK: usize = 2048;

/// Readiness events buffered per poll.
pub const EVENTS_CAPACITY: usize = 1024;

/// Outbound bytes queued for a client above which its backend is not read.
///
/// The backend is polled again once the client drains below this mark, so a
/// slow browser throttles its container stream instead of growing the queue.
pub const OUTBOUND_HIGH_WATER: usize = 4 * 1024 * 1024;

// ============================================================================
// Backend
// ============================================================================

/// Default timeout for establishing the upstream connection.
pub const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default listening port (matches the historical console proxy deployment).
pub const DEFAULT_PORT: u16 = 13256;
