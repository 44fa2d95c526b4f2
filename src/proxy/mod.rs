//! Multiplexed WebSocket proxy.
//!
//! # Architecture
//!
//! ```text
//!  browser ──ws──► ┌──────────────────────────────┐ ──ws/tcp──► backend
//!                  │ ProxyServer (mio poll loop)  │
//!  browser ──ws──► │  Connection ── BackendLink   │ ──ws/tcp──► backend
//!                  │  Connection ── BackendLink   │
//!                  └──────────────┬───────────────┘
//!                                 │ Handler callbacks
//!                                 ▼
//!                           ConsoleRelay
//! ```
//!
//! Everything runs on one thread. Independent servers (one per port) share
//! no state.

pub mod connection;
pub mod error;
pub mod handler;
pub mod relay;
pub mod server;

pub use connection::{Connection, ConnectionId, HandshakeState, Inbound};
pub use error::ConnectionError;
pub use handler::{Context, Handler, Peers};
pub use relay::ConsoleRelay;
pub use server::ProxyServer;
