//! wsconsole - WebSocket console proxy.
//!
//! Bridges browser terminals speaking RFC 6455 to backend streams such as a
//! container's attach endpoint, relaying bytes in both directions.
//!
//! # Architecture
//!
//! - **Protocol** - pure frame codec, close handling and HTTP upgrade
//! - **Proxy** - single-threaded `mio` event loop owning every connection
//! - **Backend** - pollable upstream links (`ws://`, `tcp://`)
//! - **Relay** - the default handler wiring tokens to backends
//!
//! # Modules
//!
//! - [`protocol`] - frame decoder/encoder, close codes, handshake
//! - [`proxy`] - connections, handler trait, event loop
//! - [`backend`] - backend link contract and implementations
//! - [`target`] - token to backend URL resolution
//! - [`config`] - configuration loading

pub mod backend;
pub mod config;
pub mod constants;
pub mod protocol;
pub mod proxy;
pub mod target;

// Re-export commonly used types
pub use backend::{BackendConnector, BackendLink, DefaultConnector};
pub use config::Config;
pub use protocol::{CloseCode, Message, ProtocolError};
pub use proxy::{ConsoleRelay, Context, Handler, ProxyServer};
pub use target::{StaticTargets, TargetResolver};
