//! Application callbacks invoked by the proxy loop.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;

use super::connection::{Connection, ConnectionId};
use crate::backend::BackendLink;
use crate::protocol::{CloseCode, HttpRequest, Message};

/// Per-deployment behaviour plugged into [`ProxyServer`](super::ProxyServer).
///
/// All callbacks run on the loop thread and must not block.
pub trait Handler {
    /// The upgrade completed. Return a backend link to pair with the
    /// connection; the server registers it for polling.
    fn on_connected(&mut self, ctx: &mut Context<'_>) -> Result<Option<Box<dyn BackendLink>>> {
        let _ = ctx;
        Ok(None)
    }

    /// A complete message arrived from the client.
    fn on_message(&mut self, ctx: &mut Context<'_>, message: Message) -> Result<()>;

    /// The connection is being torn down. Called exactly once per accepted
    /// connection, including ones that never completed the upgrade.
    fn on_closed(&mut self, ctx: &mut Context<'_>) {
        let _ = ctx;
    }
}

/// The connection a callback is about, plus every other live connection.
#[derive(Debug)]
pub struct Context<'a> {
    connection: &'a mut Connection,
    peers: Peers<'a>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        connection: &'a mut Connection,
        others: &'a mut HashMap<ConnectionId, Connection>,
    ) -> Self {
        Self {
            connection,
            peers: Peers { connections: others },
        }
    }

    /// The connection this callback concerns.
    pub fn connection(&mut self) -> &mut Connection {
        self.connection
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Client address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// Upgrade request, once established.
    pub fn request(&self) -> Option<&HttpRequest> {
        self.connection.request()
    }

    /// Queue a message to this client.
    pub fn send(&mut self, message: impl Into<Message>) {
        self.connection.send_message(message);
    }

    /// Queue a Close frame to this client.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        self.connection.close(code, reason);
    }

    /// Every other connection in the server.
    pub fn peers(&mut self) -> &mut Peers<'a> {
        &mut self.peers
    }
}

/// View over the other connections of the same server.
#[derive(Debug)]
pub struct Peers<'a> {
    connections: &'a mut HashMap<ConnectionId, Connection>,
}

impl Peers<'_> {
    /// Number of other connections, established or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether there are no other connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of the other established connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|conn| conn.is_established())
            .map(Connection::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Mutable access to another connection.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Queue `message` to every other established, open connection.
    /// Returns how many received it.
    pub fn broadcast(&mut self, message: &Message) -> usize {
        let mut sent = 0;
        for conn in self.connections.values_mut() {
            if conn.is_established() && !conn.is_closed() {
                conn.send_message(message.clone());
                sent += 1;
            }
        }
        sent
    }
}
