//! The console relay: pairs each browser with the backend its token names.

use anyhow::{Context as _, Result};

use super::handler::{Context, Handler};
use crate::backend::{BackendConnector, BackendLink};
use crate::protocol::{CloseCode, Message};
use crate::target::{target_token, TargetResolver};

/// [`Handler`] that resolves a backend per client and forwards traffic.
///
/// Clients without a resolvable token are closed with 1008. A backend that
/// cannot be reached fails the connection with 1011.
#[derive(Debug)]
pub struct ConsoleRelay<R, C> {
    resolver: R,
    connector: C,
    announce: bool,
}

impl<R: TargetResolver, C: BackendConnector> ConsoleRelay<R, C> {
    /// Create a relay.
    pub fn new(resolver: R, connector: C) -> Self {
        Self {
            resolver,
            connector,
            announce: false,
        }
    }

    /// Broadcast `"<ip> - connected"` / `"<ip> - disconnected"` to other
    /// clients.
    #[must_use]
    pub fn announce_peers(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }
}

impl<R: TargetResolver, C: BackendConnector> Handler for ConsoleRelay<R, C> {
    fn on_connected(&mut self, ctx: &mut Context<'_>) -> Result<Option<Box<dyn BackendLink>>> {
        let peer = ctx.peer_addr();
        log::info!("[Relay] {peer} connected");

        if self.announce {
            let notice = Message::Text(format!("{} - connected", peer.ip()));
            ctx.peers().broadcast(&notice);
        }

        let Some(token) = ctx.request().and_then(target_token).map(str::to_string) else {
            log::warn!("[Relay] {peer} sent no target token");
            ctx.close(CloseCode::Policy, "missing target token");
            return Ok(None);
        };
        let Some(target) = self.resolver.resolve(&token) else {
            log::warn!("[Relay] {peer} asked for unknown target {token:?}");
            ctx.close(CloseCode::Policy, "unknown target");
            return Ok(None);
        };

        let link = self
            .connector
            .connect(&target)
            .with_context(|| format!("Backend for {peer} unavailable"))?;
        Ok(Some(link))
    }

    fn on_message(&mut self, ctx: &mut Context<'_>, message: Message) -> Result<()> {
        ctx.connection()
            .send_to_backend(&message)
            .context("Backend send failed")
    }

    fn on_closed(&mut self, ctx: &mut Context<'_>) {
        if !ctx.connection().is_established() {
            return;
        }
        let peer = ctx.peer_addr();
        log::info!("[Relay] {peer} closed");
        if self.announce {
            let notice = Message::Text(format!("{} - disconnected", peer.ip()));
            ctx.peers().broadcast(&notice);
        }
    }
}
