//! The hub: a single task that owns the registry and the router.
//!
//! Connection tasks talk to it over one mpsc channel. Because only the hub
//! reads or writes chat state, events from one connection are handled in
//! the order they were sent and no locks are needed.

use crate::relay::{ConnCommand, ConnectionId, Delivery, Registry, Router, Session};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use wschat_core::frame::CLOSE_GOING_AWAY;

/// How often the hub runs housekeeping.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a connection task can tell the hub.
#[derive(Debug)]
pub enum HubEvent {
    /// Handshake completed. The hub answers on `admitted` before the
    /// connection sends its 101 response.
    Connected {
        id: ConnectionId,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<ConnCommand>,
        admitted: oneshot::Sender<Result<(), String>>,
    },
    /// A complete text message.
    Text { id: ConnectionId, text: String },
    /// The connection task is exiting.
    Disconnected { id: ConnectionId, reason: String },
    /// Snapshot request, used by tests and the server handle.
    Stats(oneshot::Sender<RegistryStats>),
}

/// Counts reported by [`HubEvent::Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub authenticated: usize,
}

pub struct Hub {
    registry: Registry,
    router: Router,
    /// 0 means unlimited.
    max_connections: usize,
}

impl Hub {
    pub fn new(router: Router, max_connections: usize) -> Self {
        Self {
            registry: Registry::new(),
            router,
            max_connections,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.registry.len(),
            authenticated: self.registry.authenticated_count(),
        }
    }

    /// Process events until shutdown is signalled or every sender is gone.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<HubEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("hub received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("all hub senders dropped");
                        break;
                    }
                },
                _ = housekeeping.tick() => {
                    self.router.gc();
                    debug!(connections = self.registry.len(), "hub housekeeping");
                }
            }
        }

        self.shutdown();
    }

    /// Apply one event.
    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected {
                id,
                remote_addr,
                outbound,
                admitted,
            } => self.on_connected(id, remote_addr, outbound, admitted),
            HubEvent::Text { id, text } => {
                let envelope = wschat_core::Envelope::parse(&text);
                let deliveries = self.router.route(&mut self.registry, id, envelope);
                self.deliver(deliveries);
            }
            HubEvent::Disconnected { id, reason } => {
                if let Some(session) = self.registry.remove(id) {
                    info!(
                        conn = id,
                        user = session.user_id().unwrap_or("-"),
                        connected_for = ?session.connected_at.elapsed(),
                        reason = %reason,
                        "connection closed"
                    );
                }
            }
            HubEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Close every session with 1001 and empty the registry.
    ///
    /// Sessions leave the registry first; each socket is released by its
    /// connection task once the Close is written or the sender drops.
    pub fn shutdown(&mut self) {
        let sessions = self.registry.drain();
        info!(count = sessions.len(), "closing all connections");
        for session in sessions {
            session.close(CLOSE_GOING_AWAY, "server shutdown");
        }
    }

    fn on_connected(
        &mut self,
        id: ConnectionId,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<ConnCommand>,
        admitted: oneshot::Sender<Result<(), String>>,
    ) {
        if self.max_connections > 0 && self.registry.len() >= self.max_connections {
            warn!(conn = id, remote = %remote_addr, max = self.max_connections, "connection limit reached");
            let _ = admitted.send(Err("server at capacity".into()));
            return;
        }

        if let Err(e) = self.registry.register(Session::new(id, remote_addr, outbound)) {
            warn!(conn = id, error = %e, "could not register connection");
            let _ = admitted.send(Err(e.to_string()));
            return;
        }

        if admitted.send(Ok(())).is_err() {
            // The connection task gave up before the answer arrived.
            self.registry.remove(id);
            return;
        }

        info!(conn = id, remote = %remote_addr, "connection registered");
        let greeting = self.router.greeting(id);
        self.deliver(vec![greeting]);
    }

    /// Queue each delivery on its target. Sessions that cannot take the
    /// frame are dropped. Dropping the session drops its outbound sender, and
    /// the connection task closes the socket when it sees the channel close.
    fn deliver(&mut self, deliveries: Vec<Delivery>) {
        for Delivery { to, message } in deliveries {
            let frame = match message.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn = to, error = %e, "failed to encode outbound message");
                    continue;
                }
            };

            let Some(session) = self.registry.get(to) else {
                debug!(conn = to, "delivery target already gone");
                continue;
            };
            if let Err(e) = session.try_send(ConnCommand::Send(frame)) {
                warn!(conn = to, error = %e, "dropping slow or closed connection");
                self.registry.remove(to);
            }
        }
    }
}
