//! Core server: accepts connections and hands each one to its own task.
//!
//! Owns the listener, assigns connection ids, spawns the hub, and runs the
//! shutdown sequence: stop accepting, tell the hub, give connections a
//! grace period to flush their Close frames, then abort what is left.

use crate::auth::{self, AuthBackend, AuthRateLimiter};
use crate::config::ServerConfig;
use crate::hub::{Hub, HubEvent, RegistryStats};
use crate::relay::{ConnectionId, Router};
use crate::transport::{self, ConnectionSettings};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use wschat_core::{ChatError, ChatResult};

/// Capacity of the connection-to-hub channel.
const HUB_QUEUE: usize = 1024;

/// The wschat server instance.
pub struct ChatServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    backend: Arc<dyn AuthBackend>,
    events_tx: mpsc::Sender<HubEvent>,
    events_rx: mpsc::Receiver<HubEvent>,
}

impl ChatServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(config: ServerConfig) -> ChatResult<Self> {
        let backend = auth::backend_from_config(&config.auth)?;
        let addr = config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChatError::Transport(format!("bind {addr} failed: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(HUB_QUEUE);

        Ok(Self {
            config,
            listener,
            local_addr,
            backend,
            events_tx,
            events_rx,
        })
    }

    /// Replace the auth backend chosen by the config.
    pub fn with_backend(mut self, backend: Arc<dyn AuthBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run in the background; the returned handle stops it.
    pub fn spawn(self) -> ServerHandle {
        let local_addr = self.local_addr;
        let events = self.events_tx.clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async {
            let _ = stop_rx.await;
        }));

        ServerHandle {
            local_addr,
            events,
            stop: stop_tx,
            task,
        }
    }

    /// Accept connections until `signal` completes, then shut down.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> ChatResult<()> {
        let ChatServer {
            config,
            listener,
            local_addr,
            backend,
            events_tx,
            events_rx,
        } = self;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let router = Router::new(
            config.identity_binding,
            backend,
            AuthRateLimiter::per_minute(config.auth.auth_attempts_per_minute),
        );
        let hub_task = tokio::spawn(
            Hub::new(router, config.max_connections).run(events_rx, shutdown_tx.subscribe()),
        );

        let settings = Arc::new(ConnectionSettings::from(&config));
        let mut connections = JoinSet::new();
        let mut next_id: ConnectionId = 1;

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            identity_binding = ?config.identity_binding,
            auth_backend = ?config.auth.backend,
            "wschat-server ready"
        );

        tokio::pin!(signal);
        let result = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("shutdown requested");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let id = next_id;
                        next_id += 1;
                        debug!(conn = id, remote = %remote, "accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(conn = id, error = %e, "set_nodelay failed");
                        }
                        connections.spawn(transport::serve(
                            stream,
                            remote,
                            id,
                            settings.clone(),
                            events_tx.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "accept failed, continuing");
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break Err(ChatError::Transport(format!("accept failed: {e}")));
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        };

        drop(listener);
        info!(open = connections.len(), "shutting down");
        let _ = shutdown_tx.send(());
        drop(events_tx);
        if let Err(e) = hub_task.await {
            warn!(error = %e, "hub task failed");
        }

        let grace = config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), ?grace, "grace period elapsed, aborting connections");
            connections.shutdown().await;
        }

        info!("wschat-server stopped");
        result
    }
}

/// Accept errors that only concern the one failed connection.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Control handle for a server started with [`ChatServer::spawn`].
///
/// Dropping the handle also stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    events: mpsc::Sender<HubEvent>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<ChatResult<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current registry counts, as seen by the hub.
    pub async fn stats(&self) -> ChatResult<RegistryStats> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(HubEvent::Stats(tx))
            .await
            .map_err(|_| ChatError::Transport("hub stopped".into()))?;
        rx.await
            .map_err(|_| ChatError::Transport("hub stopped".into()))
    }

    /// Stop accepting, close every connection, and wait for the server task.
    pub async fn shutdown(self) -> ChatResult<()> {
        let _ = self.stop.send(());
        self.task
            .await
            .map_err(|e| ChatError::Transport(format!("server task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.bind = "127.0.0.1".parse().unwrap();
        config.port = 0;
        config
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn binds_ephemeral_port_and_stops() {
        let server = ChatServer::bind(local_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let handle = server.spawn();
        assert_eq!(handle.stats().await.unwrap(), RegistryStats::default());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn hmac_without_secret_fails_to_bind() {
        let mut config = local_config();
        config.auth.backend = crate::config::BackendKind::Hmac;
        assert!(matches!(
            ChatServer::bind(config).await,
            Err(ChatError::Config(_))
        ));
    }
}
