//! Live connections, indexed by connection id and by authenticated user id.
//!
//! The registry is owned by the hub task alone, so it needs no locking.
//! Every `by_user_id` entry points at a session present in
//! `by_connection_id` whose auth state names that same user.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wschat_core::{ChatError, ChatResult};

/// Server-assigned connection identifier, unique for the process lifetime.
pub type ConnectionId = u64;

/// Whether a connection has attached a user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated(String),
}

/// Work for a connection task, queued by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnCommand {
    /// Write an already-encoded frame.
    Send(Vec<u8>),
    /// Send a Close frame and end the connection.
    Close { code: u16, reason: String },
}

/// One upgraded connection as seen by the hub.
#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    auth_state: AuthState,
    outbound: mpsc::Sender<ConnCommand>,
}

impl Session {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, outbound: mpsc::Sender<ConnCommand>) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: Instant::now(),
            auth_state: AuthState::Unauthenticated,
            outbound,
        }
    }

    pub fn auth_state(&self) -> &AuthState {
        &self.auth_state
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.auth_state {
            AuthState::Authenticated(user) => Some(user),
            AuthState::Unauthenticated => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }

    /// Queue a command without waiting. Fails if the connection task has
    /// gone away or is not keeping up.
    pub fn try_send(&self, cmd: ConnCommand) -> ChatResult<()> {
        self.outbound.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ChatError::Transport(format!("outbound queue full for connection {}", self.id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                ChatError::Transport(format!("connection {} is closed", self.id))
            }
        })
    }

    /// Ask the connection to close. Consumes the session; once the sender
    /// drops, the connection task ends even if the Close could not be queued.
    pub fn close(self, code: u16, reason: &str) {
        let _ = self.try_send(ConnCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Result of [`Registry::authenticate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The user had no live connection before.
    New,
    /// The connection was already the user's current one.
    Unchanged,
    /// The user's previous connection lost its `by_user_id` entry.
    /// It stays registered and authenticated.
    Replaced(ConnectionId),
}

/// Registry of live sessions.
#[derive(Debug, Default)]
pub struct Registry {
    by_connection_id: HashMap<ConnectionId, Session>,
    by_user_id: HashMap<String, ConnectionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly upgraded connection.
    pub fn register(&mut self, session: Session) -> ChatResult<()> {
        if self.by_connection_id.contains_key(&session.id) {
            return Err(ChatError::Registry(format!(
                "connection {} is already registered",
                session.id
            )));
        }
        debug!(conn = session.id, remote = %session.remote_addr, "session registered");
        self.by_connection_id.insert(session.id, session);
        Ok(())
    }

    /// Bind `user_id` to connection `id`. The latest connection for a user
    /// wins the `by_user_id` slot.
    pub fn authenticate(&mut self, id: ConnectionId, user_id: &str) -> ChatResult<AuthOutcome> {
        let session = self
            .by_connection_id
            .get_mut(&id)
            .ok_or_else(|| ChatError::Registry(format!("unknown connection {id}")))?;

        if let AuthState::Authenticated(previous) = &session.auth_state {
            if previous != user_id && self.by_user_id.get(previous) == Some(&id) {
                self.by_user_id.remove(previous);
            }
        }
        session.auth_state = AuthState::Authenticated(user_id.to_string());

        let outcome = match self.by_user_id.insert(user_id.to_string(), id) {
            Some(prev) if prev == id => AuthOutcome::Unchanged,
            Some(prev) => AuthOutcome::Replaced(prev),
            None => AuthOutcome::New,
        };
        info!(conn = id, user = %user_id, ?outcome, "connection authenticated");
        Ok(outcome)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Session> {
        self.by_connection_id.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.by_connection_id.contains_key(&id)
    }

    /// The connection currently bound to `user_id`.
    pub fn lookup_user(&self, user_id: &str) -> Option<&Session> {
        self.by_user_id
            .get(user_id)
            .and_then(|id| self.by_connection_id.get(id))
    }

    /// Forget a connection. The user mapping is only dropped if it still
    /// points here; a newer connection for the same user keeps its slot.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Session> {
        let session = self.by_connection_id.remove(&id)?;
        if let Some(user) = session.user_id() {
            if self.by_user_id.get(user) == Some(&id) {
                self.by_user_id.remove(user);
            }
        }
        debug!(conn = id, "session removed");
        Some(session)
    }

    /// Remove every session, e.g. at shutdown.
    pub fn drain(&mut self) -> Vec<Session> {
        self.by_user_id.clear();
        self.by_connection_id.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.by_connection_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection_id.is_empty()
    }

    /// Number of users with a live connection.
    pub fn authenticated_count(&self) -> usize {
        self.by_user_id.len()
    }
}
