//! Per-connection session state.
//!
//! A session exists from accept until the connection closes. Authentication
//! is a flag on the session; nothing survives a disconnect.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::ServerFrame;
use crate::monitor::Pid;

/// Identifier of one control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct Session {
    authenticated: bool,
    peer_pid: Option<Pid>,
    outbound: mpsc::UnboundedSender<ServerFrame>,
}

/// All live control connections.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new, unauthenticated connection.
    pub fn register(
        &self,
        peer_pid: Option<Pid>,
        outbound: mpsc::UnboundedSender<ServerFrame>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        self.sessions.lock().insert(
            id,
            Session {
                authenticated: false,
                peer_pid,
                outbound,
            },
        );
        id
    }

    /// Mark `id` authenticated. Returns `false` for an unknown connection.
    pub fn mark_authenticated(&self, id: ConnectionId) -> bool {
        match self.sessions.lock().get_mut(&id) {
            Some(session) => {
                session.authenticated = true;
                true
            }
            None => false,
        }
    }

    /// Whether `id` completed the handshake.
    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.sessions
            .lock()
            .get(&id)
            .is_some_and(|s| s.authenticated)
    }

    /// Peer process id captured at accept time.
    pub fn peer_pid(&self, id: ConnectionId) -> Option<Pid> {
        self.sessions.lock().get(&id).and_then(|s| s.peer_pid)
    }

    /// Forget `id`.
    pub fn remove(&self, id: ConnectionId) {
        self.sessions.lock().remove(&id);
    }

    /// Number of authenticated connections.
    pub fn authenticated_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.authenticated)
            .count()
    }

    /// Queue `frame` to every authenticated connection.
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast_authenticated(&self, frame: &ServerFrame) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.authenticated)
            .filter(|s| s.outbound.send(frame.clone()).is_ok())
            .count()
    }
}
