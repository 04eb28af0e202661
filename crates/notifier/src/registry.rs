//! Connection registry: live sessions per user, their lifecycle and liveness.
//!
//! Lifecycle:
//! - `Connecting → Open` once the server acknowledgement is written
//! - `Open → Closed` on client close, protocol error or missed heartbeat
//! - `Open → Closing → Closed` on graceful shutdown
//!
//! The registry is the only owner of connection state. Sessions hold a
//! [`Registration`] with their outbound queue and a close signal; closing a
//! connection fires the signal so both of its tasks stop immediately.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use herald_engine::processor::Presence;

use crate::frame::Frame;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a connection was closed. Logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ProtocolError,
    HeartbeatTimeout,
    Shutdown,
}

/// Public snapshot of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: Uuid,
    pub established_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub state: ConnectionState,
}

struct Entry {
    info: ConnectionInfo,
    last_seen: Instant,
    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
}

impl Entry {
    fn signal_close(&self) {
        // receivers may already be gone
        let _ = self.closed.send(true);
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    by_user: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl Inner {
    fn remove(&mut self, id: ConnectionId) -> Option<Entry> {
        let entry = self.connections.remove(&id)?;
        if let Some(ids) = self.by_user.get_mut(&entry.info.user_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&entry.info.user_id);
            }
        }
        Some(entry)
    }
}

/// What a session needs to drive one connection.
pub struct Registration {
    pub id: ConnectionId,
    pub user_id: Uuid,
    /// Frames queued for this connection by the dispatcher.
    pub outbound: mpsc::Receiver<Frame>,
    /// Flips to `true` when the registry closes this connection.
    pub closed: watch::Receiver<bool>,
}

/// Connection counts for health output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub open: usize,
    pub total: usize,
    pub users: usize,
}

pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    heartbeat_interval: Duration,
    outbound_capacity: usize,
}

impl ConnectionRegistry {
    /// A connection silent for `2 * heartbeat_interval` is considered dead.
    pub fn new(heartbeat_interval: Duration, outbound_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            heartbeat_interval,
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Add a new connection in `Connecting`. Other connections of the same
    /// user are untouched.
    pub fn register(&self, user_id: Uuid) -> Registration {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);

        let entry = Entry {
            info: ConnectionInfo {
                connection_id: id,
                user_id,
                established_at: now,
                last_seen_at: now,
                state: ConnectionState::Connecting,
            },
            last_seen: Instant::now(),
            outbound: outbound_tx,
            closed: closed_tx,
        };

        let mut inner = self.inner.write();
        inner.connections.insert(id, entry);
        let user_connections = inner.by_user.entry(user_id).or_default();
        user_connections.insert(id);
        let siblings = user_connections.len() - 1;
        drop(inner);

        tracing::info!(connection_id = %id, user_id = %user_id, siblings, "Connection registered");

        Registration {
            id,
            user_id,
            outbound: outbound_rx,
            closed: closed_rx,
        }
    }

    /// `Connecting → Open`. Returns false if the connection is not connecting.
    pub fn open(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write();
        match inner.connections.get_mut(&id) {
            Some(entry) if entry.info.state == ConnectionState::Connecting => {
                entry.info.state = ConnectionState::Open;
                entry.last_seen = Instant::now();
                entry.info.last_seen_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Record inbound traffic.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.write().connections.get_mut(&id) {
            entry.last_seen = Instant::now();
            entry.info.last_seen_at = Utc::now();
        }
    }

    /// Close and remove a connection immediately. Returns false if unknown.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let removed = self.inner.write().remove(id);
        match removed {
            Some(entry) => {
                entry.signal_close();
                tracing::info!(
                    connection_id = %id,
                    user_id = %entry.info.user_id,
                    reason = ?reason,
                    "Connection closed"
                );
                true
            }
            None => false,
        }
    }

    /// `Open → Closing`: stop accepting deliveries and tell the session to wind down.
    pub fn begin_close(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write();
        match inner.connections.get_mut(&id) {
            Some(entry)
                if matches!(
                    entry.info.state,
                    ConnectionState::Open | ConnectionState::Connecting
                ) =>
            {
                entry.info.state = ConnectionState::Closing;
                entry.signal_close();
                true
            }
            _ => false,
        }
    }

    /// Gracefully close every connection (server shutdown).
    pub fn shutdown_all(&self) -> usize {
        let ids: Vec<_> = self.inner.read().connections.keys().copied().collect();
        ids.into_iter().filter(|id| self.begin_close(*id)).count()
    }

    /// Current state; a removed connection reports `Closed`.
    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.inner
            .read()
            .connections
            .get(&id)
            .map_or(ConnectionState::Closed, |e| e.info.state)
    }

    pub fn connections_for(&self, user_id: Uuid) -> Vec<ConnectionInfo> {
        let inner = self.inner.read();
        inner
            .by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id))
            .map(|e| e.info.clone())
            .collect()
    }

    /// Queue `frame` on every open connection of `user_id`. Returns how many
    /// connections accepted it. A full or closed queue fails only that connection.
    pub fn send_to_user(&self, user_id: Uuid, frame: &Frame) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<Frame>)> = {
            let inner = self.inner.read();
            inner
                .by_user
                .get(&user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id))
                .filter(|e| e.info.state == ConnectionState::Open)
                .map(|e| (e.info.connection_id, e.outbound.clone()))
                .collect()
        };

        let mut accepted = 0;
        for (id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::debug!(connection_id = %id, error = %e, "Connection rejected frame");
                }
            }
        }
        accepted
    }

    /// Close every connection silent for longer than the heartbeat timeout, as of `now`.
    pub fn sweep_at(&self, now: Instant) -> Vec<ConnectionId> {
        let timeout = self.heartbeat_timeout();
        let stale: Vec<ConnectionId> = self
            .inner
            .read()
            .connections
            .values()
            .filter(|e| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|e| e.info.connection_id)
            .collect();

        stale
            .into_iter()
            .filter(|id| self.close(*id, CloseReason::HeartbeatTimeout))
            .collect()
    }

    pub fn sweep(&self) -> Vec<ConnectionId> {
        self.sweep_at(Instant::now())
    }

    pub fn counts(&self) -> ConnectionCounts {
        let inner = self.inner.read();
        ConnectionCounts {
            open: inner
                .connections
                .values()
                .filter(|e| e.info.state == ConnectionState::Open)
                .count(),
            total: inner.connections.len(),
            users: inner.by_user.len(),
        }
    }

    /// Run [`sweep`](Self::sweep) every `period`.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let closed = registry.sweep();
                if !closed.is_empty() {
                    tracing::info!(closed = closed.len(), "Swept stale connections");
                }
            }
        })
    }
}

impl Presence for ConnectionRegistry {
    fn is_online(&self, user_id: Uuid) -> bool {
        self.connections_for(user_id)
            .iter()
            .any(|c| c.state == ConnectionState::Open)
    }
}
