//! Connection records and the per-device connection table.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::notify::IoHandle;
use crate::stack::StackHandle;

/// Identity of a connection within one tap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Ethernet frames straight to the virtual wire, no stack involved
    Raw,
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unbound => "unbound",
            ConnectionState::Bound => "bound",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One application-visible transport endpoint.
///
/// The backend handle is only meaningful while the connection is open. Once
/// closed the record is kept until housekeeping reclaims it.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    socket_type: SocketType,
    state: ConnectionState,
    handle: Option<StackHandle>,
    io: Option<IoHandle>,
    closed_at: Option<Instant>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        socket_type: SocketType,
        handle: Option<StackHandle>,
        io: Option<IoHandle>,
    ) -> Self {
        Self {
            id,
            socket_type,
            state: ConnectionState::Unbound,
            handle,
            io,
            closed_at: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> Option<StackHandle> {
        self.handle
    }

    pub fn io(&self) -> Option<IoHandle> {
        self.io
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Move to `state`. Closed is terminal and only reachable through
    /// [`Connection::mark_closed`].
    pub fn set_state(&mut self, state: ConnectionState) {
        debug_assert!(state != ConnectionState::Closed, "use mark_closed");
        if !self.is_closed() {
            self.state = state;
        }
    }

    /// Transition to Closed and stamp the closure time.
    ///
    /// Returns false if the connection was already closed; the first
    /// timestamp is kept.
    pub fn mark_closed(&mut self, now: Instant) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = ConnectionState::Closed;
        self.closed_at = Some(now);
        true
    }

    pub fn take_handle(&mut self) -> Option<StackHandle> {
        self.handle.take()
    }

    pub fn take_io(&mut self) -> Option<IoHandle> {
        self.io.take()
    }

    /// Time since closure, or `None` while open.
    pub fn closed_for(&self, now: Instant) -> Option<Duration> {
        self.closed_at.map(|at| now.saturating_duration_since(at))
    }
}

/// All connection records of one tap device.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an identity and insert a fresh record.
    pub fn insert(
        &mut self,
        socket_type: SocketType,
        handle: Option<StackHandle>,
        io: Option<IoHandle>,
    ) -> ConnectionId {
        debug_assert!(
            handle.is_none_or(|h| self.find_by_handle(h).is_none()),
            "stack handle already owned by a live connection"
        );
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.conns.insert(id, Connection::new(id, socket_type, handle, io));
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn find_by_io(&self, io: IoHandle) -> Option<&Connection> {
        self.conns.values().find(|c| c.io == Some(io))
    }

    /// Live connection holding `handle`.
    pub fn find_by_handle(&self, handle: StackHandle) -> Option<&Connection> {
        self.conns
            .values()
            .find(|c| !c.is_closed() && c.handle == Some(handle))
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Remove every record.
    pub fn drain(&mut self) -> Vec<Connection> {
        std::mem::take(&mut self.conns).into_values().collect()
    }

    /// Remove and return every record matching `pred`.
    pub fn reclaim(&mut self, mut pred: impl FnMut(&Connection) -> bool) -> Vec<Connection> {
        let ids: Vec<_> = self
            .conns
            .values()
            .filter(|c| pred(c))
            .map(|c| c.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.conns.remove(&id))
            .collect()
    }
}
