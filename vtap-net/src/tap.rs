//! Tap device: one virtual interface on a joined network.
//!
//! Architecture:
//! - A dedicated thread (`vtap<N>`) drives the stack's run loop, pushes
//!   readable stack data to application handles and runs housekeeping
//! - The address lock guards the address set and the multicast snapshot
//! - The connection lock guards the connection table and every socket call
//! - `read` takes neither lock; it resolves its route through an `ArcSwap`
//!   snapshot that is republished under the connection lock
//!
//! Shutdown clears the run flag, wakes the notifier and always joins.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use tracing::{debug, error, info, warn};

use crate::addr::{AddressSet, InetAddress};
use crate::backend;
use crate::config::{TapConfig, TapSettings};
use crate::connection::{Connection, ConnectionId, ConnectionState, ConnectionTable, SocketType};
use crate::error::{SocketError, TapError};
use crate::ethernet::EthernetHeader;
use crate::housekeeping::Sweeper;
use crate::multicast::{GroupDiff, MulticastGroupTracker};
use crate::notify::{EventFdNotifier, EventNotifier, IoHandle, LocalEvents};
use crate::registry;
use crate::stack::{LinkInfo, StackAdapter, StackHandle};
use crate::wire::{NetworkId, VirtualWire};

#[derive(Debug, Default)]
struct AddressState {
    set: AddressSet,
    groups: MulticastGroupTracker,
}

#[derive(Debug)]
struct ConnState {
    table: ConnectionTable,
    sweeper: Sweeper,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    handle: StackHandle,
    socket_type: SocketType,
}

/// Read routing snapshot, rebuilt on every connection change.
#[derive(Debug, Default, Clone)]
struct ReadRoutes {
    by_io: HashMap<IoHandle, Route>,
    by_handle: HashMap<StackHandle, IoHandle>,
}

struct Inner {
    link: Arc<LinkInfo>,
    metric: u32,
    storage_path: PathBuf,
    friendly_name: Mutex<Option<String>>,
    enabled: AtomicBool,
    run: AtomicBool,
    adapter: Option<Arc<dyn StackAdapter>>,
    notifier: Arc<dyn EventNotifier>,
    addrs: Mutex<AddressState>,
    conns: Mutex<ConnState>,
    routes: ArcSwap<ReadRoutes>,
    listener: Mutex<Option<IoHandle>>,
    settings: TapSettings,
}

impl Inner {
    fn name(&self) -> &str {
        self.link.name()
    }

    fn adapter(&self) -> Result<&Arc<dyn StackAdapter>, SocketError> {
        self.adapter.as_ref().ok_or(SocketError::NoBackend)
    }

    /// Background loop body.
    fn run(&self) {
        info!(device = %self.name(), "Tap thread started");
        while self.run.load(Ordering::Acquire) {
            let mut wait = self.settings.max_idle_wait();

            if self.enabled.load(Ordering::Acquire)
                && let Some(adapter) = &self.adapter
            {
                let report = adapter.run_loop(&self.link);
                for handle in report.readable {
                    self.read_ready(handle);
                }
                if let Some(next) = report.next_poll {
                    wait = wait.min(next);
                }
            }

            self.housekeeping_at(Instant::now());

            if !self.run.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = self.notifier.wait(wait) {
                warn!(device = %self.name(), error = %e, "Notifier wait failed");
            }
        }
        info!(device = %self.name(), "Tap thread stopped");
    }

    /// Push stack data for `handle` to its application handle, if routed.
    fn read_ready(&self, handle: StackHandle) {
        let io = self.routes.load().by_handle.get(&handle).copied();
        if let Some(io) = io
            && let Err(e) = self.read(io)
            && !e.is_would_block()
        {
            debug!(device = %self.name(), %io, error = %e, "Stack read failed");
        }
    }

    fn read(&self, io: IoHandle) -> Result<usize, SocketError> {
        let route = self
            .routes
            .load()
            .by_io
            .get(&io)
            .copied()
            .ok_or(SocketError::UnknownHandle(io))?;
        let adapter = self.adapter()?;

        let notifier = &self.notifier;
        let mut sink = |data: &[u8]| match notifier.deliver(io, data) {
            Ok(n) => n,
            Err(e) => {
                warn!(%io, error = %e, "Failed to deliver to application");
                0
            }
        };

        let n = adapter.read(route.handle, &mut sink)?;
        if n == 0 && route.socket_type == SocketType::Stream {
            debug!(device = %self.name(), %io, "Peer closed stream");
            notifier.close(io);
        }
        Ok(n)
    }

    fn housekeeping_at(&self, now: Instant) {
        let mut guard = self.conns.lock();
        let st = &mut *guard;
        let Some(reclaimed) = st.sweeper.sweep(&mut st.table, now) else {
            return;
        };
        if reclaimed.is_empty() {
            return;
        }
        let count = reclaimed.len();
        // Released while the table lock is still held
        for conn in reclaimed {
            self.release(conn);
        }
        debug!(device = %self.name(), count, "Reclaimed closed connections");
    }

    /// Free whatever backend and I/O resources a dropped record still holds.
    fn release(&self, conn: Connection) {
        if let Some(handle) = conn.handle()
            && let Some(adapter) = &self.adapter
            && let Err(e) = adapter.close(handle)
        {
            debug!(device = %self.name(), conn = %conn.id(), error = %e, "Backend release failed");
        }
        if let Some(io) = conn.io() {
            self.notifier.close(io);
        }
    }

    fn route(&self, io: IoHandle, handle: StackHandle, socket_type: SocketType) {
        self.routes.rcu(|routes| {
            let mut routes = ReadRoutes::clone(routes);
            routes.by_io.insert(io, Route { handle, socket_type });
            routes.by_handle.insert(handle, io);
            routes
        });
    }

    fn unroute(&self, io: Option<IoHandle>, handle: Option<StackHandle>) {
        if io.is_none() && handle.is_none() {
            return;
        }
        self.routes.rcu(|routes| {
            let mut routes = ReadRoutes::clone(routes);
            if let Some(io) = io {
                routes.by_io.remove(&io);
            }
            if let Some(handle) = handle {
                routes.by_handle.remove(&handle);
            }
            routes
        });
    }
}

/// Open connection with a backend socket, for an operation named `op`.
fn live<'a>(
    st: &'a mut ConnState,
    id: ConnectionId,
    op: &'static str,
) -> Result<(&'a mut Connection, StackHandle), SocketError> {
    let conn = st
        .table
        .get_mut(id)
        .ok_or(SocketError::InvalidConnection(id))?;
    match conn.handle() {
        Some(handle) if !conn.is_closed() => Ok((conn, handle)),
        _ => Err(SocketError::InvalidState {
            id,
            state: conn.state(),
            op,
        }),
    }
}

/// Builder for [`TapDevice`].
pub struct TapBuilder {
    config: TapConfig,
    wire: Arc<dyn VirtualWire>,
    notifier: Option<Arc<dyn EventNotifier>>,
    adapter: Option<Option<Arc<dyn StackAdapter>>>,
}

impl TapBuilder {
    /// Use `notifier` instead of a private eventfd notifier.
    pub fn notifier(mut self, notifier: Arc<dyn EventNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use `adapter` instead of the backend named in the config.
    pub fn adapter(mut self, adapter: Option<Arc<dyn StackAdapter>>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn spawn(self) -> Result<TapDevice, TapError> {
        let config = self.config;
        let index = registry::allocate_index();
        let name = registry::device_name(index);
        let link = Arc::new(LinkInfo::new(
            name.clone(),
            index,
            config.mac,
            config.mtu,
            config.network_id,
            self.wire,
        ));

        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => backend::select(config.backend, &link, &config.settings),
        };
        let notifier: Arc<dyn EventNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(EventFdNotifier::new().map_err(TapError::Notifier)?),
        };

        let sweeper = Sweeper::new(
            config.settings.housekeeping_interval(),
            config.settings.connection_grace(),
        );
        let backend_name = adapter.as_ref().map_or("none", |a| a.name());

        let inner = Arc::new(Inner {
            link: link.clone(),
            metric: config.metric,
            storage_path: config.storage_path,
            friendly_name: Mutex::new(None),
            enabled: AtomicBool::new(true),
            run: AtomicBool::new(true),
            adapter,
            notifier,
            addrs: Mutex::new(AddressState::default()),
            conns: Mutex::new(ConnState {
                table: ConnectionTable::new(),
                sweeper,
            }),
            routes: ArcSwap::from_pointee(ReadRoutes::default()),
            listener: Mutex::new(None),
            settings: config.settings,
        });

        registry::register(&link);

        let thread_inner = inner.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || thread_inner.run())
            .map_err(TapError::Spawn)?;

        info!(
            device = %name,
            mac = %config.mac,
            mtu = config.mtu,
            network_id = %config.network_id,
            backend = backend_name,
            "Tap device created"
        );

        Ok(TapDevice {
            inner,
            thread: Some(thread),
        })
    }
}

/// A virtual network interface on one joined network.
pub struct TapDevice {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl TapDevice {
    pub fn builder(config: TapConfig, wire: Arc<dyn VirtualWire>) -> TapBuilder {
        TapBuilder {
            config,
            wire,
            notifier: None,
            adapter: None,
        }
    }

    /// Create a device with the configured backend and an eventfd notifier.
    pub fn create(config: TapConfig, wire: Arc<dyn VirtualWire>) -> Result<Self, TapError> {
        Self::builder(config, wire).spawn()
    }

    /// Stop the background thread and release every resource.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let inner = &self.inner;

        inner.run.store(false, Ordering::Release);
        inner.notifier.wake();
        if thread.join().is_err() {
            error!(device = %inner.name(), "Tap thread panicked");
        }

        if let Some(io) = inner.listener.lock().take() {
            inner.notifier.close(io);
        }

        let mut conns = inner.conns.lock();
        let remaining = conns.table.drain();
        let count = remaining.len();
        for conn in remaining {
            inner.release(conn);
        }
        inner.routes.store(Arc::new(ReadRoutes::default()));
        drop(conns);

        info!(device = %inner.name(), released = count, "Tap device destroyed");
    }

    /// Whether the background thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        self.inner.notifier.wake();
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn device_name(&self) -> &str {
        self.inner.name()
    }

    pub fn index(&self) -> u32 {
        self.inner.link.index()
    }

    pub fn mac(&self) -> EthernetAddress {
        self.inner.link.mac()
    }

    pub fn mtu(&self) -> u32 {
        self.inner.link.mtu()
    }

    pub fn set_mtu(&self, mtu: u32) {
        if self.inner.link.set_mtu(mtu) {
            info!(device = %self.device_name(), mtu, "MTU changed");
        }
    }

    pub fn metric(&self) -> u32 {
        self.inner.metric
    }

    pub fn network_id(&self) -> NetworkId {
        self.inner.link.network_id()
    }

    pub fn storage_path(&self) -> &Path {
        &self.inner.storage_path
    }

    pub fn set_friendly_name(&self, name: &str) {
        *self.inner.friendly_name.lock() = Some(name.to_string());
        debug!(device = %self.device_name(), friendly_name = name, "Friendly name set");
    }

    pub fn friendly_name(&self) -> Option<String> {
        self.inner.friendly_name.lock().clone()
    }

    /// Record the local listening handle closed at destruction.
    pub fn set_local_listener(&self, io: IoHandle) {
        if let Some(old) = self.inner.listener.lock().replace(io) {
            self.inner.notifier.close(old);
        }
    }

    /// Register `addr` with the stack and add it to the address set.
    ///
    /// Returns false without a backend, if the address is already present,
    /// or if the stack rejects it. The set is untouched on failure.
    pub fn add_address(&self, addr: InetAddress) -> bool {
        let Some(adapter) = &self.inner.adapter else {
            return false;
        };
        let mut addrs = self.inner.addrs.lock();
        if addrs.set.contains(&addr) {
            return false;
        }
        if let Err(e) = adapter.init_interface(&self.inner.link, &addr) {
            warn!(device = %self.device_name(), %addr, error = %e, "Address registration failed");
            return false;
        }
        addrs.set.insert(addr);
        info!(device = %self.device_name(), %addr, "Address added");
        true
    }

    /// Remove `addr`, de-registering it from the stack. Returns false if absent.
    pub fn remove_address(&self, addr: &InetAddress) -> bool {
        let mut addrs = self.inner.addrs.lock();
        if !addrs.set.contains(addr) {
            return false;
        }
        if let Some(adapter) = &self.inner.adapter
            && let Err(e) = adapter.deinit_interface(&self.inner.link, addr)
        {
            warn!(device = %self.device_name(), %addr, error = %e, "Stack kept stale address registration");
        }
        addrs.set.remove(addr);
        info!(device = %self.device_name(), %addr, "Address removed");
        true
    }

    pub fn addresses(&self) -> Vec<InetAddress> {
        self.inner.addrs.lock().set.to_vec()
    }

    /// Recompute the multicast groups for the current addresses and return
    /// what changed since the last scan.
    pub fn scan_multicast_groups(&self) -> GroupDiff {
        let mut guard = self.inner.addrs.lock();
        let st = &mut *guard;
        st.groups.scan(st.set.iter())
    }

    /// Inbound frame from the virtual wire.
    pub fn put(&self, from: EthernetAddress, to: EthernetAddress, ether_type: u16, data: &[u8]) {
        let Some(adapter) = &self.inner.adapter else {
            return;
        };
        if !self.enabled() {
            return;
        }
        adapter.inject_frame(&self.inner.link, from, to, ether_type, data);
        self.inner.notifier.wake();
    }

    /// Create a connection. Raw sockets need no backend.
    pub fn socket(&self, socket_type: SocketType, io: Option<IoHandle>) -> Result<ConnectionId, SocketError> {
        let mut conns = self.inner.conns.lock();
        let handle = match socket_type {
            SocketType::Raw => None,
            _ => Some(self.inner.adapter()?.socket(socket_type)?),
        };
        let id = conns.table.insert(socket_type, handle, io);
        if let (Some(io), Some(handle)) = (io, handle) {
            self.inner.route(io, handle, socket_type);
        }
        debug!(device = %self.device_name(), conn = %id, ?socket_type, "Socket created");
        Ok(id)
    }

    pub fn connect(&self, id: ConnectionId, remote: SocketAddr) -> Result<(), SocketError> {
        let mut conns = self.inner.conns.lock();
        let adapter = self.inner.adapter()?;
        let (conn, handle) = live(&mut conns, id, "connect")?;
        adapter.connect(handle, remote)?;
        conn.set_state(match conn.socket_type() {
            SocketType::Stream => ConnectionState::Connecting,
            _ => ConnectionState::Connected,
        });
        debug!(device = %self.device_name(), conn = %id, %remote, "Connecting");
        self.inner.notifier.wake();
        Ok(())
    }

    pub fn bind(&self, id: ConnectionId, local: SocketAddr) -> Result<(), SocketError> {
        let mut conns = self.inner.conns.lock();
        let adapter = self.inner.adapter()?;
        let (conn, handle) = live(&mut conns, id, "bind")?;
        adapter.bind(handle, local)?;
        conn.set_state(ConnectionState::Bound);
        debug!(device = %self.device_name(), conn = %id, %local, "Bound");
        Ok(())
    }

    pub fn listen(&self, id: ConnectionId, backlog: usize) -> Result<(), SocketError> {
        let mut conns = self.inner.conns.lock();
        let adapter = self.inner.adapter()?;
        let (conn, handle) = live(&mut conns, id, "listen")?;
        adapter.listen(handle, backlog)?;
        conn.set_state(ConnectionState::Listening);
        debug!(device = %self.device_name(), conn = %id, backlog, "Listening");
        Ok(())
    }

    /// Take an established connection off a listening one.
    pub fn accept(&self, id: ConnectionId, io: Option<IoHandle>) -> Result<ConnectionId, SocketError> {
        let mut conns = self.inner.conns.lock();
        let adapter = self.inner.adapter()?;
        let (conn, handle) = live(&mut conns, id, "accept")?;
        if conn.state() != ConnectionState::Listening {
            return Err(SocketError::InvalidState {
                id,
                state: conn.state(),
                op: "accept",
            });
        }

        let accepted = adapter.accept(handle)?;
        let new_id = conns.table.insert(SocketType::Stream, Some(accepted), io);
        if let Some(conn) = conns.table.get_mut(new_id) {
            conn.set_state(ConnectionState::Connected);
        }
        if let Some(io) = io {
            self.inner.route(io, accepted, SocketType::Stream);
        }
        debug!(device = %self.device_name(), listener = %id, conn = %new_id, "Accepted");
        self.inner.notifier.wake();
        Ok(new_id)
    }

    /// Send application data. Raw connections go straight to the wire.
    pub fn write(&self, id: ConnectionId, data: &[u8]) -> Result<usize, SocketError> {
        let mut conns = self.inner.conns.lock();
        let conn = conns
            .table
            .get_mut(id)
            .ok_or(SocketError::InvalidConnection(id))?;
        if conn.is_closed() {
            return Err(SocketError::InvalidState {
                id,
                state: conn.state(),
                op: "write",
            });
        }

        if conn.socket_type() == SocketType::Raw {
            let (header, payload) =
                EthernetHeader::parse(data).ok_or(SocketError::InvalidFrame(data.len()))?;
            self.inner
                .link
                .deliver(header.src, header.dst, header.ether_type, payload);
            return Ok(data.len());
        }

        let adapter = self.inner.adapter()?;
        let (conn, handle) = live(&mut conns, id, "write")?;
        let n = adapter.write(handle, data)?;
        if conn.state() == ConnectionState::Connecting {
            conn.set_state(ConnectionState::Connected);
        }
        self.inner.notifier.wake();
        Ok(n)
    }

    /// Pull stack data for `io` into the application. Takes no device lock.
    pub fn read(&self, io: IoHandle) -> Result<usize, SocketError> {
        self.inner.read(io)
    }

    /// Close a connection. The record stays in the table until housekeeping
    /// reclaims it.
    pub fn close(&self, id: ConnectionId) -> Result<(), SocketError> {
        let mut conns = self.inner.conns.lock();
        let Some(conn) = conns.table.get_mut(id) else {
            error!(device = %self.device_name(), conn = %id, "Close on unknown connection");
            return Err(SocketError::InvalidConnection(id));
        };
        if conn.is_closed() {
            error!(device = %self.device_name(), conn = %id, "Connection already closed");
            return Err(SocketError::InvalidState {
                id,
                state: conn.state(),
                op: "close",
            });
        }

        let listening = conn.state() == ConnectionState::Listening;
        let handle = conn.handle();
        // A listener keeps its I/O handle until the record is reclaimed
        let io = if listening { conn.io() } else { conn.take_io() };

        let mut result = Ok(());
        if let Some(h) = handle
            && let Some(adapter) = &self.inner.adapter
        {
            match adapter.close(h) {
                Ok(()) => {
                    conn.take_handle();
                }
                // Handle is kept so housekeeping retries the release
                Err(e) => result = Err(SocketError::from(e)),
            }
        }

        // A listening socket was never wrapped by the notification layer
        if !listening && let Some(io) = io {
            self.inner.notifier.release(io);
            self.inner.notifier.close(io);
        }

        conn.mark_closed(Instant::now());
        self.inner.unroute(io, handle);
        debug!(device = %self.device_name(), conn = %id, listening, "Connection closed");
        result
    }

    /// Reclaim closed connections past their grace period, if a sweep is due.
    pub fn housekeeping(&self) {
        self.inner.housekeeping_at(Instant::now());
    }

    /// Same as [`TapDevice::housekeeping`] with an explicit clock.
    pub fn housekeeping_at(&self, now: Instant) {
        self.inner.housekeeping_at(now);
    }

    /// Snapshot of one connection record.
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.conns.lock().table.get(id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().table.len()
    }

    /// Connection currently bound to `io`.
    pub fn connection_for(&self, io: IoHandle) -> Option<ConnectionId> {
        self.inner
            .conns
            .lock()
            .table
            .find_by_io(io)
            .filter(|c| !c.is_closed())
            .map(|c| c.id())
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LocalEvents for TapDevice {
    fn on_local_close(&self, io: IoHandle) {
        if let Some(id) = self.connection_for(io)
            && let Err(e) = self.close(id)
        {
            warn!(device = %self.device_name(), %io, error = %e, "Close after local hangup failed");
        }
    }

    fn on_local_data(&self, io: IoHandle, data: &[u8]) {
        let Some(id) = self.connection_for(io) else {
            debug!(device = %self.device_name(), %io, "Data on unbound handle");
            return;
        };
        match self.write(id, data) {
            Ok(n) if n < data.len() => {
                warn!(device = %self.device_name(), conn = %id, dropped = data.len() - n, "Short write");
            }
            Ok(_) => {}
            Err(e) => warn!(device = %self.device_name(), conn = %id, error = %e, "Write failed"),
        }
    }

    fn on_local_writable(&self, io: IoHandle) {
        match self.read(io) {
            Ok(_) | Err(SocketError::UnknownHandle(_)) => {}
            Err(e) if e.is_would_block() => {}
            Err(e) => debug!(device = %self.device_name(), %io, error = %e, "Read failed"),
        }
    }
}
