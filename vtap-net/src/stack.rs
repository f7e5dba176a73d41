//! Network-stack backend contract.
//!
//! A [`StackAdapter`] is one userspace TCP/IP stack driven by a tap device:
//! - interface registration per address (`init_interface`/`deinit_interface`)
//! - inbound frame injection and the run loop that emits outbound frames
//! - per-connection socket operations addressed by [`StackHandle`]
//!
//! All methods take `&self`. The tap calls socket operations from the
//! application side and `run_loop` from its background thread, so backends
//! guard their internals with their own locks.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use smoltcp::wire::EthernetAddress;
use thiserror::Error;
use tracing::warn;

use crate::addr::InetAddress;
use crate::connection::SocketType;
use crate::ethernet::EthernetHeader;
use crate::wire::{NetworkId, OutboundFrame, VirtualWire};

/// Opaque reference to a socket owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackHandle(pub u64);

impl fmt::Display for StackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("operation would block")]
    WouldBlock,

    #[error("socket is not connected")]
    NotConnected,

    #[error("unknown stack handle {0}")]
    InvalidHandle(StackHandle),

    #[error("invalid socket state: {0}")]
    InvalidState(&'static str),

    #[error("address not available: {0}")]
    AddrNotAvailable(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StackResult<T> = Result<T, StackError>;

/// Link-layer view of a tap device shared with its backend.
pub struct LinkInfo {
    name: String,
    index: u32,
    mac: EthernetAddress,
    mtu: AtomicU32,
    network_id: NetworkId,
    wire: Arc<dyn VirtualWire>,
}

impl LinkInfo {
    pub fn new(
        name: String,
        index: u32,
        mac: EthernetAddress,
        mtu: u32,
        network_id: NetworkId,
        wire: Arc<dyn VirtualWire>,
    ) -> Self {
        Self {
            name,
            index,
            mac,
            mtu: AtomicU32::new(mtu),
            network_id,
            wire,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }

    /// Returns true if the MTU changed.
    pub fn set_mtu(&self, mtu: u32) -> bool {
        self.mtu.swap(mtu, Ordering::AcqRel) != mtu
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    /// Hand a payload with explicit addressing to the virtual wire.
    pub fn deliver(&self, src: EthernetAddress, dst: EthernetAddress, ether_type: u16, payload: &[u8]) {
        self.wire.deliver(OutboundFrame {
            network_id: self.network_id,
            src,
            dst,
            ether_type,
            vlan_id: 0,
            payload,
        });
    }

    /// Hand a complete Ethernet frame built by a backend to the virtual wire.
    ///
    /// Returns false if the frame is too short to carry a header.
    pub fn emit(&self, frame: &[u8]) -> bool {
        match EthernetHeader::parse(frame) {
            Some((header, payload)) => {
                self.deliver(header.src, header.dst, header.ether_type, payload);
                true
            }
            None => {
                warn!(device = %self.name, len = frame.len(), "Dropping short frame from stack");
                false
            }
        }
    }
}

impl fmt::Debug for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkInfo")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("mac", &self.mac)
            .field("mtu", &self.mtu())
            .field("network_id", &self.network_id)
            .finish()
    }
}

/// Result of one run-loop iteration.
#[derive(Debug, Default)]
pub struct LoopReport {
    /// Delay until the backend needs to run again, if it has timers pending.
    pub next_poll: Option<Duration>,
    /// Sockets with data ready for the application.
    pub readable: Vec<StackHandle>,
}

pub trait StackAdapter: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Register `addr` on the interface.
    fn init_interface(&self, link: &LinkInfo, addr: &InetAddress) -> StackResult<()>;

    /// Remove `addr` from the interface.
    fn deinit_interface(&self, _link: &LinkInfo, _addr: &InetAddress) -> StackResult<()> {
        Err(StackError::Unsupported("address de-registration"))
    }

    /// Queue an inbound frame. Must not block for unbounded time.
    fn inject_frame(
        &self,
        link: &LinkInfo,
        from: EthernetAddress,
        to: EthernetAddress,
        ether_type: u16,
        data: &[u8],
    );

    /// Drive timers, process queued frames and emit outbound frames.
    fn run_loop(&self, link: &LinkInfo) -> LoopReport;

    fn socket(&self, socket_type: SocketType) -> StackResult<StackHandle>;

    fn connect(&self, handle: StackHandle, remote: SocketAddr) -> StackResult<()>;

    fn bind(&self, handle: StackHandle, local: SocketAddr) -> StackResult<()>;

    fn listen(&self, handle: StackHandle, backlog: usize) -> StackResult<()>;

    /// Take an established connection off a listening socket.
    fn accept(&self, handle: StackHandle) -> StackResult<StackHandle>;

    /// Feed buffered data to `sink`, which returns how many bytes it took.
    ///
    /// Returns the number of bytes consumed. `Ok(0)` on a stream socket means
    /// the peer closed its side.
    fn read(&self, handle: StackHandle, sink: &mut dyn FnMut(&[u8]) -> usize) -> StackResult<usize>;

    fn write(&self, handle: StackHandle, data: &[u8]) -> StackResult<usize>;

    /// Release the socket. The handle is invalid afterwards.
    fn close(&self, handle: StackHandle) -> StackResult<()>;
}
