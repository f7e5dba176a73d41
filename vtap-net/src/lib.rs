//! Virtual tap devices bridging an Ethernet-layer virtual wire to a
//! socket-style API on top of a pluggable userspace TCP/IP stack.
//!
//! Architecture:
//! - Each joined network gets one [`TapDevice`] with a dedicated background thread
//! - The thread drives the active [`StackAdapter`] (timers, retransmission, ARP)
//! - Inbound frames enter via [`TapDevice::put`], outbound frames leave via [`VirtualWire`]
//! - Socket calls arrive from the event-notification side and are serialized
//!   on the device's connection lock

pub mod addr;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod ethernet;
pub mod housekeeping;
pub mod multicast;
pub mod notify;
pub mod registry;
pub mod stack;
pub mod tap;
pub mod wire;

pub use addr::{AddressSet, InetAddress};
pub use backend::BackendKind;
pub use config::{TapConfig, TapSettings};
pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionTable, SocketType};
pub use error::{ERR_GENERAL_FAILURE, ERR_WOULD_BLOCK, SocketError, TapError};
pub use multicast::{GroupDiff, MulticastGroup, MulticastGroupTracker};
pub use notify::{EventFdNotifier, EventNotifier, IoHandle, LocalEvents};
pub use stack::{LinkInfo, LoopReport, StackAdapter, StackError, StackHandle, StackResult};
pub use tap::{TapBuilder, TapDevice};
pub use wire::{NetworkId, OutboundFrame, VirtualWire};

// Re-export smoltcp's MAC type so callers don't need a direct dependency
pub use smoltcp::wire::EthernetAddress;
