//! Virtual-wire side of a tap device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smoltcp::wire::EthernetAddress;

/// 64-bit identifier of a virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map(NetworkId)
            .map_err(|e| format!("invalid network id {s:?}: {e}"))
    }
}

/// An Ethernet frame leaving the tap towards the virtual wire.
///
/// The payload excludes the 14-byte Ethernet header; addressing and
/// ethertype are carried separately, in host byte order.
#[derive(Debug, Clone, Copy)]
pub struct OutboundFrame<'a> {
    pub network_id: NetworkId,
    pub src: EthernetAddress,
    pub dst: EthernetAddress,
    pub ether_type: u16,
    pub vlan_id: u32,
    pub payload: &'a [u8],
}

/// Frame delivery callback into the virtual-wire transport.
///
/// Invoked synchronously from the write path and from the stack's emit path.
/// Implementations must not call back into the same tap's socket API.
pub trait VirtualWire: Send + Sync {
    fn deliver(&self, frame: OutboundFrame<'_>);
}

impl<F> VirtualWire for F
where
    F: Fn(OutboundFrame<'_>) + Send + Sync,
{
    fn deliver(&self, frame: OutboundFrame<'_>) {
        self(frame)
    }
}
