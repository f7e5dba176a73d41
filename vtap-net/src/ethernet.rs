//! Ethernet header parsing and building using smoltcp

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};

/// Ethernet header size
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Addressing fields of an Ethernet II header, in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: EthernetAddress,
    pub src: EthernetAddress,
    pub ether_type: u16,
}

impl EthernetHeader {
    /// Split a raw frame into its header and payload.
    ///
    /// Returns `None` if the frame is shorter than an Ethernet header.
    pub fn parse(data: &[u8]) -> Option<(Self, &[u8])> {
        let frame = EthernetFrame::new_checked(data).ok()?;
        let header = Self {
            dst: frame.dst_addr(),
            src: frame.src_addr(),
            ether_type: u16::from(frame.ethertype()),
        };
        Some((header, &data[ETHERNET_HEADER_LEN..]))
    }

    /// Build a complete frame carrying `payload`.
    pub fn emit(&self, payload: &[u8]) -> Vec<u8> {
        let repr = EthernetRepr {
            src_addr: self.src,
            dst_addr: self.dst,
            ethertype: EthernetProtocol::from(self.ether_type),
        };

        let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
        let mut frame = EthernetFrame::new_unchecked(&mut buffer);
        repr.emit(&mut frame);
        frame.payload_mut().copy_from_slice(payload);
        buffer
    }
}
