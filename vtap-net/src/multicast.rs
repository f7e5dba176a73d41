//! Multicast groups implied by interface addresses.
//!
//! The virtual wire only forwards multicast frames to members of a group, so
//! every interface address must subscribe to the group its peers use for
//! address resolution:
//! - IPv4: broadcast MAC, scoped by the target address (ARP)
//! - IPv6: solicited-node MAC `33:33:ff:xx:xx:xx` (NDP)

use std::fmt;
use std::net::IpAddr;

use smoltcp::wire::EthernetAddress;

use crate::addr::InetAddress;

/// A multicast group on the virtual wire: MAC plus additional distinguishing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MulticastGroup {
    mac: [u8; 6],
    adi: u32,
}

impl MulticastGroup {
    pub const fn new(mac: EthernetAddress, adi: u32) -> Self {
        Self { mac: mac.0, adi }
    }

    /// Derive the group peers use to resolve `ip` to a MAC address.
    pub fn for_address_resolution(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                mac: [0xff; 6],
                adi: u32::from(v4),
            },
            IpAddr::V6(v6) => {
                let o = v6.octets();
                Self {
                    mac: [0x33, 0x33, 0xff, o[13], o[14], o[15]],
                    adi: 0,
                }
            }
        }
    }

    pub fn mac(&self) -> EthernetAddress {
        EthernetAddress(self.mac)
    }

    pub fn adi(&self) -> u32 {
        self.adi
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.mac(), self.adi)
    }
}

/// Result of a multicast scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDiff {
    /// Groups to subscribe to
    pub added: Vec<MulticastGroup>,
    /// Groups to leave
    pub removed: Vec<MulticastGroup>,
}

impl GroupDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Remembers the last announced group set and diffs new address sets against it.
#[derive(Debug, Clone, Default)]
pub struct MulticastGroupTracker {
    /// Sorted and deduplicated
    groups: Vec<MulticastGroup>,
}

impl MulticastGroupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The group set recorded by the last scan.
    pub fn groups(&self) -> &[MulticastGroup] {
        &self.groups
    }

    /// Recompute groups for `addrs`, diff against the recorded set, and swap the new set in.
    pub fn scan<'a>(&mut self, addrs: impl IntoIterator<Item = &'a InetAddress>) -> GroupDiff {
        let mut next: Vec<MulticastGroup> = addrs
            .into_iter()
            .map(|a| MulticastGroup::for_address_resolution(a.addr()))
            .collect();
        next.sort_unstable();
        next.dedup();

        let added = next
            .iter()
            .filter(|g| self.groups.binary_search(g).is_err())
            .copied()
            .collect();
        let removed = self
            .groups
            .iter()
            .filter(|g| next.binary_search(g).is_err())
            .copied()
            .collect();

        self.groups = next;
        GroupDiff { added, removed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> InetAddress {
        s.parse().unwrap()
    }

    fn group(s: &str) -> MulticastGroup {
        MulticastGroup::for_address_resolution(net(s).addr())
    }

    #[test]
    fn test_ipv4_group() {
        let g = group("10.1.2.3/24");
        assert_eq!(g.mac(), EthernetAddress::BROADCAST);
        assert_eq!(g.adi(), 0x0a01_0203);
    }

    #[test]
    fn test_ipv6_solicited_node_group() {
        let g = group("fd00::aa:bbcc:ddee/64");
        assert_eq!(g.mac(), EthernetAddress([0x33, 0x33, 0xff, 0xcc, 0xdd, 0xee]));
        assert_eq!(g.adi(), 0);
        assert!(g.to_string().ends_with("/00000000"));
    }

    #[test]
    fn test_prefix_length_does_not_matter() {
        assert_eq!(group("10.0.0.1/8"), group("10.0.0.1/24"));
    }

    #[test]
    fn test_scan_from_empty() {
        let mut tracker = MulticastGroupTracker::new();
        let addrs = vec![net("10.0.0.1/24")];

        let diff = tracker.scan(&addrs);
        assert_eq!(diff.added, vec![group("10.0.0.1/24")]);
        assert!(diff.removed.is_empty());
        assert_eq!(tracker.groups(), &[group("10.0.0.1/24")]);
    }

    #[test]
    fn test_scan_idempotent() {
        let mut tracker = MulticastGroupTracker::new();
        let addrs = vec![net("10.0.0.1/24"), net("fd00::1/64")];

        assert!(!tracker.scan(&addrs).is_empty());
        assert!(tracker.scan(&addrs).is_empty());
    }

    #[test]
    fn test_scan_overlapping() {
        let mut tracker = MulticastGroupTracker::new();
        tracker.scan(&[net("10.0.0.1/24"), net("10.0.0.2/24")]);

        let diff = tracker.scan(&[net("10.0.0.2/24"), net("10.0.0.3/24")]);
        assert_eq!(diff.added, vec![group("10.0.0.3/24")]);
        assert_eq!(diff.removed, vec![group("10.0.0.1/24")]);
    }

    #[test]
    fn test_scan_disjoint() {
        let mut tracker = MulticastGroupTracker::new();
        tracker.scan(&[net("10.0.0.1/24"), net("fd00::1/64")]);

        let diff = tracker.scan(&[net("192.168.0.1/24")]);
        assert_eq!(diff.added, vec![group("192.168.0.1/24")]);
        let mut expected_removed = vec![group("10.0.0.1/24"), group("fd00::1/64")];
        expected_removed.sort();
        assert_eq!(diff.removed, expected_removed);
    }

    #[test]
    fn test_scan_collapses_shared_ipv6_groups() {
        // Two IPv6 addresses with the same low 24 bits share a solicited-node group
        let mut tracker = MulticastGroupTracker::new();
        let diff = tracker.scan(&[net("fd00::1:2:3/64"), net("fd01::7:2:3/64")]);
        assert_eq!(diff.added.len(), 1);
    }
}
