//! Interface address bookkeeping.

use ipnet::IpNet;

/// An interface address: IP plus prefix length.
///
/// IPv4 and IPv6 share one ordered type; all IPv4 addresses sort before IPv6.
pub type InetAddress = IpNet;

/// Sorted, duplicate-free set of interface addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addrs: Vec<InetAddress>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an address at its sorted position.
    ///
    /// Returns false if the address was already present.
    pub fn insert(&mut self, addr: InetAddress) -> bool {
        match self.addrs.binary_search(&addr) {
            Ok(_) => false,
            Err(pos) => {
                self.addrs.insert(pos, addr);
                true
            }
        }
    }

    /// Remove an address. Returns false if it was not present.
    pub fn remove(&mut self, addr: &InetAddress) -> bool {
        match self.addrs.binary_search(addr) {
            Ok(pos) => {
                self.addrs.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, addr: &InetAddress) -> bool {
        self.addrs.binary_search(addr).is_ok()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InetAddress> {
        self.addrs.iter()
    }

    pub fn as_slice(&self) -> &[InetAddress] {
        &self.addrs
    }

    pub fn to_vec(&self) -> Vec<InetAddress> {
        self.addrs.clone()
    }
}
