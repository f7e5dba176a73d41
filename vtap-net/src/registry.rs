//! Process-wide registry of tap devices.
//!
//! Every device gets the next index from a process-wide counter and is
//! appended to the registry under a lock. Neither is ever shrunk or reset:
//! indices are not reused, so a stale name in a log never points at a newer
//! device. Entries hold weak references and report inactive once the device
//! is gone.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use crate::stack::LinkInfo;

static NEXT_INDEX: AtomicU32 = AtomicU32::new(0);

static DEVICES: LazyLock<Mutex<Vec<DeviceRecord>>> = LazyLock::new(|| Mutex::new(Vec::new()));

struct DeviceRecord {
    index: u32,
    name: String,
    link: Weak<LinkInfo>,
}

/// Reserve the next device index.
pub fn allocate_index() -> u32 {
    NEXT_INDEX.fetch_add(1, Ordering::SeqCst)
}

/// Device name for an index.
pub fn device_name(index: u32) -> String {
    format!("vtap{index}")
}

pub fn register(link: &Arc<LinkInfo>) {
    DEVICES.lock().push(DeviceRecord {
        index: link.index(),
        name: link.name().to_string(),
        link: Arc::downgrade(link),
    });
}

/// Whether the device with `index` is still alive.
pub fn is_active(index: u32) -> bool {
    DEVICES
        .lock()
        .iter()
        .any(|r| r.index == index && r.link.strong_count() > 0)
}

pub fn find(name: &str) -> Option<Arc<LinkInfo>> {
    DEVICES
        .lock()
        .iter()
        .filter(|r| r.name == name)
        .find_map(|r| r.link.upgrade())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{NetworkId, OutboundFrame};
    use smoltcp::wire::EthernetAddress;

    #[test]
    fn test_indices_monotonic() {
        let a = allocate_index();
        let b = allocate_index();
        assert!(b > a);
        assert_eq!(device_name(7), "vtap7");
    }

    #[test]
    fn test_registry_tracks_liveness() {
        let index = allocate_index();
        let link = Arc::new(LinkInfo::new(
            device_name(index),
            index,
            EthernetAddress([0x02, 0, 0, 0, 0, 0x33]),
            1500,
            NetworkId(1),
            Arc::new(|_: OutboundFrame<'_>| {}),
        ));
        register(&link);

        assert!(is_active(index));
        assert!(find(&device_name(index)).is_some());

        drop(link);
        assert!(!is_active(index));
        assert!(find(&device_name(index)).is_none());
    }
}
