//! Recording collaborators: virtual wire and event notifier.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use vtap_net::{EthernetAddress, EventNotifier, IoHandle, NetworkId, OutboundFrame, VirtualWire};

/// Owned copy of an [`OutboundFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    pub network_id: NetworkId,
    pub src: EthernetAddress,
    pub dst: EthernetAddress,
    pub ether_type: u16,
    pub vlan_id: u32,
    pub payload: Vec<u8>,
}

/// Virtual wire that keeps every delivered frame.
#[derive(Clone, Default)]
pub struct RecordingWire {
    frames: Arc<Mutex<Vec<RecordedFrame>>>,
}

impl RecordingWire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wire(&self) -> Arc<dyn VirtualWire> {
        let frames = self.frames.clone();
        Arc::new(move |frame: OutboundFrame<'_>| {
            frames.lock().push(RecordedFrame {
                network_id: frame.network_id,
                src: frame.src,
                dst: frame.dst,
                ether_type: frame.ether_type,
                vlan_id: frame.vlan_id,
                payload: frame.payload.to_vec(),
            });
        })
    }

    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().clone()
    }
}

/// Notifier that records releases, closes and deliveries.
pub struct RecordingNotifier {
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    pub released: Mutex<Vec<IoHandle>>,
    pub closed: Mutex<Vec<IoHandle>>,
    pub delivered: Mutex<Vec<(IoHandle, Vec<u8>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            wake_tx,
            wake_rx,
            released: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

impl EventNotifier for RecordingNotifier {
    fn wait(&self, timeout: Duration) -> io::Result<()> {
        let _ = self.wake_rx.recv_timeout(timeout);
        Ok(())
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn deliver(&self, io: IoHandle, data: &[u8]) -> io::Result<usize> {
        self.delivered.lock().push((io, data.to_vec()));
        Ok(data.len())
    }

    fn release(&self, io: IoHandle) {
        self.released.lock().push(io);
    }

    fn close(&self, io: IoHandle) {
        self.closed.lock().push(io);
    }
}
