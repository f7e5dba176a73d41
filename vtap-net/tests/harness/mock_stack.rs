//! Scripted stack backend.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use vtap_net::{
    EthernetAddress, InetAddress, LinkInfo, LoopReport, SocketType, StackAdapter, StackError,
    StackHandle, StackResult,
};

/// Backend that accepts every socket call and records what it saw.
///
/// Address registration can be made to fail and the run loop can be slowed
/// down to simulate a busy stack.
#[derive(Default)]
pub struct MockStack {
    pub fail_init: AtomicBool,
    pub run_loops: AtomicUsize,
    pub loop_delay: Mutex<Duration>,
    /// Signalled each time the run loop is entered
    pub loop_entered: Mutex<Option<Sender<()>>>,
    next: AtomicU64,
    open: Mutex<HashSet<StackHandle>>,
    pub registered: Mutex<Vec<InetAddress>>,
    pub closed: Mutex<Vec<StackHandle>>,
    pub injected: Mutex<Vec<(EthernetAddress, EthernetAddress, u16, Vec<u8>)>>,
    pub written: Mutex<Vec<(StackHandle, Vec<u8>)>>,
}

impl MockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, handle: StackHandle) -> bool {
        self.open.lock().contains(&handle)
    }

    fn check(&self, handle: StackHandle) -> StackResult<()> {
        if self.is_open(handle) {
            Ok(())
        } else {
            Err(StackError::InvalidHandle(handle))
        }
    }

    fn open_handle(&self) -> StackHandle {
        let handle = StackHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.open.lock().insert(handle);
        handle
    }
}

impl StackAdapter for MockStack {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn init_interface(&self, _link: &LinkInfo, addr: &InetAddress) -> StackResult<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(StackError::Backend("scripted registration failure".into()));
        }
        self.registered.lock().push(*addr);
        Ok(())
    }

    fn deinit_interface(&self, _link: &LinkInfo, addr: &InetAddress) -> StackResult<()> {
        self.registered.lock().retain(|a| a != addr);
        Ok(())
    }

    fn inject_frame(
        &self,
        _link: &LinkInfo,
        from: EthernetAddress,
        to: EthernetAddress,
        ether_type: u16,
        data: &[u8],
    ) {
        self.injected.lock().push((from, to, ether_type, data.to_vec()));
    }

    fn run_loop(&self, _link: &LinkInfo) -> LoopReport {
        self.run_loops.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.loop_entered.lock().as_ref() {
            let _ = tx.try_send(());
        }
        let delay = *self.loop_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        LoopReport::default()
    }

    fn socket(&self, socket_type: SocketType) -> StackResult<StackHandle> {
        match socket_type {
            SocketType::Raw => Err(StackError::Unsupported("raw sockets")),
            _ => Ok(self.open_handle()),
        }
    }

    fn connect(&self, handle: StackHandle, _remote: SocketAddr) -> StackResult<()> {
        self.check(handle)
    }

    fn bind(&self, handle: StackHandle, _local: SocketAddr) -> StackResult<()> {
        self.check(handle)
    }

    fn listen(&self, handle: StackHandle, _backlog: usize) -> StackResult<()> {
        self.check(handle)
    }

    fn accept(&self, handle: StackHandle) -> StackResult<StackHandle> {
        self.check(handle)?;
        Ok(self.open_handle())
    }

    fn read(&self, handle: StackHandle, _sink: &mut dyn FnMut(&[u8]) -> usize) -> StackResult<usize> {
        self.check(handle)?;
        Err(StackError::WouldBlock)
    }

    fn write(&self, handle: StackHandle, data: &[u8]) -> StackResult<usize> {
        self.check(handle)?;
        self.written.lock().push((handle, data.to_vec()));
        Ok(data.len())
    }

    fn close(&self, handle: StackHandle) -> StackResult<()> {
        if !self.open.lock().remove(&handle) {
            return Err(StackError::InvalidHandle(handle));
        }
        self.closed.lock().push(handle);
        Ok(())
    }
}
