//! smoltcp-backed network stack.
//!
//! Architecture:
//! - Inbound frames are queued on a bounded channel by `inject_frame`, so the
//!   virtual-wire thread never waits on the stack lock.
//! - `run_loop` drains the queue into an in-memory device, polls the
//!   interface and hands emitted frames to the link after releasing the lock.
//! - Listening is modeled with a pool of smoltcp sockets in listen state, one
//!   per backlog slot, replenished on accept.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, PollResult, SocketHandle, SocketSet};
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint,
};
use tracing::{debug, warn};

use crate::addr::InetAddress;
use crate::config::TapSettings;
use crate::connection::SocketType;
use crate::ethernet::{ETHERNET_HEADER_LEN, EthernetHeader};
use crate::stack::{LinkInfo, LoopReport, StackAdapter, StackError, StackHandle, StackResult};

/// Inbound frames queued between run-loop iterations
const INBOX_CAPACITY: usize = 1024;

/// Upper bound on interface polls per run-loop iteration
const MAX_POLLS_PER_LOOP: usize = 64;

const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// In-memory device between the tap and the smoltcp interface.
struct FrameQueue {
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
    mtu: usize,
}

struct RxFrame(Vec<u8>);

struct TxFrame<'a>(&'a mut Vec<Vec<u8>>);

impl phy::RxToken for RxFrame {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

impl phy::TxToken for TxFrame<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.0.push(buf);
        result
    }
}

impl Device for FrameQueue {
    type RxToken<'a>
        = RxFrame
    where
        Self: 'a;
    type TxToken<'a>
        = TxFrame<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((RxFrame(frame), TxFrame(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(TxFrame(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

enum Slot {
    Stream {
        socket: SocketHandle,
        local: Option<IpListenEndpoint>,
        eof_reported: bool,
    },
    Listener {
        endpoint: IpListenEndpoint,
        waiting: Vec<SocketHandle>,
    },
    Datagram {
        socket: SocketHandle,
        peer: Option<IpEndpoint>,
    },
}

struct StackState {
    iface: Interface,
    device: FrameQueue,
    sockets: SocketSet<'static>,
    slots: HashMap<StackHandle, Slot>,
    /// Stream sockets closed by the application, kept until the close handshake ends
    closing: Vec<SocketHandle>,
    next_handle: u64,
    next_port: u16,
}

impl StackState {
    fn alloc_handle(&mut self) -> StackHandle {
        let handle = StackHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == *EPHEMERAL_PORTS.end() {
            *EPHEMERAL_PORTS.start()
        } else {
            port + 1
        };
        port
    }

    fn slot_mut(&mut self, handle: StackHandle) -> StackResult<&mut Slot> {
        self.slots
            .get_mut(&handle)
            .ok_or(StackError::InvalidHandle(handle))
    }
}

pub struct SmoltcpStack {
    inbox_tx: Sender<Vec<u8>>,
    inbox_rx: Receiver<Vec<u8>>,
    state: Mutex<StackState>,
    tcp_buffer_size: usize,
    udp_buffer_size: usize,
    udp_packet_slots: usize,
    max_backlog: usize,
}

impl SmoltcpStack {
    pub fn new(link: &LinkInfo, settings: &TapSettings) -> Self {
        let mut device = FrameQueue {
            rx: VecDeque::new(),
            tx: Vec::new(),
            mtu: link.mtu() as usize + ETHERNET_HEADER_LEN,
        };

        let mut config = Config::new(HardwareAddress::Ethernet(link.mac()));
        config.random_seed = u64::from(link.index()) ^ link.network_id().0;
        let iface = Interface::new(config, &mut device, SmolInstant::now());

        let (inbox_tx, inbox_rx) = bounded(INBOX_CAPACITY);
        // Spread devices over the ephemeral range
        let port_span = u32::from(EPHEMERAL_PORTS.end() - EPHEMERAL_PORTS.start()) + 1;
        let next_port = EPHEMERAL_PORTS.start() + (link.index().wrapping_mul(997) % port_span) as u16;

        Self {
            inbox_tx,
            inbox_rx,
            state: Mutex::new(StackState {
                iface,
                device,
                sockets: SocketSet::new(vec![]),
                slots: HashMap::new(),
                closing: Vec::new(),
                next_handle: 1,
                next_port,
            }),
            tcp_buffer_size: settings.tcp_buffer_size,
            udp_buffer_size: settings.udp_buffer_size,
            udp_packet_slots: settings.udp_packet_slots,
            max_backlog: settings.max_listen_backlog.max(1),
        }
    }

    fn new_tcp_socket(&self) -> tcp::Socket<'static> {
        tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; self.tcp_buffer_size]),
            tcp::SocketBuffer::new(vec![0; self.tcp_buffer_size]),
        )
    }

    fn new_udp_socket(&self) -> udp::Socket<'static> {
        udp::Socket::new(
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; self.udp_packet_slots],
                vec![0; self.udp_buffer_size],
            ),
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; self.udp_packet_slots],
                vec![0; self.udp_buffer_size],
            ),
        )
    }

    /// Add a fresh socket in listen state to the set.
    fn spawn_listener(
        &self,
        sockets: &mut SocketSet<'static>,
        endpoint: IpListenEndpoint,
    ) -> StackResult<SocketHandle> {
        let mut socket = self.new_tcp_socket();
        socket
            .listen(endpoint)
            .map_err(|e| StackError::Backend(format!("{e:?}")))?;
        Ok(sockets.add(socket))
    }
}

fn listen_endpoint(addr: SocketAddr) -> IpListenEndpoint {
    let ip = addr.ip();
    IpListenEndpoint {
        addr: (!ip.is_unspecified()).then(|| IpAddress::from(ip)),
        port: addr.port(),
    }
}

fn cidr(addr: &InetAddress) -> IpCidr {
    IpCidr::new(IpAddress::from(addr.addr()), addr.prefix_len())
}

fn is_opening(state: tcp::State) -> bool {
    matches!(state, tcp::State::SynSent | tcp::State::SynReceived)
}

impl StackAdapter for SmoltcpStack {
    fn name(&self) -> &'static str {
        "smoltcp"
    }

    fn init_interface(&self, link: &LinkInfo, addr: &InetAddress) -> StackResult<()> {
        let cidr = cidr(addr);
        let mut result = Ok(());
        self.state.lock().iface.update_ip_addrs(|addrs| {
            if addrs.contains(&cidr) {
                return;
            }
            if addrs.push(cidr).is_err() {
                result = Err(StackError::AddrNotAvailable(format!(
                    "{addr}: interface address table full"
                )));
            }
        });
        if result.is_ok() {
            debug!(device = %link.name(), %addr, "Registered address with smoltcp");
        }
        result
    }

    fn deinit_interface(&self, link: &LinkInfo, addr: &InetAddress) -> StackResult<()> {
        let cidr = cidr(addr);
        self.state
            .lock()
            .iface
            .update_ip_addrs(|addrs| addrs.retain(|c| *c != cidr));
        debug!(device = %link.name(), %addr, "Removed address from smoltcp");
        Ok(())
    }

    fn inject_frame(
        &self,
        link: &LinkInfo,
        from: EthernetAddress,
        to: EthernetAddress,
        ether_type: u16,
        data: &[u8],
    ) {
        let frame = EthernetHeader {
            dst: to,
            src: from,
            ether_type,
        }
        .emit(data);
        match self.inbox_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(device = %link.name(), "smoltcp inbox full, dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn run_loop(&self, link: &LinkInfo) -> LoopReport {
        let mut report = LoopReport::default();
        let outbound = {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            st.device.mtu = link.mtu() as usize + ETHERNET_HEADER_LEN;
            st.device.rx.extend(self.inbox_rx.try_iter());

            let now = SmolInstant::now();
            for _ in 0..MAX_POLLS_PER_LOOP {
                let result = st.iface.poll(now, &mut st.device, &mut st.sockets);
                if result == PollResult::None && st.device.rx.is_empty() {
                    break;
                }
            }

            let sockets = &mut st.sockets;
            st.closing.retain(|h| {
                let done = matches!(
                    sockets.get::<tcp::Socket>(*h).state(),
                    tcp::State::Closed | tcp::State::TimeWait
                );
                if done {
                    sockets.remove(*h);
                }
                !done
            });

            for (handle, slot) in st.slots.iter_mut() {
                let ready = match slot {
                    Slot::Stream {
                        socket,
                        eof_reported,
                        ..
                    } => {
                        let sock = st.sockets.get::<tcp::Socket>(*socket);
                        if sock.can_recv() {
                            true
                        } else if !sock.may_recv()
                            && !*eof_reported
                            && !sock.is_listening()
                            && !is_opening(sock.state())
                            && sock.state() != tcp::State::Closed
                        {
                            *eof_reported = true;
                            true
                        } else {
                            false
                        }
                    }
                    Slot::Datagram { socket, .. } => st.sockets.get::<udp::Socket>(*socket).can_recv(),
                    Slot::Listener { .. } => false,
                };
                if ready {
                    report.readable.push(*handle);
                }
            }

            report.next_poll = st
                .iface
                .poll_delay(now, &st.sockets)
                .map(|d| Duration::from_micros(d.total_micros()));

            std::mem::take(&mut st.device.tx)
        };

        for frame in &outbound {
            link.emit(frame);
        }
        report
    }

    fn socket(&self, socket_type: SocketType) -> StackResult<StackHandle> {
        let mut st = self.state.lock();
        let slot = match socket_type {
            SocketType::Stream => Slot::Stream {
                socket: st.sockets.add(self.new_tcp_socket()),
                local: None,
                eof_reported: false,
            },
            SocketType::Datagram => Slot::Datagram {
                socket: st.sockets.add(self.new_udp_socket()),
                peer: None,
            },
            SocketType::Raw => return Err(StackError::Unsupported("raw sockets")),
        };
        let handle = st.alloc_handle();
        st.slots.insert(handle, slot);
        Ok(handle)
    }

    fn connect(&self, handle: StackHandle, remote: SocketAddr) -> StackResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let fallback_port = st.ephemeral_port();
        let remote = IpEndpoint::from(remote);

        match st.slots.get_mut(&handle).ok_or(StackError::InvalidHandle(handle))? {
            Slot::Stream { socket, local, .. } => {
                let local = (*local).unwrap_or(IpListenEndpoint {
                    addr: None,
                    port: fallback_port,
                });
                let cx = st.iface.context();
                st.sockets
                    .get_mut::<tcp::Socket>(*socket)
                    .connect(cx, remote, local)
                    .map_err(|e| StackError::Backend(format!("{e:?}")))
            }
            Slot::Datagram { socket, peer } => {
                let sock = st.sockets.get_mut::<udp::Socket>(*socket);
                if !sock.is_open() {
                    sock.bind(fallback_port)
                        .map_err(|e| StackError::Backend(format!("{e:?}")))?;
                }
                *peer = Some(remote);
                Ok(())
            }
            Slot::Listener { .. } => Err(StackError::InvalidState("connect on listening socket")),
        }
    }

    fn bind(&self, handle: StackHandle, local: SocketAddr) -> StackResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut endpoint = listen_endpoint(local);
        if endpoint.port == 0 {
            endpoint.port = st.ephemeral_port();
        }
        if let Some(addr) = endpoint.addr
            && !st.iface.has_ip_addr(addr)
        {
            return Err(StackError::AddrNotAvailable(local.to_string()));
        }

        match st.slots.get_mut(&handle).ok_or(StackError::InvalidHandle(handle))? {
            Slot::Stream { local, .. } => {
                *local = Some(endpoint);
                Ok(())
            }
            Slot::Datagram { socket, .. } => st
                .sockets
                .get_mut::<udp::Socket>(*socket)
                .bind(endpoint)
                .map_err(|e| StackError::Backend(format!("{e:?}"))),
            Slot::Listener { .. } => Err(StackError::InvalidState("already listening")),
        }
    }

    fn listen(&self, handle: StackHandle, backlog: usize) -> StackResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let (socket, endpoint) = match st.slot_mut(handle)? {
            Slot::Stream {
                socket,
                local: Some(endpoint),
                ..
            } => (*socket, *endpoint),
            Slot::Stream { local: None, .. } => {
                return Err(StackError::InvalidState("listen before bind"));
            }
            _ => return Err(StackError::InvalidState("listen on non-stream socket")),
        };

        st.sockets
            .get_mut::<tcp::Socket>(socket)
            .listen(endpoint)
            .map_err(|e| StackError::Backend(format!("{e:?}")))?;

        let backlog = backlog.clamp(1, self.max_backlog);
        let mut waiting = vec![socket];
        for _ in 1..backlog {
            waiting.push(self.spawn_listener(&mut st.sockets, endpoint)?);
        }
        st.slots.insert(handle, Slot::Listener { endpoint, waiting });
        debug!(%handle, port = endpoint.port, backlog, "smoltcp listening");
        Ok(())
    }

    fn accept(&self, handle: StackHandle) -> StackResult<StackHandle> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let sockets = &st.sockets;
        let Slot::Listener { endpoint, waiting } =
            st.slots.get_mut(&handle).ok_or(StackError::InvalidHandle(handle))?
        else {
            return Err(StackError::InvalidState("accept on non-listening socket"));
        };

        let pos = waiting
            .iter()
            .position(|h| {
                matches!(
                    sockets.get::<tcp::Socket>(*h).state(),
                    tcp::State::Established | tcp::State::CloseWait
                )
            })
            .ok_or(StackError::WouldBlock)?;
        let socket = waiting.remove(pos);
        let endpoint = *endpoint;

        let replacement = self.spawn_listener(&mut st.sockets, endpoint)?;
        if let Some(Slot::Listener { waiting, .. }) = st.slots.get_mut(&handle) {
            waiting.push(replacement);
        }

        let accepted = st.alloc_handle();
        st.slots.insert(
            accepted,
            Slot::Stream {
                socket,
                local: Some(endpoint),
                eof_reported: false,
            },
        );
        Ok(accepted)
    }

    fn read(&self, handle: StackHandle, sink: &mut dyn FnMut(&[u8]) -> usize) -> StackResult<usize> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        match st.slots.get(&handle).ok_or(StackError::InvalidHandle(handle))? {
            Slot::Stream { socket, .. } => {
                let sock = st.sockets.get_mut::<tcp::Socket>(*socket);
                let mut total = 0;
                // The receive ring may wrap, so one recv can return a partial view
                loop {
                    match sock.recv(|buf| {
                        let took = if buf.is_empty() { 0 } else { sink(&*buf) };
                        (took, took)
                    }) {
                        Ok(0) => break,
                        Ok(n) => total += n,
                        Err(tcp::RecvError::Finished) => return Ok(total),
                        Err(_) if is_opening(sock.state()) => return Err(StackError::WouldBlock),
                        Err(_) => return Err(StackError::NotConnected),
                    }
                }
                if total == 0 {
                    return Err(StackError::WouldBlock);
                }
                Ok(total)
            }
            Slot::Datagram { socket, .. } => {
                let sock = st.sockets.get_mut::<udp::Socket>(*socket);
                match sock.recv() {
                    Ok((data, _meta)) => Ok(sink(data)),
                    Err(udp::RecvError::Exhausted) => Err(StackError::WouldBlock),
                    Err(e) => Err(StackError::Backend(format!("{e:?}"))),
                }
            }
            Slot::Listener { .. } => Err(StackError::InvalidState("read on listening socket")),
        }
    }

    fn write(&self, handle: StackHandle, data: &[u8]) -> StackResult<usize> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        match st.slots.get(&handle).ok_or(StackError::InvalidHandle(handle))? {
            Slot::Stream { socket, .. } => {
                let sock = st.sockets.get_mut::<tcp::Socket>(*socket);
                match sock.send_slice(data) {
                    Ok(0) if !data.is_empty() => Err(StackError::WouldBlock),
                    Ok(n) => Ok(n),
                    Err(_) if is_opening(sock.state()) => Err(StackError::WouldBlock),
                    Err(_) => Err(StackError::NotConnected),
                }
            }
            Slot::Datagram { socket, peer } => {
                let peer = peer.ok_or(StackError::NotConnected)?;
                let sock = st.sockets.get_mut::<udp::Socket>(*socket);
                match sock.send_slice(data, peer) {
                    Ok(()) => Ok(data.len()),
                    Err(udp::SendError::BufferFull) => Err(StackError::WouldBlock),
                    Err(e) => Err(StackError::Backend(format!("{e:?}"))),
                }
            }
            Slot::Listener { .. } => Err(StackError::InvalidState("write on listening socket")),
        }
    }

    fn close(&self, handle: StackHandle) -> StackResult<()> {
        let mut st = self.state.lock();
        let slot = st.slots.remove(&handle).ok_or(StackError::InvalidHandle(handle))?;
        match slot {
            Slot::Stream { socket, .. } => {
                st.sockets.get_mut::<tcp::Socket>(socket).close();
                st.closing.push(socket);
            }
            Slot::Listener { waiting, .. } => {
                for socket in waiting {
                    st.sockets.get_mut::<tcp::Socket>(socket).abort();
                    st.sockets.remove(socket);
                }
            }
            Slot::Datagram { socket, .. } => {
                st.sockets.remove(socket);
            }
        }
        debug!(%handle, "smoltcp socket closed");
        Ok(())
    }
}
