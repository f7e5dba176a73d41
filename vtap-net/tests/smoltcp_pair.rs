//! Two tap devices on the smoltcp backend, cross-wired in-process.

mod harness;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vtap_net::{
    BackendKind, ConnectionId, EthernetAddress, EventFdNotifier, OutboundFrame, SocketError,
    SocketType, TapConfig, TapDevice, VirtualWire,
};

const MAC_A: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x0a]);
const MAC_B: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x0b]);

const DEADLINE: Duration = Duration::from_secs(5);

type Peer = Arc<OnceLock<Weak<TapDevice>>>;

struct Pair {
    a: Arc<TapDevice>,
    b: Arc<TapDevice>,
    notifier_a: Arc<EventFdNotifier>,
    notifier_b: Arc<EventFdNotifier>,
    _storage: TempDir,
}

fn wire_to(peer: Peer) -> Arc<dyn VirtualWire> {
    Arc::new(move |frame: OutboundFrame<'_>| {
        if let Some(tap) = peer.get().and_then(Weak::upgrade) {
            tap.put(frame.src, frame.dst, frame.ether_type, frame.payload);
        }
    })
}

fn pair() -> Pair {
    let _ = tracing_subscriber::fmt::try_init();

    let storage = TempDir::new().unwrap();
    let peer_of_a: Peer = Arc::new(OnceLock::new());
    let peer_of_b: Peer = Arc::new(OnceLock::new());
    let notifier_a = Arc::new(EventFdNotifier::new().unwrap());
    let notifier_b = Arc::new(EventFdNotifier::new().unwrap());

    let spawn = |mac, peer: &Peer, notifier: &Arc<EventFdNotifier>| {
        let config = TapConfig::new(storage.path(), mac, harness::TEST_NETWORK)
            .with_mtu(1500)
            .with_backend(BackendKind::Smoltcp);
        Arc::new(
            TapDevice::builder(config, wire_to(peer.clone()))
                .notifier(notifier.clone())
                .spawn()
                .unwrap(),
        )
    };
    let a = spawn(MAC_A, &peer_of_a, &notifier_a);
    let b = spawn(MAC_B, &peer_of_b, &notifier_b);
    peer_of_a.set(Arc::downgrade(&b)).unwrap();
    peer_of_b.set(Arc::downgrade(&a)).unwrap();

    assert!(a.add_address("10.9.0.1/24".parse().unwrap()));
    assert!(b.add_address("10.9.0.2/24".parse().unwrap()));

    Pair {
        a,
        b,
        notifier_a,
        notifier_b,
        _storage: storage,
    }
}

/// Retry `op` until it stops returning would-block.
fn until_ready<T>(mut op: impl FnMut() -> Result<T, SocketError>) -> T {
    let deadline = Instant::now() + DEADLINE;
    loop {
        match op() {
            Ok(v) => return v,
            Err(e) if e.is_would_block() && Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("socket call failed: {e}"),
        }
    }
}

fn read_exactly(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    stream.set_read_timeout(Some(DEADLINE)).unwrap();
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn connect_stream(p: &Pair, port: u16) -> (ConnectionId, UnixStream, ConnectionId, UnixStream) {
    let local = format!("10.9.0.2:{port}").parse().unwrap();
    let listener = p.b.socket(SocketType::Stream, None).unwrap();
    p.b.bind(listener, local).unwrap();
    p.b.listen(listener, 2).unwrap();

    let (ours_a, app_a) = UnixStream::pair().unwrap();
    let io_a = p.notifier_a.attach(ours_a).unwrap();
    let client = p.a.socket(SocketType::Stream, Some(io_a)).unwrap();
    p.a.connect(client, local).unwrap();

    let (ours_b, app_b) = UnixStream::pair().unwrap();
    let io_b = p.notifier_b.attach(ours_b).unwrap();
    let accepted = until_ready(|| p.b.accept(listener, Some(io_b)));

    (client, app_a, accepted, app_b)
}

#[test]
fn test_tcp_over_virtual_wire() {
    let p = pair();
    let (client, mut app_a, accepted, mut app_b) = connect_stream(&p, 7000);

    let message = b"hello over the virtual wire";
    let mut sent = 0;
    while sent < message.len() {
        let n = until_ready(|| p.a.write(client, &message[sent..]));
        sent += n;
    }
    assert_eq!(read_exactly(&mut app_b, message.len()), message);

    // Reply from the application side of B through the notifier
    app_b.write_all(b"pong").unwrap();
    let deadline = Instant::now() + DEADLINE;
    let mut reply = Vec::new();
    app_a.set_nonblocking(true).unwrap();
    while reply.len() < 4 && Instant::now() < deadline {
        p.notifier_b.pump(&*p.b);
        let mut buf = [0u8; 16];
        match app_a.read(&mut buf) {
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("read failed: {e}"),
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(reply, b"pong");

    p.a.close(client).unwrap();
    p.b.close(accepted).unwrap();
}

#[test]
fn test_peer_close_reaches_application_as_eof() {
    let p = pair();
    let (client, _app_a, accepted, mut app_b) = connect_stream(&p, 7001);

    let n = until_ready(|| p.a.write(client, b"bye"));
    assert_eq!(n, 3);
    assert_eq!(read_exactly(&mut app_b, 3), b"bye");

    p.a.close(client).unwrap();

    app_b.set_read_timeout(Some(DEADLINE)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(app_b.read(&mut buf).unwrap(), 0);

    p.b.close(accepted).unwrap();
}

#[test]
fn test_udp_over_virtual_wire() {
    let p = pair();

    let (ours_b, mut app_b) = UnixStream::pair().unwrap();
    let io_b = p.notifier_b.attach(ours_b).unwrap();
    let server = p.b.socket(SocketType::Datagram, Some(io_b)).unwrap();
    p.b.bind(server, "10.9.0.2:5353".parse().unwrap()).unwrap();

    let client = p.a.socket(SocketType::Datagram, None).unwrap();
    p.a.connect(client, "10.9.0.2:5353".parse().unwrap()).unwrap();
    assert_eq!(until_ready(|| p.a.write(client, b"ping")), 4);

    assert_eq!(read_exactly(&mut app_b, 4), b"ping");
}

#[test]
fn test_multicast_groups_for_pair() {
    let p = pair();
    let diff = p.a.scan_multicast_groups();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].mac(), EthernetAddress::BROADCAST);
    assert_eq!(diff.added[0].adi(), u32::from_be_bytes([10, 9, 0, 1]));
    assert!(p.a.scan_multicast_groups().is_empty());
}

#[test]
fn test_remove_address_stops_traffic() {
    let p = pair();
    assert!(p.b.remove_address(&"10.9.0.2/24".parse().unwrap()));
    assert!(p.b.addresses().is_empty());

    let h = p.b.socket(SocketType::Datagram, None).unwrap();
    assert!(p.b.bind(h, "10.9.0.2:53".parse().unwrap()).is_err());
}
