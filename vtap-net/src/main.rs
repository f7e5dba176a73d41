use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vtap_net::{
    BackendKind, EthernetAddress, EventFdNotifier, NetworkId, OutboundFrame, SocketType, TapConfig,
    TapDevice, TapSettings,
};

#[derive(Parser)]
#[command(name = "vtap-net", about = "Virtual tap devices over a userspace TCP/IP stack")]
struct Cli {
    /// JSON file with tap settings
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Cross-wire two tap devices in-process and send a message over TCP
    Pair {
        /// Message sent from the first tap to the second
        #[arg(long, default_value = "hello over the virtual wire")]
        message: String,

        /// TCP port the second tap listens on
        #[arg(long, default_value_t = 7000)]
        port: u16,

        /// Network id (hex)
        #[arg(long, default_value = "8056c2e21c000001")]
        network: NetworkId,

        #[arg(long, default_value = "smoltcp")]
        backend: BackendKind,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => TapSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => TapSettings::default(),
    };

    match cli.command {
        Command::Pair {
            message,
            port,
            network,
            backend,
            timeout,
        } => {
            tokio::select! {
                result = run_pair(settings, network, backend, port, message, Duration::from_secs(timeout)) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down...");
                    Ok(())
                }
            }
        }
    }
}

type Peer = Arc<OnceLock<Weak<TapDevice>>>;

/// Wire that hands every outbound frame to the peer tap.
fn wire_to(peer: Peer) -> Arc<dyn vtap_net::VirtualWire> {
    Arc::new(move |frame: OutboundFrame<'_>| {
        if let Some(tap) = peer.get().and_then(Weak::upgrade) {
            tap.put(frame.src, frame.dst, frame.ether_type, frame.payload);
        }
    })
}

async fn run_pair(
    settings: TapSettings,
    network: NetworkId,
    backend: BackendKind,
    port: u16,
    message: String,
    timeout: Duration,
) -> Result<()> {
    let storage = std::env::temp_dir().join("vtap-net");
    let peer_of_a: Peer = Arc::new(OnceLock::new());
    let peer_of_b: Peer = Arc::new(OnceLock::new());

    let notifier_b = Arc::new(EventFdNotifier::new().context("creating eventfd")?);

    let config = |mac: [u8; 6]| {
        TapConfig::new(&storage, EthernetAddress(mac), network)
            .with_backend(backend)
            .with_settings(settings.clone())
    };
    let tap_a = Arc::new(
        TapDevice::create(config([0x02, 0, 0, 0, 0, 0x0a]), wire_to(peer_of_a.clone()))
            .context("creating first tap")?,
    );
    let tap_b = Arc::new(
        TapDevice::builder(config([0x02, 0, 0, 0, 0, 0x0b]), wire_to(peer_of_b.clone()))
            .notifier(notifier_b.clone())
            .spawn()
            .context("creating second tap")?,
    );
    let _ = peer_of_a.set(Arc::downgrade(&tap_b));
    let _ = peer_of_b.set(Arc::downgrade(&tap_a));

    if !tap_a.add_address("10.9.0.1/24".parse()?) || !tap_b.add_address("10.9.0.2/24".parse()?) {
        bail!("backend {backend} rejected the pair addresses");
    }
    for tap in [&tap_a, &tap_b] {
        let groups = tap.scan_multicast_groups();
        info!(device = tap.device_name(), added = groups.added.len(), "Joined multicast groups");
    }

    let remote: SocketAddr = format!("10.9.0.2:{port}").parse()?;
    let listener = tap_b.socket(SocketType::Stream, None)?;
    tap_b.bind(listener, remote)?;
    tap_b.listen(listener, 1)?;

    let client = tap_a.socket(SocketType::Stream, None)?;
    tap_a.connect(client, remote)?;

    let (ours, mut app) = UnixStream::pair()?;
    let io = notifier_b.attach(ours)?;
    app.set_nonblocking(true)?;

    let deadline = Instant::now() + timeout;
    let mut accepted = None;
    let mut sent = 0;
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];

    while received.len() < message.len() {
        if Instant::now() > deadline {
            bail!("timed out after {timeout:?} ({} of {} bytes)", received.len(), message.len());
        }

        if accepted.is_none() {
            match tap_b.accept(listener, Some(io)) {
                Ok(conn) => {
                    info!(device = tap_b.device_name(), %conn, "Accepted connection");
                    accepted = Some(conn);
                }
                Err(e) if e.is_would_block() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if sent < message.len() {
            match tap_a.write(client, &message.as_bytes()[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.is_would_block() => {}
                Err(e) => return Err(e.into()),
            }
        }

        match app.read(&mut buf) {
            Ok(0) => bail!("stream closed early"),
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    println!("{}", String::from_utf8_lossy(&received));
    debug!(bytes = received.len(), "Pair transfer complete");

    for (tap, conn) in [(&tap_a, Some(client)), (&tap_b, accepted), (&tap_b, Some(listener))] {
        if let Some(conn) = conn
            && let Err(e) = tap.close(conn)
        {
            warn!(device = tap.device_name(), %conn, error = %e, "Close failed");
        }
    }
    Ok(())
}
