//! Event notification between the tap device and application sockets.
//!
//! The tap consumes an [`EventNotifier`] to block its background thread and
//! to push received data out to application-facing I/O handles. In the other
//! direction, the notifier drives the tap through [`LocalEvents`] when an
//! application socket closes, has data, or becomes writable.
//!
//! [`EventFdNotifier`] is the Linux implementation: an eventfd for wakeups
//! and `UnixStream` pairs as application endpoints.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Application-facing I/O handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoHandle(pub u64);

impl fmt::Display for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io{}", self.0)
    }
}

pub trait EventNotifier: Send + Sync {
    /// Block until woken or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> io::Result<()>;

    /// Interrupt a concurrent or the next `wait`.
    fn wake(&self);

    /// Push data to the application side of `io`. Returns bytes accepted,
    /// 0 if the application is not ready for more.
    fn deliver(&self, io: IoHandle, data: &[u8]) -> io::Result<usize>;

    /// Stop watching `io` for events. The handle stays open.
    fn release(&self, io: IoHandle);

    /// Close the underlying descriptor of `io`.
    fn close(&self, io: IoHandle);
}

/// Handlers invoked by the notification layer.
pub trait LocalEvents {
    fn on_local_close(&self, io: IoHandle);

    fn on_local_data(&self, io: IoHandle, data: &[u8]);

    fn on_local_writable(&self, io: IoHandle);

    fn on_tcp_connect(&self, _io: IoHandle) {}

    fn on_tcp_accept(&self, _io: IoHandle) {}

    fn on_tcp_close(&self, _io: IoHandle) {}

    fn on_tcp_data(&self, _io: IoHandle, _data: &[u8]) {}

    fn on_datagram(&self, _io: IoHandle, _data: &[u8]) {}
}

struct Endpoint {
    stream: UnixStream,
    watched: bool,
}

/// Notifier backed by an eventfd and unix stream endpoints.
pub struct EventFdNotifier {
    efd: EventFd,
    endpoints: Mutex<HashMap<IoHandle, Endpoint>>,
    next: AtomicU64,
}

impl EventFdNotifier {
    pub fn new() -> io::Result<Self> {
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)?;
        Ok(Self {
            efd,
            endpoints: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        })
    }

    /// Take ownership of the tap side of an application stream.
    pub fn attach(&self, stream: UnixStream) -> io::Result<IoHandle> {
        stream.set_nonblocking(true)?;
        let io = IoHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.endpoints.lock().insert(
            io,
            Endpoint {
                stream,
                watched: true,
            },
        );
        debug!(%io, "Attached endpoint");
        Ok(io)
    }

    pub fn is_attached(&self, io: IoHandle) -> bool {
        self.endpoints.lock().contains_key(&io)
    }

    /// Poll every watched endpoint once and dispatch its events to `events`.
    pub fn pump(&self, events: &dyn LocalEvents) {
        let watched: Vec<(IoHandle, UnixStream)> = {
            let endpoints = self.endpoints.lock();
            endpoints
                .iter()
                .filter(|(_, ep)| ep.watched)
                .filter_map(|(io, ep)| ep.stream.try_clone().ok().map(|s| (*io, s)))
                .collect()
        };

        let mut buf = vec![0u8; 16 * 1024];
        for (io, mut stream) in watched {
            match stream.read(&mut buf) {
                Ok(0) => {
                    events.on_local_close(io);
                    continue;
                }
                Ok(n) => events.on_local_data(io, &buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!(%io, error = %e, "Endpoint read failed");
                    events.on_local_close(io);
                    continue;
                }
            }
            events.on_local_writable(io);
        }
    }
}

impl EventNotifier for EventFdNotifier {
    fn wait(&self, timeout: Duration) -> io::Result<()> {
        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(self.efd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(0) | Err(Errno::EINTR) => Ok(()),
            Ok(_) => match self.efd.read() {
                Ok(_) | Err(Errno::EAGAIN) => Ok(()),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn wake(&self) {
        if let Err(e) = self.efd.write(1) {
            warn!(error = %e, "Failed to signal eventfd");
        }
    }

    fn deliver(&self, io: IoHandle, data: &[u8]) -> io::Result<usize> {
        let mut endpoints = self.endpoints.lock();
        let ep = endpoints
            .get_mut(&io)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown handle {io}")))?;
        match ep.stream.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn release(&self, io: IoHandle) {
        if let Some(ep) = self.endpoints.lock().get_mut(&io) {
            ep.watched = false;
        }
    }

    fn close(&self, io: IoHandle) {
        if let Some(ep) = self.endpoints.lock().remove(&io) {
            let _ = ep.stream.shutdown(Shutdown::Both);
            debug!(%io, "Closed endpoint");
        }
    }
}
