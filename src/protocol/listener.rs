//! Inbound side of the transport.
//!
//! Peers deliver their messages over connections they dial themselves, so every
//! process also listens. The [`Acceptor`] owns that listener on a background thread
//! and parks accepted streams until a reader claims the one belonging to its host.
//!
//! A dialer names itself once, right after connecting, with a [`Hello`] frame. The
//! frame is consumed here, so readers only ever see envelopes. Source addresses
//! are not used: every rank on one machine dials from the same IP.
use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_into_std_write,
    error::{DecodeError, EncodeError},
};
use log::{debug, warn};

/// Longest hello frame accepted, length prefix included.
const HELLO_LIMIT: usize = 512;
/// How long a new connection has to name itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Parked streams kept at most; the oldest is dropped beyond this.
pub(crate) const MAX_PENDING: usize = 64;

/// First frame on every dialed connection.
#[derive(Debug, Encode, Decode, PartialEq, Eq)]
struct Hello {
    host: String,
}

fn hello_config() -> Configuration<BigEndian, Fixint, Limit<HELLO_LIMIT>> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<HELLO_LIMIT>()
}

/// Introduces this process as `host` on a freshly dialed connection.
pub(crate) fn write_hello<W: Write>(writer: &mut W, host: &str) -> Result<(), EncodeError> {
    let hello = Hello {
        host: host.to_owned(),
    };
    encode_into_std_write(hello, writer, hello_config())?;
    Ok(())
}

fn read_hello(stream: &mut TcpStream) -> Result<String, DecodeError> {
    stream
        .set_read_timeout(Some(HELLO_TIMEOUT))
        .map_err(|inner| DecodeError::Io {
            inner,
            additional: 0,
        })?;
    let hello: Hello = decode_from_std_read(stream, hello_config())?;
    stream.set_read_timeout(None).map_err(|inner| DecodeError::Io {
        inner,
        additional: 0,
    })?;
    Ok(hello.host)
}

#[derive(Debug)]
pub(crate) struct Acceptor {
    addr: SocketAddr,
    pending: Mutex<Vec<(String, TcpStream)>>,
    arrived: Condvar,
    closed: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Starts accepting on `listener` in a background thread.
    pub fn spawn(listener: TcpListener) -> std::io::Result<Arc<Self>> {
        let acceptor = Arc::new(Self {
            addr: listener.local_addr()?,
            pending: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
            closed: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let handle = Arc::clone(&acceptor);
        let thread = thread::Builder::new()
            .name(format!("rankwire-accept-{}", acceptor.addr.port()))
            .spawn(move || handle.listen(listener))?;
        *lock(&acceptor.thread) = Some(thread);

        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn listen(&self, listener: TcpListener) {
        debug!("listening at {}", self.addr);

        for stream in listener.incoming() {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            match stream {
                Ok(mut stream) => match read_hello(&mut stream) {
                    Ok(host) => {
                        debug!("accepted connection from {host} at {:?}", stream.peer_addr());
                        self.park(host, stream);
                    }
                    Err(e) => warn!("dropping connection from {:?}: {e}", stream.peer_addr()),
                },
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        debug!("stopped listening at {}", self.addr);
    }

    fn park(&self, host: String, stream: TcpStream) {
        let mut pending = lock(&self.pending);
        if pending.len() >= MAX_PENDING {
            let (stale, _) = pending.remove(0);
            warn!("too many unclaimed connections, dropping one from {stale}");
        }
        pending.push((host, stream));
        drop(pending);

        self.arrived.notify_all();
    }

    /// Blocks until a connection from `host` has been accepted and hands it over,
    /// oldest first. Returns `None` once the acceptor is closed.
    pub fn claim(&self, host: &str) -> Option<TcpStream> {
        let mut pending = lock(&self.pending);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            if let Some(pos) = pending.iter().position(|(name, _)| name == host) {
                return Some(pending.remove(pos).1);
            }

            pending = self
                .arrived
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops the accept thread and drops every unclaimed stream.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Serialise with waiters in `claim` so none misses the wake-up.
        lock(&self.pending).clear();
        self.arrived.notify_all();

        // `incoming()` only re-checks the flag after an accept.
        let wake = match self.addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => {
                SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.addr.port())
            }
            IpAddr::V6(ip) if ip.is_unspecified() => {
                SocketAddr::new(Ipv6Addr::LOCALHOST.into(), self.addr.port())
            }
            _ => self.addr,
        };
        if let Err(e) = TcpStream::connect(wake) {
            debug!("could not wake accept thread: {e}");
            return;
        }

        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!("accept thread for {} panicked", self.addr);
            }
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
