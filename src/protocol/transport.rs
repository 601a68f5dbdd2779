use std::{
    collections::HashMap,
    io::{self, Read, Write},
    mem,
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, trace};
use thiserror::Error;

use super::listener::{Acceptor, lock, write_hello};

/// Port used both to listen and to dial peers.
pub const DEFAULT_PORT: u16 = 1337;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to resolve host '{host}': {source}")]
    Resolve { host: String, source: io::Error },
    #[error("host '{host}' resolved to no addresses")]
    Unresolvable { host: String },
    #[error("failed to connect to '{host}': {source}")]
    Connect { host: String, source: io::Error },
    #[error("failed to introduce ourselves to '{host}': {source}")]
    Handshake {
        host: String,
        source: bincode::error::EncodeError,
    },
    #[error("transport IO error with '{host}': {source}")]
    Io { host: String, source: io::Error },
    #[error("connection closed by '{host}'")]
    PeerClosed { host: String },
    #[error("transport is closed")]
    Closed,
    #[error("failed to close {} connection(s)", .failures.len())]
    Close { failures: Vec<(String, io::Error)> },
}

/// Host-addressed byte streams.
///
/// Implementations synchronise internally so one transport can serve several
/// threads; operations on different hosts must not block each other.
pub trait Transport {
    /// Handle to an established connection.
    type Connection;

    fn resolve_host(&self, host: &str) -> Result<SocketAddr, TransportError>;

    /// Connects to `host`, or returns the existing connection if there is one.
    fn connect(&self, host: &str) -> Result<Self::Connection, TransportError>;

    fn connected(&self, host: &str) -> bool;

    /// Reads whatever `host` has sent so far, up to `buf.len()` bytes.
    fn read(&self, host: &str, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes all of `buf` to `host`.
    fn write(&self, host: &str, buf: &[u8]) -> Result<usize, TransportError>;

    /// Closes every connection. Later operations fail with [`TransportError::Closed`].
    fn finalize(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Interface the listener binds to.
    pub bind_addr: IpAddr,
    /// Listening port, also dialed on every peer. `0` picks an ephemeral port.
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED.into(),
            port: DEFAULT_PORT,
        }
    }
}

/// One direction of a link. `busy` serialises I/O; `stream` is only locked
/// briefly so the stream can be shut down while I/O is blocked on it.
#[derive(Debug, Default)]
struct Channel {
    busy: Mutex<()>,
    stream: Mutex<Option<Arc<TcpStream>>>,
}

impl Channel {
    fn current(&self) -> Option<Arc<TcpStream>> {
        lock(&self.stream).clone()
    }

    fn install(&self, stream: TcpStream) -> Arc<TcpStream> {
        let stream = Arc::new(stream);
        *lock(&self.stream) = Some(Arc::clone(&stream));
        stream
    }

    /// Forgets `stream` after a failure so the next use establishes a new one.
    fn discard(&self, stream: &Arc<TcpStream>) {
        let mut current = lock(&self.stream);
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, stream)) {
            *current = None;
        }
    }

    fn close(&self) -> io::Result<()> {
        match lock(&self.stream).take() {
            Some(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// Both streams between this process and one peer host: the one dialed from
/// here (writes) and the one the peer dialed to us (reads).
#[derive(Debug, Default)]
struct Link {
    outbound: Channel,
    inbound: Channel,
}

/// Handle returned by [`TcpTransport::connect`].
#[derive(Debug, Clone)]
pub struct Connection {
    host: String,
    link: Arc<Link>,
}

impl Connection {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.link, &other.link)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.outbound.current()?.local_addr().ok()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.outbound.current()?.peer_addr().ok()
    }
}

/// TCP transport keeping one long-lived connection per peer host.
///
/// Every process listens and dials on the same port. Writes to a host go over
/// the connection this process dialed; reads from a host come from the
/// connection that host dialed to us. Each dialed connection opens with this
/// process's hostname so the peer can tell it apart from others on the same
/// address.
#[derive(Debug)]
pub struct TcpTransport {
    hostname: String,
    port: u16,
    links: RwLock<HashMap<String, Arc<Link>>>,
    acceptor: Arc<Acceptor>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Binds the listener and starts accepting peer connections. `hostname` is
    /// how this process introduces itself to the hosts it dials.
    pub fn bind(config: &TransportConfig, hostname: &str) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind((config.bind_addr, config.port)).map_err(TransportError::Bind)?;
        let acceptor = Acceptor::spawn(listener).map_err(TransportError::Bind)?;

        Ok(Self {
            hostname: hostname.to_owned(),
            port: acceptor.local_addr().port(),
            links: RwLock::new(HashMap::new()),
            acceptor,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Port this transport listens on and dials.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn link(&self, host: &str) -> Result<Arc<Link>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        if let Some(link) = shared(&self.links).get(host) {
            return Ok(Arc::clone(link));
        }

        let mut links = exclusive(&self.links);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(Arc::clone(links.entry(host.to_owned()).or_default()))
    }

    fn outbound(&self, host: &str, link: &Link) -> Result<Arc<TcpStream>, TransportError> {
        if let Some(stream) = link.outbound.current() {
            return Ok(stream);
        }

        debug!("dialing {host}:{}", self.port);
        let mut stream = TcpStream::connect((host, self.port)).map_err(|source| {
            TransportError::Connect {
                host: host.to_owned(),
                source,
            }
        })?;
        write_hello(&mut stream, &self.hostname).map_err(|source| {
            TransportError::Handshake {
                host: host.to_owned(),
                source,
            }
        })?;
        Ok(link.outbound.install(stream))
    }

    fn inbound(&self, host: &str, link: &Link) -> Result<Arc<TcpStream>, TransportError> {
        if let Some(stream) = link.inbound.current() {
            return Ok(stream);
        }

        debug!("waiting for {host} to connect");
        let stream = self.acceptor.claim(host).ok_or(TransportError::Closed)?;
        debug!("{host} connected from {:?}", stream.peer_addr());
        Ok(link.inbound.install(stream))
    }

    fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, TransportError> {
        let addrs = (host, self.port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                host: host.to_owned(),
                source,
            })?
            .map(|addr| addr.ip())
            .collect::<Vec<_>>();

        if addrs.is_empty() {
            return Err(TransportError::Unresolvable {
                host: host.to_owned(),
            });
        }
        Ok(addrs)
    }
}

impl Transport for TcpTransport {
    type Connection = Connection;

    fn resolve_host(&self, host: &str) -> Result<SocketAddr, TransportError> {
        let ip = self.addresses(host)?[0];
        Ok(SocketAddr::new(ip, self.port))
    }

    fn connect(&self, host: &str) -> Result<Connection, TransportError> {
        let link = self.link(host)?;
        {
            let _busy = lock(&link.outbound.busy);
            self.outbound(host, &link)?;
        }

        Ok(Connection {
            host: host.to_owned(),
            link,
        })
    }

    fn connected(&self, host: &str) -> bool {
        !self.is_closed()
            && shared(&self.links)
                .get(host)
                .is_some_and(|link| link.outbound.current().is_some())
    }

    fn read(&self, host: &str, buf: &mut [u8]) -> Result<usize, TransportError> {
        let link = self.connect(host)?.link;
        let _busy = lock(&link.inbound.busy);
        let stream = self.inbound(host, &link)?;

        match (&*stream).read(buf) {
            Ok(0) if !buf.is_empty() => {
                link.inbound.discard(&stream);
                if self.is_closed() {
                    return Err(TransportError::Closed);
                }
                Err(TransportError::PeerClosed {
                    host: host.to_owned(),
                })
            }
            Ok(n) => {
                trace!("read {n} bytes from {host}");
                Ok(n)
            }
            Err(source) => {
                link.inbound.discard(&stream);
                Err(TransportError::Io {
                    host: host.to_owned(),
                    source,
                })
            }
        }
    }

    fn write(&self, host: &str, buf: &[u8]) -> Result<usize, TransportError> {
        let link = self.link(host)?;
        let _busy = lock(&link.outbound.busy);
        let stream = self.outbound(host, &link)?;

        match (&*stream).write_all(buf) {
            Ok(()) => {
                trace!("wrote {} bytes to {host}", buf.len());
                Ok(buf.len())
            }
            Err(source) => {
                // A partial write leaves the stream mid-envelope.
                link.outbound.discard(&stream);
                Err(TransportError::Io {
                    host: host.to_owned(),
                    source,
                })
            }
        }
    }

    fn finalize(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.acceptor.close();
        let links = mem::take(&mut *exclusive(&self.links));
        debug!("closing connections to {} host(s)", links.len());

        let mut failures = Vec::new();
        for (host, link) in links {
            for channel in [&link.outbound, &link.inbound] {
                if let Err(e) = channel.close() {
                    failures.push((host.clone(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Close { failures })
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            debug!("transport dropped with errors: {e}");
        }
    }
}

fn shared<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn exclusive<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    const LOCAL: &str = "127.0.0.1";
    const PEER: &str = "127.0.0.2";

    fn loopback() -> TcpTransport {
        TcpTransport::bind(
            &TransportConfig {
                bind_addr: Ipv4Addr::LOCALHOST.into(),
                port: 0,
            },
            LOCAL,
        )
        .unwrap()
    }

    /// Plain listener standing in for a second host on the transport's port.
    fn peer_listener(transport: &TcpTransport) -> TcpListener {
        TcpListener::bind((PEER, transport.port())).unwrap()
    }

    #[test]
    fn default_config_uses_well_known_port() {
        let config = TransportConfig::default();

        assert_eq!(config.port, 1337);
        assert!(config.bind_addr.is_unspecified());
    }

    #[test]
    fn bind_picks_ephemeral_port() {
        let transport = loopback();

        assert_ne!(transport.port(), 0);
        assert_eq!(transport.local_addr().port(), transport.port());
    }

    #[test]
    fn resolve_host_uses_transport_port() {
        let transport = loopback();
        let addr = transport.resolve_host(LOCAL).unwrap();

        assert_eq!(addr, SocketAddr::new(Ipv4Addr::LOCALHOST.into(), transport.port()));
    }

    #[test]
    fn resolve_unknown_host_fails() {
        let transport = loopback();

        assert!(transport.resolve_host("no-such-host.invalid").is_err());
    }

    #[test]
    fn connect_is_idempotent() {
        let transport = loopback();
        assert!(!transport.connected(LOCAL));

        let first = transport.connect(LOCAL).unwrap();
        let second = transport.connect(LOCAL).unwrap();

        assert!(transport.connected(LOCAL));
        assert!(first.same_as(&second));
        assert_eq!(first.local_addr(), second.local_addr());
        assert_eq!(first.host(), LOCAL);
        assert_eq!(first.peer_addr(), Some(transport.local_addr()));
    }

    #[test]
    fn concurrent_connects_share_one_connection() {
        let transport = Arc::new(loopback());

        let handles = (0..4)
            .map(|_| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || transport.connect(LOCAL).unwrap())
            })
            .collect::<Vec<_>>();
        let connections = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();

        for connection in &connections[1..] {
            assert!(connection.same_as(&connections[0]));
            assert_eq!(connection.local_addr(), connections[0].local_addr());
        }
    }

    #[test]
    fn write_then_read_over_loopback() {
        let transport = loopback();

        assert_eq!(transport.write(LOCAL, b"ping").unwrap(), 4);

        let mut buf = [0; 16];
        let n = transport.read(LOCAL, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        transport.write(LOCAL, b"pong").unwrap();
        let n = transport.read(LOCAL, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn write_failure_redials() {
        let transport = loopback();
        let listener = peer_listener(&transport);

        transport.write(PEER, b"first").unwrap();
        let (accepted, _) = listener.accept().unwrap();
        drop(accepted);

        // The reset only surfaces once the peer has answered an earlier write.
        let mut failed = false;
        for _ in 0..100 {
            if let Err(err) = transport.write(PEER, &[0; 1024]) {
                assert!(matches!(err, TransportError::Io { .. }));
                failed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(failed);
        assert!(!transport.connected(PEER));

        transport.write(PEER, b"again").unwrap();
        assert!(transport.connected(PEER));
        let (mut redialed, _) = listener.accept().unwrap();

        let mut hello = [0; 8 + LOCAL.len()];
        redialed.read_exact(&mut hello).unwrap();
        let mut buf = [0; 5];
        redialed.read_exact(&mut buf).unwrap();
        assert_eq!(&hello[8..], LOCAL.as_bytes());
        assert_eq!(&buf, b"again");
    }

    #[test]
    fn read_after_peer_closes_is_peer_closed() {
        let transport = loopback();
        let _listener = peer_listener(&transport);

        let mut from_peer = TcpStream::connect(transport.local_addr()).unwrap();
        write_hello(&mut from_peer, PEER).unwrap();
        from_peer.write_all(b"last").unwrap();
        drop(from_peer);

        let mut buf = [0; 16];
        let n = transport.read(PEER, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"last");

        assert!(matches!(
            transport.read(PEER, &mut buf),
            Err(TransportError::PeerClosed { host }) if host == PEER
        ));
    }

    #[test]
    fn finalize_closes_everything() {
        let transport = loopback();
        transport.write(LOCAL, b"x").unwrap();

        transport.finalize().unwrap();

        assert!(!transport.connected(LOCAL));
        assert!(matches!(transport.write(LOCAL, b"x"), Err(TransportError::Closed)));
        assert!(matches!(transport.connect(LOCAL), Err(TransportError::Closed)));
        assert!(matches!(
            transport.read(LOCAL, &mut [0; 4]),
            Err(TransportError::Closed)
        ));
        assert!(transport.finalize().is_ok());
    }
}
