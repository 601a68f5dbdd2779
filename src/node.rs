//! Point-to-point messaging between ranked processes.
//!
//! [`Node`] ties a [`ProcessGroup`], a [`Codec`] and a [`Transport`] together and
//! exposes the four blocking operations a program runs through:
//!
//! 1. [`Node::initialize`] connects to every host in the group, this one included.
//! 2. [`Node::send`] and [`Node::receive`] exchange envelopes with a peer by rank.
//! 3. [`Node::finalize`] closes every connection.
//!
//! # Example
//! ```no_run
//! use rankwire::{Node, NodeConfig, ProcessGroup};
//!
//! let group = ProcessGroup::from_hostfile("host_file").unwrap();
//! let mut node = Node::bind(group, &NodeConfig::default()).unwrap();
//! node.initialize().unwrap();
//!
//! if node.rank() == 0 {
//!     node.send(b"hello", 5, 1, 0).unwrap();
//! } else {
//!     let mut buf = Vec::new();
//!     node.receive(&mut buf, 5, 0, 0).unwrap();
//! }
//!
//! node.finalize().unwrap();
//! ```
//!
//! # Limitations
//!
//! - Envelopes carry no length, so a receive returns whatever one transport read
//!   yields. Two messages sent back to back may arrive in one receive, and a large
//!   message may be split across several.
//! - The `tag` given to [`Node::receive`] is not matched against the envelope; the
//!   next bytes from the source are the message.
use log::debug;
use thiserror::Error;

use crate::{
    group::{GroupError, ProcessGroup, local_hostname},
    protocol::{
        Codec, CodecError, Datatype, Envelope, FIELD_MAX, HEADER_LEN, TcpTransport, Transport,
        TransportConfig, TransportError, WireCodec,
    },
};

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("invalid process group: {0}")]
    Group(#[from] GroupError),
    #[error("unable to determine the local hostname")]
    Hostname,
    #[error("local host '{hostname}' is not a member of the process group")]
    RankUnresolved { hostname: String },
    #[error("{role} rank {rank} is out of range for a group of {size}")]
    OutOfRange {
        role: &'static str,
        rank: usize,
        size: usize,
    },
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },
    #[error("connection error: {0}")]
    Connection(#[from] TransportError),
    #[error("failed to encode message: {0}")]
    Encode(#[source] CodecError),
    #[error("failed to decode message: {0}")]
    Decode(#[source] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
    Finalized,
}

/// Header of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Rank the sender put in the envelope.
    pub source: usize,
    pub tag: u32,
    pub count: usize,
    /// Payload bytes copied into the caller's buffer.
    pub len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub transport: TransportConfig,
    /// Used instead of the machine hostname to find this process's rank.
    pub hostname: Option<String>,
}

/// A process taking part in a [`ProcessGroup`].
pub struct Node<T: Transport = TcpTransport, C: Codec = WireCodec> {
    group: ProcessGroup,
    rank: usize,
    transport: T,
    codec: C,
    state: State,
}

impl Node {
    /// Binds a TCP transport and resolves this process's rank.
    pub fn bind(group: ProcessGroup, config: &NodeConfig) -> Result<Self, MessagingError> {
        let hostname = match &config.hostname {
            Some(hostname) => hostname.clone(),
            None => local_hostname().ok_or(MessagingError::Hostname)?,
        };

        // Resolve before binding so a foreign host never claims the port.
        if group.rank_of(&hostname).is_none() {
            return Err(MessagingError::RankUnresolved { hostname });
        }

        let transport = TcpTransport::bind(&config.transport, &hostname)?;
        Self::new(group, &hostname, transport, WireCodec::new())
    }
}

impl<T: Transport, C: Codec> Node<T, C> {
    pub fn new(
        group: ProcessGroup,
        hostname: &str,
        transport: T,
        codec: C,
    ) -> Result<Self, MessagingError> {
        let rank = group
            .rank_of(hostname)
            .ok_or_else(|| MessagingError::RankUnresolved {
                hostname: hostname.to_owned(),
            })?;

        Ok(Self {
            group,
            rank,
            transport,
            codec,
            state: State::Uninitialized,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of processes in the group.
    pub fn size(&self) -> usize {
        self.group.len()
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connects to every host in the group in rank order. The first failure
    /// aborts and leaves the node uninitialized.
    pub fn initialize(&mut self) -> Result<(), MessagingError> {
        if self.state != State::Uninitialized {
            return Err(MessagingError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }

        for host in self.group.hosts() {
            debug!("rank {} connecting to {host}", self.rank);
            self.transport.connect(host)?;
        }

        self.state = State::Initialized;
        Ok(())
    }

    /// Sends `count` items of `buf` to the process at rank `dest`.
    pub fn send(
        &self,
        buf: &[u8],
        count: usize,
        dest: usize,
        tag: u32,
    ) -> Result<(), MessagingError> {
        self.ensure_initialized("send")?;
        let host = self.host("destination", dest)?;

        let envelope = Envelope::world(self.rank, tag, count, buf);
        let bytes = self.codec.encode(&envelope).map_err(MessagingError::Encode)?;

        self.transport.write(host, &bytes)?;
        Ok(())
    }

    /// Receives the next message from rank `src` into `buf`, replacing its
    /// contents.
    ///
    /// `count` is the number of payload items expected, the same value the
    /// sender passed to [`Node::send`]. The header is not part of it: one read
    /// of up to [`HEADER_LEN`]` + count` bytes is made.
    pub fn receive(
        &self,
        buf: &mut Vec<u8>,
        count: usize,
        src: usize,
        _tag: u32,
    ) -> Result<Status, MessagingError> {
        self.ensure_initialized("receive")?;
        let host = self.host("source", src)?;

        if count as u64 > FIELD_MAX {
            return Err(MessagingError::Decode(CodecError::FieldOverflow {
                field: "count",
                value: count as u64,
            }));
        }

        let item = Datatype::CHAR.size().unwrap_or(1);
        let mut encoded = vec![0; HEADER_LEN + count * item];
        let n = self.transport.read(host, &mut encoded)?;
        let envelope = self
            .codec
            .decode(&encoded[..n])
            .map_err(MessagingError::Decode)?;

        buf.clear();
        buf.extend_from_slice(&envelope.payload);

        Ok(Status {
            source: envelope.src,
            tag: envelope.tag,
            count: envelope.count,
            len: buf.len(),
        })
    }

    /// Closes every connection. The node is finalized even if some connections
    /// failed to close; those failures are returned.
    pub fn finalize(&mut self) -> Result<(), MessagingError> {
        if self.state != State::Initialized {
            return Err(MessagingError::InvalidState {
                operation: "finalize",
                state: self.state,
            });
        }

        self.state = State::Finalized;
        debug!("rank {} finalizing", self.rank);
        self.transport.finalize()?;
        Ok(())
    }

    fn ensure_initialized(&self, operation: &'static str) -> Result<(), MessagingError> {
        match self.state {
            State::Initialized => Ok(()),
            State::Finalized => Err(TransportError::Closed.into()),
            state => Err(MessagingError::InvalidState { operation, state }),
        }
    }

    fn host(&self, role: &'static str, rank: usize) -> Result<&str, MessagingError> {
        self.group.host(rank).ok_or(MessagingError::OutOfRange {
            role,
            rank,
            size: self.group.len(),
        })
    }
}
