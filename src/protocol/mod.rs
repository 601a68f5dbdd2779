//! Wire protocol and transport between ranked processes.
//!
//! This module defines how a message travels from one process of a
//! [`ProcessGroup`](crate::ProcessGroup) to another: the binary envelope that frames
//! every message, the codec that turns envelopes into bytes, and the TCP transport
//! that owns one connection per peer host.
//!
//! # Key Components
//!
//! - [`Envelope`]: Header fields plus payload exchanged between two processes.
//! - [`Codec`]: Abstraction over envelope wire formats; [`WireCodec`] is the only one today.
//! - [`Transport`]: Abstraction over host-addressed byte streams; [`TcpTransport`] is the only one today.
//!
//! # Binary Format
//!
//! Every envelope starts with a fixed 24 byte header followed by the raw payload:
//!
//! ```text
//! +--------------+-------+-------+-------+----------+-------------+
//! | communicator | count |  src  |  tag  | datatype |   payload   |
//! |      8       |   4   |   4   |   4   |    4     |  remaining  |
//! +--------------+-------+-------+-------+----------+-------------+
//! ```
//!
//! - Tokens (`communicator`, `datatype`) are copied verbatim.
//! - Integers are unsigned LEB128 varints zero-padded to a 4 byte field, which caps
//!   them at [`FIELD_MAX`].
//! - There is no length prefix: the payload is every byte after the header, so a
//!   message ends wherever the transport read ends.
//!
//! The destination rank is never written. It is implied by the connection that
//! carries the bytes.
//!
//! # See Also
//!
//! - [`node`](crate::node): Facade that drives the codec and transport.
mod codec;
mod envelope;
mod listener;
mod transport;

pub use codec::{Codec, CodecError, FIELD_LEN, FIELD_MAX, HEADER_LEN, WireCodec};
pub use envelope::{COMM_WORLD, Communicator, Datatype, Envelope};
pub use transport::{Connection, DEFAULT_PORT, TcpTransport, Transport, TransportConfig, TransportError};
