pub mod group;
pub mod node;
pub mod protocol;

pub use group::{GroupError, ProcessGroup, local_hostname, resolve_rank};
pub use node::{MessagingError, Node, NodeConfig, State, Status};
pub use protocol::{
    COMM_WORLD, Codec, Communicator, Datatype, Envelope, TcpTransport, Transport,
    TransportConfig, TransportError, WireCodec,
};
