use std::{borrow::Cow, fmt};

use bincode::{Decode, Encode};

/// Opaque token identifying the process group a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Communicator(pub [u8; 8]);

/// The default, and only, process group.
pub const COMM_WORLD: Communicator = Communicator([0x41, 0x01, 0x00, 0x00, 0x39, 0x00, 0x00, 0x00]);

/// Opaque token describing the element type of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Datatype(pub [u8; 4]);

impl Datatype {
    /// Single byte / character elements.
    pub const CHAR: Datatype = Datatype([0x01, 0x00, 0x00, 0x00]);

    /// Size in bytes of one element, if the token is known.
    pub fn size(&self) -> Option<usize> {
        match *self {
            Datatype::CHAR => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Datatype::CHAR => write!(f, "char"),
            Datatype(raw) => write!(f, "{raw:02x?}"),
        }
    }
}

/// Header fields and payload of a single point-to-point message.
///
/// The payload is borrowed when sending and owned once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub communicator: Communicator,
    /// Number of `datatype` items in the payload.
    pub count: usize,
    /// Rank of the sending process.
    pub src: usize,
    pub tag: u32,
    pub datatype: Datatype,
    pub payload: Cow<'a, [u8]>,
}

impl<'a> Envelope<'a> {
    /// Envelope in [`COMM_WORLD`] carrying `payload` as characters.
    pub fn world(src: usize, tag: u32, count: usize, payload: &'a [u8]) -> Self {
        Self {
            communicator: COMM_WORLD,
            count,
            src,
            tag,
            datatype: Datatype::CHAR,
            payload: Cow::Borrowed(payload),
        }
    }

    pub fn into_owned(self) -> Envelope<'static> {
        Envelope {
            communicator: self.communicator,
            count: self.count,
            src: self.src,
            tag: self.tag,
            datatype: self.datatype,
            payload: Cow::Owned(self.payload.into_owned()),
        }
    }
}
