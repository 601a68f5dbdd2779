use std::{borrow::Cow, fmt};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    de::{Decoder, read::Reader},
    decode_from_slice,
    enc::{Encoder, write::Writer},
    encode_into_std_write,
    error::{DecodeError, EncodeError},
};
use thiserror::Error;

use super::{Communicator, Datatype, Envelope};

const COMMUNICATOR_LEN: usize = size_of::<Communicator>();
const DATATYPE_LEN: usize = size_of::<Datatype>();

/// Width of every integer header field.
pub const FIELD_LEN: usize = 4;
/// Largest integer a header field holds; 7 payload bits per varint byte.
pub const FIELD_MAX: u64 = (1 << (7 * FIELD_LEN)) - 1;
/// Size of the fixed envelope header preceding the payload.
pub const HEADER_LEN: usize = COMMUNICATOR_LEN + 3 * FIELD_LEN + DATATYPE_LEN;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope field '{field}' is {value}, which exceeds the {} byte field limit of {}", FIELD_LEN, FIELD_MAX)]
    FieldOverflow { field: &'static str, value: u64 },
    #[error("envelope is {len} bytes, shorter than the {} byte header", HEADER_LEN)]
    Truncated { len: usize },
    #[error("failed to encode envelope header: {0}")]
    Serialize(#[from] EncodeError),
    #[error("failed to decode envelope header: {0}")]
    Deserialize(#[from] DecodeError),
}

/// Conversion between [`Envelope`]s and their wire representation.
pub trait Codec {
    fn encode(&self, envelope: &Envelope<'_>) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope<'static>, CodecError>;
}

/// The fixed-header envelope format described in [`protocol`](super).
#[derive(Clone, Copy)]
pub struct WireCodec {
    config: Configuration<BigEndian, Fixint>,
}

impl WireCodec {
    pub fn new() -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self { config }
    }
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireCodec")
            .field("header_len", &HEADER_LEN)
            .finish_non_exhaustive()
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for WireCodec {
    fn encode(&self, envelope: &Envelope<'_>) -> Result<Vec<u8>, CodecError> {
        let header = Header::try_from(envelope)?;
        let mut out = Vec::with_capacity(HEADER_LEN + envelope.payload.len());

        encode_into_std_write(header, &mut out, self.config)?;
        out.extend_from_slice(&envelope.payload);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope<'static>, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated { len: bytes.len() });
        }

        let (header, read): (Header, usize) = decode_from_slice(&bytes[..HEADER_LEN], self.config)?;
        Ok(Envelope {
            communicator: header.communicator,
            count: header.count.0 as usize,
            src: header.src.0 as usize,
            tag: header.tag.0,
            datatype: header.datatype,
            payload: Cow::Owned(bytes[read..].to_vec()),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Encode, Decode)]
struct Header {
    communicator: Communicator,
    count: FixedVarint,
    src: FixedVarint,
    tag: FixedVarint,
    datatype: Datatype,
}

impl TryFrom<&Envelope<'_>> for Header {
    type Error = CodecError;

    fn try_from(value: &Envelope<'_>) -> Result<Self, Self::Error> {
        Ok(Self {
            communicator: value.communicator,
            count: FixedVarint::new("count", value.count as u64)?,
            src: FixedVarint::new("src", value.src as u64)?,
            tag: FixedVarint::new("tag", value.tag.into())?,
            datatype: value.datatype,
        })
    }
}

/// Unsigned LEB128 varint occupying exactly [`FIELD_LEN`] bytes on the wire;
/// unused trailing bytes are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FixedVarint(u32);

impl FixedVarint {
    fn new(field: &'static str, value: u64) -> Result<Self, CodecError> {
        if value > FIELD_MAX {
            return Err(CodecError::FieldOverflow { field, value });
        }
        Ok(Self(value as u32))
    }

    fn to_bytes(self) -> [u8; FIELD_LEN] {
        let mut out = [0; FIELD_LEN];
        let mut value = self.0;

        for byte in out.iter_mut() {
            *byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                break;
            }
            *byte |= 0x80;
        }

        out
    }

    fn from_bytes(bytes: [u8; FIELD_LEN]) -> Option<Self> {
        let mut value = 0_u32;

        for (i, byte) in bytes.iter().enumerate() {
            value |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Some(Self(value));
            }
        }

        None
    }
}

impl Encode for FixedVarint {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        encoder.writer().write(&self.to_bytes())
    }
}

impl<Context> Decode<Context> for FixedVarint {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        decoder.claim_bytes_read(FIELD_LEN)?;

        let mut bytes = [0; FIELD_LEN];
        decoder.reader().read(&mut bytes)?;
        Self::from_bytes(bytes).ok_or(DecodeError::Other("unterminated varint field"))
    }
}

bincode::impl_borrow_decode!(FixedVarint);

#[cfg(test)]
mod tests {
    use crate::protocol::COMM_WORLD;

    use super::*;

    #[test]
    fn header_is_24_bytes() {
        assert_eq!(HEADER_LEN, 24);
        assert_eq!(FIELD_MAX, 268_435_455);
    }

    #[test]
    fn codec_is_debug() {
        let out = format!("{:?}", WireCodec::default());

        assert!(out.starts_with("WireCodec"));
        assert!(out.contains("header_len: 24"));
    }

    #[test]
    fn encodes_documented_layout() {
        let codec = WireCodec::new();
        let bytes = codec.encode(&Envelope::world(0, 0, 2, b"hi")).unwrap();

        let mut expected = COMM_WORLD.0.to_vec();
        expected.extend_from_slice(&[2, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&Datatype::CHAR.0);
        expected.extend_from_slice(b"hi");

        assert_eq!(bytes.len(), 26);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn varint_fields_are_padded() {
        assert_eq!(FixedVarint(0).to_bytes(), [0, 0, 0, 0]);
        assert_eq!(FixedVarint(127).to_bytes(), [0x7f, 0, 0, 0]);
        assert_eq!(FixedVarint(300).to_bytes(), [0xac, 0x02, 0, 0]);
        assert_eq!(
            FixedVarint(FIELD_MAX as u32).to_bytes(),
            [0xff, 0xff, 0xff, 0x7f]
        );
    }

    #[test]
    fn varint_fields_parse() {
        assert_eq!(FixedVarint::from_bytes([0xac, 0x02, 0, 0]), Some(FixedVarint(300)));
        assert_eq!(FixedVarint::from_bytes([0x05, 0xff, 0xff, 0xff]), Some(FixedVarint(5)));
        assert_eq!(FixedVarint::from_bytes([0x80; 4]), None);
    }

    #[test]
    fn decode_recovers_header_and_payload() {
        let codec = WireCodec::new();
        let payload = b"The quick red fox jumps over the lazy dog";
        let envelope = Envelope::world(5, 300, payload.len(), payload);

        let decoded = codec.decode(&codec.encode(&envelope).unwrap()).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_keeps_foreign_tokens() {
        let codec = WireCodec::new();
        let envelope = Envelope {
            communicator: Communicator([9; 8]),
            count: 0,
            src: 1,
            tag: 2,
            datatype: Datatype([7; 4]),
            payload: Cow::Borrowed(&[]),
        };

        let decoded = codec.decode(&codec.encode(&envelope).unwrap()).unwrap();

        assert_eq!(decoded.communicator, Communicator([9; 8]));
        assert_eq!(decoded.datatype, Datatype([7; 4]));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_rejects_short_input() {
        let codec = WireCodec::new();
        let bytes = codec.encode(&Envelope::world(0, 0, 0, &[])).unwrap();

        for len in [0, 1, HEADER_LEN - 1] {
            assert!(matches!(
                codec.decode(&bytes[..len]),
                Err(CodecError::Truncated { len: l }) if l == len
            ));
        }
        assert!(codec.decode(&bytes).is_ok());
    }

    #[test]
    fn decode_rejects_unterminated_field() {
        let codec = WireCodec::new();
        let mut bytes = codec.encode(&Envelope::world(0, 0, 0, &[])).unwrap();
        bytes[8..12].copy_from_slice(&[0x80; 4]);

        assert!(matches!(
            codec.decode(&bytes),
            Err(CodecError::Deserialize(_))
        ));
    }

    #[test]
    fn encode_rejects_oversized_fields() {
        let codec = WireCodec::new();

        let err = codec
            .encode(&Envelope::world(FIELD_MAX as usize + 1, 0, 0, &[]))
            .unwrap_err();
        assert!(matches!(err, CodecError::FieldOverflow { field: "src", .. }));

        let err = codec.encode(&Envelope::world(0, u32::MAX, 0, &[])).unwrap_err();
        assert!(matches!(err, CodecError::FieldOverflow { field: "tag", .. }));
    }
}
