//! Binary (de)serialization traits used by the log manager's on-disk record
//! format. Ported from the teacher's `Encodeable`/`Decodeable` pair.

use std::convert::TryInto;
use std::io::Read;
use std::mem::size_of;

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self>;
}

pub fn read_exact_bytes<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
                    let bytes = read_exact_bytes(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i8, i16, i32, i64, usize);

/// Size-prefixed byte blob: a `u64` length followed by the payload.
///
/// Every variable-length field in the log record format (before/after
/// images) uses this framing, consistent with how the teacher frames its
/// own `Vec<u8>`/`BitVec` fields.
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.len());
        buf.extend_from_slice(&(self.len() as u64).to_le_bytes());
        buf.extend_from_slice(self);
        buf
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let len = u64::decode_from(reader)? as usize;
        read_exact_bytes(reader, len)
    }
}
