//! Record serialization and block payload codecs.
//!
//! The wire and disk format of a record is up to the [`RecordSerializer`];
//! the default frames key and value with big-endian `u32` lengths. A
//! [`BlockCodec`] transforms a spilled block payload as a whole, e.g. to
//! compress it. Only the identity codec ships with Eddy.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ClientError;

pub trait RecordSerializer: Send + Sync {
    /// Append one record to `out`.
    fn serialize(&self, key: &[u8], value: &[u8], out: &mut BytesMut);

    /// Split a block payload back into records.
    fn deserialize(&self, data: Bytes) -> Result<Vec<(Bytes, Bytes)>, ClientError>;
}

/// `[key_len u32][key][value_len u32][value]` per record.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedSerializer;

impl LengthPrefixedSerializer {
    fn field(data: &mut Bytes) -> Result<Bytes, ClientError> {
        if data.remaining() < 4 {
            return Err(ClientError::Decode(format!(
                "truncated length prefix: {} bytes left",
                data.remaining()
            )));
        }
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(ClientError::Decode(format!(
                "field of {len} bytes but only {} left",
                data.remaining()
            )));
        }
        Ok(data.split_to(len))
    }
}

impl RecordSerializer for LengthPrefixedSerializer {
    fn serialize(&self, key: &[u8], value: &[u8], out: &mut BytesMut) {
        out.reserve(8 + key.len() + value.len());
        out.put_u32(key.len() as u32);
        out.put_slice(key);
        out.put_u32(value.len() as u32);
        out.put_slice(value);
    }

    fn deserialize(&self, mut data: Bytes) -> Result<Vec<(Bytes, Bytes)>, ClientError> {
        let mut records = Vec::new();
        while data.has_remaining() {
            let key = Self::field(&mut data)?;
            let value = Self::field(&mut data)?;
            records.push((key, value));
        }
        Ok(records)
    }
}

pub trait BlockCodec: Send + Sync {
    fn encode(&self, raw: Bytes) -> Bytes;

    /// Restore a payload of `uncompressed_length` bytes.
    fn decode(&self, data: Bytes, uncompressed_length: u32) -> Result<Bytes, ClientError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl BlockCodec for IdentityCodec {
    fn encode(&self, raw: Bytes) -> Bytes {
        raw
    }

    fn decode(&self, data: Bytes, uncompressed_length: u32) -> Result<Bytes, ClientError> {
        if data.len() != uncompressed_length as usize {
            return Err(ClientError::Decode(format!(
                "identity block of {} bytes claims {uncompressed_length} uncompressed",
                data.len()
            )));
        }
        Ok(data)
    }
}
