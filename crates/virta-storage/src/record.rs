//! Leaf records.
//!
//! ```text
//! +-------------+---------+---------------+-----------+
//! | key_len u32 |   key   | value_len u32 |   value   |
//! +-------------+---------+---------------+-----------+
//! ```
//!
//! Lengths are little-endian. The leaf store prefixes every record with
//! the leaf path.

use bytes::{Buf, BufMut, Bytes};
use virta_common::{Hash, Result, VirtaError};

const LENGTH_SIZE: usize = 4;

/// A key/value pair stored at a leaf of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord {
    pub key: Bytes,
    pub value: Bytes,
}

impl LeafRecord {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }

    /// Hash of the leaf node holding this record.
    pub fn hash(&self) -> Hash {
        Hash::of_leaf(&self.key, &self.value)
    }

    pub fn serialized_size(&self) -> usize {
        2 * LENGTH_SIZE + self.key.len() + self.value.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
        buf
    }

    /// Decodes a record. Key and value share `data`'s buffer.
    pub fn from_bytes(data: &Bytes) -> Result<Self> {
        let mut buf = data.clone();
        let key = read_field(&mut buf, "key")?;
        let value = read_field(&mut buf, "value")?;
        if buf.has_remaining() {
            return Err(VirtaError::DecodeError(format!(
                "{} trailing bytes after leaf record",
                buf.remaining()
            )));
        }
        Ok(Self { key, value })
    }
}

fn read_field(buf: &mut Bytes, name: &str) -> Result<Bytes> {
    if buf.remaining() < LENGTH_SIZE {
        return Err(VirtaError::DecodeError(format!("leaf record {} length truncated", name)));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(VirtaError::DecodeError(format!(
            "leaf record {} needs {} bytes, {} left",
            name,
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encoded_record() {
        let record = LeafRecord::new(Bytes::from_static(b"key"), Bytes::from_static(b"value"));
        let raw = Bytes::from(record.to_bytes());
        assert_eq!(raw.len(), record.serialized_size());
        assert_eq!(LeafRecord::from_bytes(&raw).unwrap(), record);
    }

    #[test]
    fn test_empty_value() {
        let record = LeafRecord::new(Bytes::from_static(b"k"), Bytes::new());
        let decoded = LeafRecord::from_bytes(&Bytes::from(record.to_bytes())).unwrap();
        assert!(decoded.value.is_empty());
        assert_eq!(decoded.hash(), Hash::of_leaf(b"k", b""));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let record = LeafRecord::new(Bytes::from_static(b"key"), Bytes::from_static(b"value"));
        let raw = record.to_bytes();
        let short = Bytes::copy_from_slice(&raw[..raw.len() - 1]);
        assert!(matches!(
            LeafRecord::from_bytes(&short),
            Err(VirtaError::DecodeError(_))
        ));
        let mut long = raw.clone();
        long.push(0);
        assert!(LeafRecord::from_bytes(&Bytes::from(long)).is_err());
    }
}
