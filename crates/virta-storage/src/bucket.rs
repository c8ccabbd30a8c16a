//! Bucket pages of the half-disk hash map.
//!
//! Page layout (little-endian):
//! ```text
//! +----------------------+
//! | bucket_index   (u32) |
//! | bucket_count   (u32) |  <- bucket count when the page was written
//! | entry_count    (u32) |
//! +----------------------+
//! | entry 0              |
//! | entry 1              |
//! | ...                  |
//! +----------------------+
//! ```
//!
//! Entry layout:
//! - hash: 8 bytes (key hash code)
//! - value: 8 bytes
//! - key_len: 4 bytes
//! - key: key_len bytes
//!
//! A page is stored as one variable-length data item, so a bucket never
//! overflows into a second page. Each key appears at most once per page.

use crate::mutation::BucketMutation;
use bytes::{BufMut, Bytes};
use tracing::debug;
use virta_common::{Result, VirtaError};

/// Size of the page header.
pub const BUCKET_HEADER_SIZE: usize = 12;

/// Fixed part of an entry before the key bytes.
pub const ENTRY_HEADER_SIZE: usize = 20;

/// Returns the bucket a key hash falls into for `bucket_count` buckets.
///
/// `bucket_count` is always a power of two.
#[inline]
pub fn bucket_for_hash(hash: u64, bucket_count: u32) -> u32 {
    (hash & (bucket_count as u64 - 1)) as u32
}

/// One key of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    /// Key hash code.
    pub hash: u64,
    /// Stored value.
    pub value: u64,
    /// Serialized key.
    pub key: Bytes,
}

/// A decoded bucket page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    bucket_index: u32,
    bucket_count: u32,
    entries: Vec<BucketEntry>,
}

impl Bucket {
    /// Creates an empty bucket.
    pub fn new(bucket_index: u32, bucket_count: u32) -> Self {
        Self {
            bucket_index,
            bucket_count,
            entries: Vec::new(),
        }
    }

    /// Returns the bucket index.
    pub fn bucket_index(&self) -> u32 {
        self.bucket_index
    }

    /// Returns the bucket count the page was written with.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Returns the entries in page order.
    pub fn entries(&self) -> &[BucketEntry] {
        &self.entries
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the value for `key`.
    pub fn find_value(&self, key: &[u8], hash: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.hash == hash && e.key.as_ref() == key)
            .map(|e| e.value)
    }

    /// Sets the value for `key`, replacing an existing entry in place.
    pub fn put(&mut self, key: Bytes, hash: u64, value: u64) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.hash == hash && e.key == key)
        {
            Some(entry) => entry.value = value,
            None => self.entries.push(BucketEntry { hash, value, key }),
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &[u8], hash: u64) -> Option<u64> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.hash == hash && e.key.as_ref() == key)?;
        Some(self.entries.remove(pos).value)
    }

    /// Applies pending mutations in insertion order.
    ///
    /// A conditional mutation whose expected value no longer matches the page
    /// is skipped. Returns the number of skipped mutations.
    pub fn apply(&mut self, mutation: &BucketMutation) -> usize {
        let mut skipped = 0;
        mutation.for_each_key_value(|key, hash, expected_old, new_value| {
            if let Some(expected) = expected_old {
                if self.find_value(key, hash) != Some(expected) {
                    skipped += 1;
                    return;
                }
            }
            match new_value {
                Some(value) => self.put(Bytes::copy_from_slice(key), hash, value),
                None => {
                    self.remove(key, hash);
                }
            }
        });
        if skipped > 0 {
            debug!(
                bucket = self.bucket_index,
                skipped, "Skipped stale conditional mutations"
            );
        }
        skipped
    }

    /// Returns a copy holding only the entries of `bucket_index` under
    /// `bucket_count` buckets.
    ///
    /// Used when a page written before a resize is split among the buckets
    /// that still share it.
    pub fn sanitized(&self, bucket_index: u32, bucket_count: u32) -> Bucket {
        Bucket {
            bucket_index,
            bucket_count,
            entries: self
                .entries
                .iter()
                .filter(|e| bucket_for_hash(e.hash, bucket_count) == bucket_index)
                .cloned()
                .collect(),
        }
    }

    /// Returns the encoded size of the page.
    pub fn serialized_size(&self) -> usize {
        BUCKET_HEADER_SIZE
            + self
                .entries
                .iter()
                .map(|e| ENTRY_HEADER_SIZE + e.key.len())
                .sum::<usize>()
    }

    /// Serializes the page.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.put_u32_le(self.bucket_index);
        buf.put_u32_le(self.bucket_count);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u64_le(entry.hash);
            buf.put_u64_le(entry.value);
            buf.put_u32_le(entry.key.len() as u32);
            buf.put_slice(&entry.key);
        }
        buf
    }

    /// Deserializes a page. Keys are zero-copy slices of `data`.
    pub fn from_bytes(data: &Bytes) -> Result<Self> {
        let view = BucketView::new(data)?;
        let mut entries = Vec::with_capacity(view.entry_count() as usize);
        view.for_each_entry(|offset, hash, value, key_len| {
            let key = data.slice(offset..offset + key_len);
            entries.push(BucketEntry { hash, value, key });
            false
        })?;
        Ok(Self {
            bucket_index: view.bucket_index(),
            bucket_count: view.bucket_count(),
            entries,
        })
    }
}

/// Read-only view over an encoded page.
///
/// Lookups compare the serialized key bytes in place, without decoding
/// the rest of the page.
#[derive(Debug, Clone, Copy)]
pub struct BucketView<'a> {
    data: &'a [u8],
    bucket_index: u32,
    bucket_count: u32,
    entry_count: u32,
}

impl<'a> BucketView<'a> {
    /// Reads the page header.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < BUCKET_HEADER_SIZE {
            return Err(VirtaError::DecodeError(format!(
                "bucket page of {} bytes is shorter than its header",
                data.len()
            )));
        }
        Ok(Self {
            data,
            bucket_index: read_u32(data, 0),
            bucket_count: read_u32(data, 4),
            entry_count: read_u32(data, 8),
        })
    }

    /// Returns the bucket index.
    pub fn bucket_index(&self) -> u32 {
        self.bucket_index
    }

    /// Returns the bucket count the page was written with.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Returns the number of entries.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Looks up the value for `key`.
    pub fn find_value(&self, key: &[u8], hash: u64) -> Result<Option<u64>> {
        let mut found = None;
        self.for_each_entry(|offset, entry_hash, value, key_len| {
            if entry_hash == hash
                && key_len == key.len()
                && &self.data[offset..offset + key_len] == key
            {
                found = Some(value);
                return true;
            }
            false
        })?;
        Ok(found)
    }

    /// Walks the entries, passing the key offset, hash, value and key length.
    /// Stops early when `visit` returns true.
    fn for_each_entry(
        &self,
        mut visit: impl FnMut(usize, u64, u64, usize) -> bool,
    ) -> Result<()> {
        let mut pos = BUCKET_HEADER_SIZE;
        for i in 0..self.entry_count {
            if pos + ENTRY_HEADER_SIZE > self.data.len() {
                return Err(self.truncated(i));
            }
            let hash = read_u64(self.data, pos);
            let value = read_u64(self.data, pos + 8);
            let key_len = read_u32(self.data, pos + 16) as usize;
            let key_offset = pos + ENTRY_HEADER_SIZE;
            if key_offset + key_len > self.data.len() {
                return Err(self.truncated(i));
            }
            if visit(key_offset, hash, value, key_len) {
                return Ok(());
            }
            pos = key_offset + key_len;
        }
        Ok(())
    }

    fn truncated(&self, entry: u32) -> VirtaError {
        VirtaError::DecodeError(format!(
            "bucket {} truncated at entry {} of {}",
            self.bucket_index, entry, self.entry_count
        ))
    }
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[pos..pos + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use virta_common::key_hash_code;

    fn entry(bucket: &mut Bucket, key: &str, value: u64) {
        let key = Bytes::copy_from_slice(key.as_bytes());
        let hash = key_hash_code(&key);
        bucket.put(key, hash, value);
    }

    #[test]
    fn test_put_replaces_in_place() {
        let mut bucket = Bucket::new(3, 8);
        entry(&mut bucket, "a", 1);
        entry(&mut bucket, "b", 2);
        entry(&mut bucket, "a", 5);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.entries()[0].value, 5);
        assert_eq!(bucket.find_value(b"a", key_hash_code(b"a")), Some(5));
        assert_eq!(bucket.remove(b"b", key_hash_code(b"b")), Some(2));
        assert_eq!(bucket.find_value(b"b", key_hash_code(b"b")), None);
    }

    #[test]
    fn test_encoded_page_matches_decoded() {
        let mut bucket = Bucket::new(7, 16);
        for i in 0..20u64 {
            entry(&mut bucket, &format!("key-{}", i), i * 10);
        }
        let bytes = Bytes::from(bucket.to_bytes());
        assert_eq!(bytes.len(), bucket.serialized_size());

        let decoded = Bucket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, bucket);

        let view = BucketView::new(&bytes).unwrap();
        assert_eq!(view.bucket_index(), 7);
        assert_eq!(view.bucket_count(), 16);
        assert_eq!(view.entry_count(), 20);
        assert_eq!(
            view.find_value(b"key-13", key_hash_code(b"key-13")).unwrap(),
            Some(130)
        );
        assert_eq!(
            view.find_value(b"key-99", key_hash_code(b"key-99")).unwrap(),
            None
        );
    }

    #[test]
    fn test_colliding_hashes_compare_keys() {
        let mut bucket = Bucket::new(0, 2);
        bucket.put(Bytes::from_static(b"left"), 42, 1);
        bucket.put(Bytes::from_static(b"right"), 42, 2);
        assert_eq!(bucket.len(), 2);
        let bytes = Bytes::from(bucket.to_bytes());
        let view = BucketView::new(&bytes).unwrap();
        assert_eq!(view.find_value(b"left", 42).unwrap(), Some(1));
        assert_eq!(view.find_value(b"right", 42).unwrap(), Some(2));
    }

    #[test]
    fn test_truncated_page_rejected() {
        let mut bucket = Bucket::new(1, 4);
        entry(&mut bucket, "abc", 1);
        let bytes = bucket.to_bytes();
        let cut = Bytes::copy_from_slice(&bytes[..bytes.len() - 2]);
        assert!(matches!(
            Bucket::from_bytes(&cut),
            Err(VirtaError::DecodeError(_))
        ));
        assert!(BucketView::new(&bytes[..5]).is_err());
    }

    #[test]
    fn test_sanitized_keeps_own_entries() {
        let mut bucket = Bucket::new(1, 2);
        bucket.put(Bytes::from_static(b"x"), 0b001, 1);
        bucket.put(Bytes::from_static(b"y"), 0b011, 2);
        bucket.put(Bytes::from_static(b"z"), 0b101, 3);

        let low = bucket.sanitized(1, 4);
        let high = bucket.sanitized(3, 4);
        assert_eq!(low.len(), 2);
        assert_eq!(high.len(), 1);
        assert_eq!(high.bucket_index(), 3);
        assert_eq!(high.bucket_count(), 4);
        assert_eq!(high.find_value(b"y", 0b011), Some(2));
    }

    #[test]
    fn test_apply_mutation() {
        let mut bucket = Bucket::new(0, 1);
        bucket.put(Bytes::from_static(b"keep"), 1, 10);
        bucket.put(Bytes::from_static(b"drop"), 2, 20);
        bucket.put(Bytes::from_static(b"cond"), 3, 30);

        let mut mutation = BucketMutation::new();
        mutation.put(Bytes::from_static(b"drop"), 2, None);
        mutation.put(Bytes::from_static(b"new"), 4, Some(40));
        assert!(mutation.put_if_equal(Bytes::from_static(b"cond"), 3, 99, Some(31)));

        let skipped = bucket.apply(&mutation);
        assert_eq!(skipped, 1);
        assert_eq!(bucket.find_value(b"keep", 1), Some(10));
        assert_eq!(bucket.find_value(b"drop", 2), None);
        assert_eq!(bucket.find_value(b"new", 4), Some(40));
        assert_eq!(bucket.find_value(b"cond", 3), Some(30));
    }

    #[test]
    fn test_bucket_for_hash() {
        assert_eq!(bucket_for_hash(0b1011, 4), 0b11);
        assert_eq!(bucket_for_hash(u64::MAX, 2), 1);
        assert_eq!(bucket_for_hash(12345, 1), 0);
    }
}
