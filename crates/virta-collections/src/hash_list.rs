//! In-memory list of node hashes indexed by tree path.
//!
//! Persisted file layout (little-endian):
//! - version: 4 bytes
//! - count: 8 bytes
//! - hashes: count * 48 bytes, an all-zero slot meaning "not stored"

use parking_lot::RwLock;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;
use virta_common::{Hash, Result, VirtaError, HASH_SIZE};

/// Current hash list file format version.
pub const HASH_LIST_FILE_VERSION: u32 = 1;

/// Hashes for the low paths of the tree, kept in RAM.
///
/// Storage is split into chunks of `hashes_per_chunk` slots that are allocated
/// on first write, so a very large capacity costs nothing until used.
pub struct HashListRam {
    hashes_per_chunk: u64,
    capacity: u64,
    inner: RwLock<HashListInner>,
}

struct HashListInner {
    chunks: Vec<Option<Box<[u8]>>>,
    size: u64,
}

impl HashListRam {
    /// Creates an empty list able to hold `capacity` hashes.
    pub fn new(hashes_per_chunk: usize, capacity: u64) -> Self {
        Self {
            hashes_per_chunk: hashes_per_chunk.max(1) as u64,
            capacity,
            inner: RwLock::new(HashListInner {
                chunks: Vec::new(),
                size: 0,
            }),
        }
    }

    /// Loads a list written with `write_to_file`.
    pub fn load(path: &Path, hashes_per_chunk: usize, capacity: u64) -> Result<Self> {
        let file = File::open(path)?;
        let mut input = BufReader::new(file);
        let mut header = [0u8; 12];
        input.read_exact(&mut header).map_err(|_| {
            VirtaError::DecodeError(format!("hash list {} is truncated", path.display()))
        })?;
        let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if version != HASH_LIST_FILE_VERSION {
            return Err(VirtaError::DecodeError(format!(
                "unsupported hash list version {}",
                version
            )));
        }
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header[4..12]);
        let count = u64::from_le_bytes(count_bytes);

        let list = Self::new(hashes_per_chunk, capacity);
        let mut slot = [0u8; HASH_SIZE];
        for path_index in 0..count.min(capacity) {
            input.read_exact(&mut slot)?;
            if slot != [0u8; HASH_SIZE] {
                list.put(path_index, &Hash::new(slot))?;
            }
        }
        debug!(path = %path.display(), count, "Loaded RAM hash list");
        Ok(list)
    }

    /// Returns the hash stored at `path`, if any.
    pub fn get(&self, path: u64) -> Result<Option<Hash>> {
        self.check_index(path)?;
        let inner = self.inner.read();
        if path >= inner.size {
            return Ok(None);
        }
        let (chunk_index, offset) = self.split(path);
        let Some(Some(chunk)) = inner.chunks.get(chunk_index) else {
            return Ok(None);
        };
        let slot = &chunk[offset..offset + HASH_SIZE];
        if slot.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        Hash::from_slice(slot).map(Some)
    }

    /// Stores the hash for `path`.
    pub fn put(&self, path: u64, hash: &Hash) -> Result<()> {
        self.check_index(path)?;
        let (chunk_index, offset) = self.split(path);
        let chunk_bytes = self.hashes_per_chunk as usize * HASH_SIZE;
        let mut inner = self.inner.write();
        if inner.chunks.len() <= chunk_index {
            inner.chunks.resize_with(chunk_index + 1, || None);
        }
        let chunk = inner.chunks[chunk_index]
            .get_or_insert_with(|| vec![0u8; chunk_bytes].into_boxed_slice());
        chunk[offset..offset + HASH_SIZE].copy_from_slice(hash.as_bytes());
        inner.size = inner.size.max(path + 1);
        Ok(())
    }

    /// Drops every hash at or above `new_size`.
    pub fn truncate(&self, new_size: u64) {
        let mut inner = self.inner.write();
        if new_size >= inner.size {
            return;
        }
        let keep_chunks = new_size.div_ceil(self.hashes_per_chunk) as usize;
        inner.chunks.truncate(keep_chunks);
        if let Some(Some(last)) = inner.chunks.last_mut() {
            let used = (new_size % self.hashes_per_chunk) as usize;
            if used > 0 {
                last[used * HASH_SIZE..].fill(0);
            }
        }
        inner.size = new_size;
    }

    /// One past the highest stored path.
    pub fn size(&self) -> u64 {
        self.inner.read().size
    }

    /// Persists the list to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let size = inner.size;
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&HASH_LIST_FILE_VERSION.to_le_bytes())?;
        out.write_all(&size.to_le_bytes())?;
        let chunks = &inner.chunks;
        let empty = [0u8; HASH_SIZE];
        for path_index in 0..size {
            let (chunk_index, offset) = self.split(path_index);
            match chunks.get(chunk_index) {
                Some(Some(chunk)) => out.write_all(&chunk[offset..offset + HASH_SIZE])?,
                _ => out.write_all(&empty)?,
            }
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }

    fn check_index(&self, path: u64) -> Result<()> {
        if path >= self.capacity {
            return Err(VirtaError::IndexOutOfBounds {
                index: path,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn split(&self, path: u64) -> (usize, usize) {
        (
            (path / self.hashes_per_chunk) as usize,
            (path % self.hashes_per_chunk) as usize * HASH_SIZE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn h(n: u8) -> Hash {
        Hash::of_leaf(&[n], &[n])
    }

    #[test]
    fn test_put_get() {
        let list = HashListRam::new(4, 100);
        assert_eq!(list.get(3).unwrap(), None);
        list.put(3, &h(3)).unwrap();
        list.put(50, &h(50)).unwrap();
        assert_eq!(list.get(3).unwrap(), Some(h(3)));
        assert_eq!(list.get(4).unwrap(), None);
        assert_eq!(list.get(50).unwrap(), Some(h(50)));
        assert_eq!(list.size(), 51);
        assert!(list.put(100, &h(1)).is_err());
    }

    #[test]
    fn test_truncate() {
        let list = HashListRam::new(4, 100);
        for i in 0..20u8 {
            list.put(i as u64, &h(i)).unwrap();
        }
        list.truncate(6);
        assert_eq!(list.size(), 6);
        assert_eq!(list.get(5).unwrap(), Some(h(5)));
        assert_eq!(list.get(6).unwrap(), None);
        list.put(10, &h(10)).unwrap();
        assert_eq!(list.get(7).unwrap(), None);
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hashes.hl");
        let list = HashListRam::new(8, 1000);
        list.put(0, &h(0)).unwrap();
        list.put(77, &h(77)).unwrap();
        list.write_to_file(&path).unwrap();

        let loaded = HashListRam::load(&path, 8, 1000).unwrap();
        assert_eq!(loaded.size(), 78);
        assert_eq!(loaded.get(0).unwrap(), Some(h(0)));
        assert_eq!(loaded.get(1).unwrap(), None);
        assert_eq!(loaded.get(77).unwrap(), Some(h(77)));
    }
}
