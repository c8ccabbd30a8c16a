//! In-memory long list built from lazily allocated chunks of atomics.

use crate::long_list::{
    check_range, check_value, read_long_list_file, write_long_list_file, LongList,
    IMPERMISSIBLE_VALUE,
};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use virta_common::{Result, VirtaError};

type Chunk = Arc<[AtomicU64]>;

/// Long list held entirely in RAM.
///
/// Values live in fixed-size chunks that are only allocated when a value is
/// first written into them. When the valid range moves, chunks further than
/// `reserved_buffer_length` from the range are released.
pub struct LongListHeap {
    /// Longs per chunk.
    chunk_size: u64,
    /// Maximum number of longs.
    max_longs: u64,
    /// Slack kept allocated around the valid range.
    reserved_buffer_length: u64,
    /// Chunk table; `None` for chunks never written or released.
    chunks: RwLock<Vec<Option<Chunk>>>,
    /// One past the highest stored index.
    size: AtomicU64,
    /// Valid range bounds, -1 when empty.
    min_valid: AtomicI64,
    max_valid: AtomicI64,
}

impl LongListHeap {
    /// Creates an empty list.
    pub fn new(chunk_size: usize, max_longs: u64, reserved_buffer_length: u64) -> Self {
        let chunk_size = chunk_size.max(1) as u64;
        Self {
            chunk_size,
            max_longs,
            reserved_buffer_length,
            chunks: RwLock::new(Vec::new()),
            size: AtomicU64::new(0),
            min_valid: AtomicI64::new(-1),
            max_valid: AtomicI64::new(-1),
        }
    }

    /// Loads a list previously written with `write_to_file`.
    pub fn load(
        path: &Path,
        chunk_size: usize,
        max_longs: u64,
        reserved_buffer_length: u64,
    ) -> Result<Self> {
        let file = read_long_list_file(path)?;
        let list = Self::new(chunk_size, max_longs, reserved_buffer_length);
        if let Some((min, max)) = file.range {
            list.update_valid_range(min, max)?;
            for (i, value) in file.values.iter().enumerate() {
                if *value != IMPERMISSIBLE_VALUE {
                    list.put(min + i as u64, *value)?;
                }
            }
        }
        debug!(
            path = %path.display(),
            size = list.size(),
            "Loaded long list into memory"
        );
        Ok(list)
    }

    /// Returns the number of allocated chunks.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.read().iter().filter(|c| c.is_some()).count()
    }

    fn in_valid_range(&self, index: u64) -> bool {
        let min = self.min_valid.load(Ordering::Acquire);
        let max = self.max_valid.load(Ordering::Acquire);
        min >= 0 && index >= min as u64 && index <= max as u64
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.max_longs {
            return Err(VirtaError::IndexOutOfBounds {
                index,
                capacity: self.max_longs,
            });
        }
        Ok(())
    }

    fn chunk(&self, chunk_index: usize) -> Option<Chunk> {
        self.chunks.read().get(chunk_index).and_then(|c| c.clone())
    }

    fn chunk_or_create(&self, chunk_index: usize) -> Chunk {
        if let Some(chunk) = self.chunk(chunk_index) {
            return chunk;
        }
        let mut chunks = self.chunks.write();
        if chunks.len() <= chunk_index {
            chunks.resize(chunk_index + 1, None);
        }
        chunks[chunk_index]
            .get_or_insert_with(|| {
                (0..self.chunk_size)
                    .map(|_| AtomicU64::new(IMPERMISSIBLE_VALUE))
                    .collect()
            })
            .clone()
    }

    fn split(&self, index: u64) -> (usize, usize) {
        (
            (index / self.chunk_size) as usize,
            (index % self.chunk_size) as usize,
        )
    }

    /// Releases chunks far from `[min, max]` and zeroes kept slots outside it.
    fn shrink_to(&self, min: u64, max: u64) {
        let keep_from = min.saturating_sub(self.reserved_buffer_length) / self.chunk_size;
        let keep_to = max.saturating_add(self.reserved_buffer_length) / self.chunk_size;
        let mut chunks = self.chunks.write();
        for (i, slot) in chunks.iter_mut().enumerate() {
            let i = i as u64;
            if i < keep_from || i > keep_to {
                *slot = None;
                continue;
            }
            let Some(chunk) = slot else { continue };
            let start = i * self.chunk_size;
            for (j, cell) in chunk.iter().enumerate() {
                let index = start + j as u64;
                if index < min || index > max {
                    cell.store(IMPERMISSIBLE_VALUE, Ordering::Release);
                }
            }
        }
        let trailing = chunks.iter().rposition(|c| c.is_some()).map_or(0, |p| p + 1);
        chunks.truncate(trailing);
    }
}

impl LongList for LongListHeap {
    fn get(&self, index: u64) -> Result<u64> {
        self.check_index(index)?;
        if index >= self.size.load(Ordering::Acquire) {
            return Ok(IMPERMISSIBLE_VALUE);
        }
        let (chunk_index, sub) = self.split(index);
        Ok(self
            .chunk(chunk_index)
            .map_or(IMPERMISSIBLE_VALUE, |c| c[sub].load(Ordering::Acquire)))
    }

    fn put(&self, index: u64, value: u64) -> Result<()> {
        self.check_index(index)?;
        check_value(value)?;
        if !self.in_valid_range(index) {
            return Err(VirtaError::IndexOutOfBounds {
                index,
                capacity: (self.max_valid.load(Ordering::Acquire) + 1).max(0) as u64,
            });
        }
        let (chunk_index, sub) = self.split(index);
        self.chunk_or_create(chunk_index)[sub].store(value, Ordering::Release);
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    fn remove(&self, index: u64) -> Result<()> {
        self.check_index(index)?;
        let (chunk_index, sub) = self.split(index);
        if let Some(chunk) = self.chunk(chunk_index) {
            chunk[sub].store(IMPERMISSIBLE_VALUE, Ordering::Release);
        }
        Ok(())
    }

    fn put_if_equal(&self, index: u64, old_value: u64, new_value: u64) -> Result<bool> {
        self.check_index(index)?;
        check_value(new_value)?;
        if !self.in_valid_range(index) {
            return Ok(false);
        }
        let (chunk_index, sub) = self.split(index);
        let Some(chunk) = self.chunk(chunk_index) else {
            return Ok(false);
        };
        let swapped = chunk[sub]
            .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.size.fetch_max(index + 1, Ordering::AcqRel);
        }
        Ok(swapped)
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn capacity(&self) -> u64 {
        self.max_longs
    }

    fn valid_range(&self) -> Option<(u64, u64)> {
        let min = self.min_valid.load(Ordering::Acquire);
        let max = self.max_valid.load(Ordering::Acquire);
        (min >= 0).then(|| (min as u64, max as u64))
    }

    fn update_valid_range(&self, min: u64, max: u64) -> Result<()> {
        check_range(min, max, self.max_longs)?;
        self.min_valid.store(min as i64, Ordering::Release);
        self.max_valid.store(max as i64, Ordering::Release);
        self.size.fetch_min(max + 1, Ordering::AcqRel);
        self.shrink_to(min, max);
        Ok(())
    }

    fn clear_valid_range(&self) -> Result<()> {
        self.min_valid.store(-1, Ordering::Release);
        self.max_valid.store(-1, Ordering::Release);
        self.size.store(0, Ordering::Release);
        self.chunks.write().clear();
        Ok(())
    }

    fn for_each(&self, visitor: &mut dyn FnMut(u64, u64) -> Result<()>) -> Result<()> {
        let Some((min, _)) = self.valid_range() else {
            return Ok(());
        };
        for index in min..self.size() {
            let value = self.get(index)?;
            if value != IMPERMISSIBLE_VALUE {
                visitor(index, value)?;
            }
        }
        Ok(())
    }

    fn write_to_file(&self, path: &Path) -> Result<()> {
        let range = self.valid_range();
        let count = range.map_or(0, |(min, _)| self.size().saturating_sub(min));
        write_long_list_file(path, range, count, |i| self.get(i))
    }
}
