//! File-backed long list.

use crate::long_list::{
    check_range, check_value, read_long_list_file, read_u64, write_long_list_file, LongList,
    IMPERMISSIBLE_VALUE,
};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::debug;
use virta_common::{Result, VirtaError};

/// Bytes per slot.
const SLOT_SIZE: u64 = 8;

/// Zero block used to clear discarded slots.
const ZERO_BLOCK: [u8; 64 * 1024] = [0u8; 64 * 1024];

/// Long list whose slots live in a scratch file instead of RAM.
///
/// Slot `i` is stored at byte offset `i * 8` of the scratch file. The file is
/// private to the list and removed when the list is dropped; use
/// `write_to_file` to persist.
pub struct LongListDisk {
    /// Path of the scratch file.
    path: PathBuf,
    /// The scratch file handle.
    file: Mutex<File>,
    /// Maximum number of longs.
    max_longs: u64,
    /// One past the highest stored index.
    size: AtomicU64,
    /// Valid range bounds, -1 when empty.
    min_valid: AtomicI64,
    max_valid: AtomicI64,
}

impl LongListDisk {
    /// Creates an empty list backed by a new scratch file at `path`.
    pub fn new(path: &Path, max_longs: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            max_longs,
            size: AtomicU64::new(0),
            min_valid: AtomicI64::new(-1),
            max_valid: AtomicI64::new(-1),
        })
    }

    /// Loads a persisted list from `source` into a new scratch file.
    pub fn load(source: &Path, scratch: &Path, max_longs: u64) -> Result<Self> {
        let persisted = read_long_list_file(source)?;
        let list = Self::new(scratch, max_longs)?;
        if let Some((min, max)) = persisted.range {
            list.update_valid_range(min, max)?;
            let mut bytes = Vec::with_capacity(persisted.values.len() * SLOT_SIZE as usize);
            for value in &persisted.values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            let mut file = list.file.lock();
            file.seek(SeekFrom::Start(min * SLOT_SIZE))?;
            file.write_all(&bytes)?;
            drop(file);
            list.size
                .store(min + persisted.values.len() as u64, Ordering::Release);
        }
        debug!(
            source = %source.display(),
            size = list.size(),
            "Loaded long list onto disk"
        );
        Ok(list)
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

    fn read_slot(file: &mut File, index: u64) -> Result<u64> {
        let offset = index * SLOT_SIZE;
        if offset + SLOT_SIZE > file.metadata()?.len() {
            return Ok(IMPERMISSIBLE_VALUE);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)?;
        Ok(read_u64(&buf))
    }

    fn write_slot(file: &mut File, index: u64, value: u64) -> Result<()> {
        file.seek(SeekFrom::Start(index * SLOT_SIZE))?;
        file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn zero_slots(file: &mut File, from: u64, to: u64) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        file.seek(SeekFrom::Start(from * SLOT_SIZE))?;
        let mut remaining = (to - from) * SLOT_SIZE;
        while remaining > 0 {
            let n = remaining.min(ZERO_BLOCK.len() as u64) as usize;
            file.write_all(&ZERO_BLOCK[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl LongList for LongListDisk {
    fn get(&self, index: u64) -> Result<u64> {
        self.check_index(index)?;
        if index >= self.size.load(Ordering::Acquire) {
            return Ok(IMPERMISSIBLE_VALUE);
        }
        let mut file = self.file.lock();
        Self::read_slot(&mut file, index)
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
        let mut file = self.file.lock();
        Self::write_slot(&mut file, index, value)?;
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    fn remove(&self, index: u64) -> Result<()> {
        self.check_index(index)?;
        if index >= self.size.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut file = self.file.lock();
        Self::write_slot(&mut file, index, IMPERMISSIBLE_VALUE)
    }

    fn put_if_equal(&self, index: u64, old_value: u64, new_value: u64) -> Result<bool> {
        self.check_index(index)?;
        check_value(new_value)?;
        if !self.in_valid_range(index) {
            return Ok(false);
        }
        let mut file = self.file.lock();
        if Self::read_slot(&mut file, index)? != old_value {
            return Ok(false);
        }
        Self::write_slot(&mut file, index, new_value)?;
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(true)
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
        let mut file = self.file.lock();
        let size = self.size.load(Ordering::Acquire);
        let old_min = self.valid_range().map_or(0, |(m, _)| m);
        Self::zero_slots(&mut file, old_min, min.min(size))?;
        if size > max + 1 {
            file.set_len((max + 1) * SLOT_SIZE)?;
        }
        self.min_valid.store(min as i64, Ordering::Release);
        self.max_valid.store(max as i64, Ordering::Release);
        self.size.fetch_min(max + 1, Ordering::AcqRel);
        Ok(())
    }

    fn clear_valid_range(&self) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0)?;
        self.min_valid.store(-1, Ordering::Release);
        self.max_valid.store(-1, Ordering::Release);
        self.size.store(0, Ordering::Release);
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

impl Drop for LongListDisk {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::long_list_heap::LongListHeap;
    use tempfile::tempdir;

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let list = LongListDisk::new(&dir.path().join("scratch"), 1_000_000).unwrap();
        list.update_valid_range(0, 999_999).unwrap();
        assert_eq!(list.get(10).unwrap(), IMPERMISSIBLE_VALUE);
        list.put(10, 99).unwrap();
        list.put(500_000, 5).unwrap();
        assert_eq!(list.get(10).unwrap(), 99);
        assert_eq!(list.get(11).unwrap(), IMPERMISSIBLE_VALUE);
        assert_eq!(list.get(500_000).unwrap(), 5);
        assert_eq!(list.size(), 500_001);
        list.remove(10).unwrap();
        assert_eq!(list.get(10).unwrap(), IMPERMISSIBLE_VALUE);
    }

    #[test]
    fn test_put_if_equal() {
        let dir = tempdir().unwrap();
        let list = LongListDisk::new(&dir.path().join("scratch"), 100).unwrap();
        list.update_valid_range(0, 99).unwrap();
        assert!(list.put_if_equal(4, IMPERMISSIBLE_VALUE, 8).unwrap());
        assert!(!list.put_if_equal(4, 7, 9).unwrap());
        assert!(list.put_if_equal(4, 8, 9).unwrap());
        assert_eq!(list.get(4).unwrap(), 9);
    }

    #[test]
    fn test_range_update() {
        let dir = tempdir().unwrap();
        let list = LongListDisk::new(&dir.path().join("scratch"), 1000).unwrap();
        list.update_valid_range(0, 999).unwrap();
        for i in 0..100 {
            list.put(i, i + 1).unwrap();
        }
        list.update_valid_range(20, 49).unwrap();
        assert_eq!(list.get(19).unwrap(), IMPERMISSIBLE_VALUE);
        assert_eq!(list.get(20).unwrap(), 21);
        assert_eq!(list.get(50).unwrap(), IMPERMISSIBLE_VALUE);
        assert!(list.put(60, 1).is_err());

        // Growing the range again must not resurrect discarded slots.
        list.update_valid_range(0, 999).unwrap();
        assert_eq!(list.get(10).unwrap(), IMPERMISSIBLE_VALUE);
        assert_eq!(list.get(60).unwrap(), IMPERMISSIBLE_VALUE);
    }

    #[test]
    fn test_interchangeable_with_heap_files() {
        let dir = tempdir().unwrap();
        let heap = LongListHeap::new(64, 10_000, 0);
        heap.update_valid_range(5, 9_000).unwrap();
        heap.put(5, 1).unwrap();
        heap.put(8_000, 2).unwrap();
        let persisted = dir.path().join("index.ll");
        heap.write_to_file(&persisted).unwrap();

        let disk = LongListDisk::load(&persisted, &dir.path().join("scratch"), 10_000).unwrap();
        assert_eq!(disk.valid_range(), Some((5, 9_000)));
        assert_eq!(disk.get(5).unwrap(), 1);
        assert_eq!(disk.get(8_000).unwrap(), 2);

        let again = dir.path().join("again.ll");
        disk.write_to_file(&again).unwrap();
        let heap2 = LongListHeap::load(&again, 64, 10_000, 0).unwrap();
        assert_eq!(heap2.get(8_000).unwrap(), 2);
    }

    #[test]
    fn test_scratch_removed_on_drop() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        {
            let list = LongListDisk::new(&scratch, 10).unwrap();
            list.update_valid_range(0, 9).unwrap();
            list.put(1, 1).unwrap();
            assert!(scratch.exists());
        }
        assert!(!scratch.exists());
    }
}
