//! Index-addressed lists of u64 values.
//!
//! A long list maps a dense u64 index (a bucket number or a tree path) to a
//! u64 value, normally a packed data location. The value 0 is reserved and
//! reads back as "nothing stored".
//!
//! Each list carries a valid range `[min, max]`. Values outside the range are
//! discarded when the range moves, which lets in-memory implementations
//! release whole chunks as the tree shrinks or its leaves shift right.
//!
//! Persisted file layout (all integers little-endian):
//! - version: 4 bytes
//! - min_valid: 8 bytes (u64::MAX when the list is empty)
//! - max_valid: 8 bytes
//! - count: 8 bytes
//! - values: count * 8 bytes, for indices min_valid..min_valid + count

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use virta_common::{Result, VirtaError};

/// Value that can never be stored; reads of empty slots return it.
pub const IMPERMISSIBLE_VALUE: u64 = 0;

/// Current long list file format version.
pub const LONG_LIST_FILE_VERSION: u32 = 1;

/// Size of the persisted long list header.
pub const LONG_LIST_HEADER_SIZE: usize = 4 + 8 + 8 + 8;

/// Marker for an empty valid range in the persisted header.
const EMPTY_RANGE_MARKER: u64 = u64::MAX;

/// A concurrent index to u64 mapping.
pub trait LongList: Send + Sync {
    /// Returns the value at `index`, or `IMPERMISSIBLE_VALUE` if none.
    fn get(&self, index: u64) -> Result<u64>;

    /// Stores `value` at `index`. The index must be inside the valid range
    /// and the value must not be `IMPERMISSIBLE_VALUE`.
    fn put(&self, index: u64, value: u64) -> Result<()>;

    /// Clears the value at `index`.
    fn remove(&self, index: u64) -> Result<()>;

    /// Stores `new_value` only if the current value equals `old_value`.
    ///
    /// Returns false without error when the index is outside the valid range.
    fn put_if_equal(&self, index: u64, old_value: u64, new_value: u64) -> Result<bool>;

    /// One past the highest index ever stored, capped by the valid range.
    fn size(&self) -> u64;

    /// Maximum number of values the list can hold.
    fn capacity(&self) -> u64;

    /// Returns the current valid range, or None when it is empty.
    fn valid_range(&self) -> Option<(u64, u64)>;

    /// Moves the valid range to `[min, max]`, discarding values outside it.
    fn update_valid_range(&self, min: u64, max: u64) -> Result<()>;

    /// Empties the valid range and discards every value.
    fn clear_valid_range(&self) -> Result<()>;

    /// Visits every stored (index, value) pair in index order.
    fn for_each(&self, visitor: &mut dyn FnMut(u64, u64) -> Result<()>) -> Result<()>;

    /// Persists the valid portion of the list to `path`.
    fn write_to_file(&self, path: &Path) -> Result<()>;
}

/// Checks a value before it is stored.
pub(crate) fn check_value(value: u64) -> Result<()> {
    if value == IMPERMISSIBLE_VALUE {
        return Err(VirtaError::invalid_parameter("value", value));
    }
    Ok(())
}

/// Checks a range before it becomes the valid range.
pub(crate) fn check_range(min: u64, max: u64, capacity: u64) -> Result<()> {
    if min > max || max >= capacity {
        return Err(VirtaError::InvalidRange {
            min: min as i64,
            max: max as i64,
        });
    }
    Ok(())
}

/// Header and body of a persisted long list.
pub(crate) struct LongListFile {
    pub range: Option<(u64, u64)>,
    pub values: Vec<u64>,
}

/// Writes a long list file from an iterator over indices `min..min + count`.
pub(crate) fn write_long_list_file(
    path: &Path,
    range: Option<(u64, u64)>,
    count: u64,
    mut value_at: impl FnMut(u64) -> Result<u64>,
) -> Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    out.write_all(&LONG_LIST_FILE_VERSION.to_le_bytes())?;
    let (min, max, count) = match range {
        Some((min, max)) => (min, max, count),
        None => (EMPTY_RANGE_MARKER, EMPTY_RANGE_MARKER, 0),
    };
    out.write_all(&min.to_le_bytes())?;
    out.write_all(&max.to_le_bytes())?;
    out.write_all(&count.to_le_bytes())?;
    for i in 0..count {
        out.write_all(&value_at(min + i)?.to_le_bytes())?;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

/// Reads a long list file fully into memory.
pub(crate) fn read_long_list_file(path: &Path) -> Result<LongListFile> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut input = BufReader::new(file);

    let mut header = [0u8; LONG_LIST_HEADER_SIZE];
    input.read_exact(&mut header).map_err(|_| {
        VirtaError::DecodeError(format!("long list {} is truncated", path.display()))
    })?;
    let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if version != LONG_LIST_FILE_VERSION {
        return Err(VirtaError::DecodeError(format!(
            "unsupported long list version {} in {}",
            version,
            path.display()
        )));
    }
    let min = read_u64(&header[4..12]);
    let max = read_u64(&header[12..20]);
    let count = read_u64(&header[20..28]);

    if min == EMPTY_RANGE_MARKER {
        return Ok(LongListFile {
            range: None,
            values: Vec::new(),
        });
    }
    let expected_len = LONG_LIST_HEADER_SIZE as u64 + count * 8;
    if min > max || count > max - min + 1 || file_len != expected_len {
        return Err(VirtaError::DecodeError(format!(
            "long list {} header does not match its body",
            path.display()
        )));
    }

    let mut values = Vec::with_capacity(count as usize);
    let mut slot = [0u8; 8];
    for _ in 0..count {
        input.read_exact(&mut slot)?;
        values.push(u64::from_le_bytes(slot));
    }
    Ok(LongListFile {
        range: Some((min, max)),
        values,
    })
}

#[inline]
pub(crate) fn read_u64(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(b)
}
