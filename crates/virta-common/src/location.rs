//! Packed data locations.

use std::fmt;

/// Number of bits used for the byte offset.
pub const OFFSET_BITS: u32 = 40;

/// Largest byte offset a location can address.
pub const MAX_OFFSET: u64 = (1 << OFFSET_BITS) - 1;

/// Largest file index a location can address.
pub const MAX_FILE_INDEX: u32 = (1 << (64 - OFFSET_BITS)) - 1;

/// Raw value meaning "no location".
pub const NON_EXISTENT_LOCATION: u64 = 0;

/// Position of a data item inside a data file collection.
///
/// Packed into a u64 as file index (24 bits) and byte offset (40 bits).
/// Offsets are never zero because every file starts with a header, so the
/// packed value 0 is free to mean "no location".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataLocation {
    /// Index of the data file.
    pub file_index: u32,
    /// Byte offset of the item frame within the file.
    pub offset: u64,
}

impl DataLocation {
    /// Creates a new DataLocation.
    pub fn new(file_index: u32, offset: u64) -> Self {
        debug_assert!(file_index <= MAX_FILE_INDEX);
        debug_assert!(offset <= MAX_OFFSET);
        Self { file_index, offset }
    }

    /// Returns the location as a single u64 for index storage.
    pub fn as_u64(&self) -> u64 {
        ((self.file_index as u64) << OFFSET_BITS) | (self.offset & MAX_OFFSET)
    }

    /// Creates a DataLocation from its u64 representation.
    ///
    /// Returns None for the "no location" value.
    pub fn from_u64(value: u64) -> Option<Self> {
        if value == NON_EXISTENT_LOCATION {
            return None;
        }
        Some(Self {
            file_index: (value >> OFFSET_BITS) as u32,
            offset: value & MAX_OFFSET,
        })
    }

    /// Extracts only the file index from a packed location.
    pub fn file_index_of(value: u64) -> u32 {
        (value >> OFFSET_BITS) as u32
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_index, self.offset)
    }
}
