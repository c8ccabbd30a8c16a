//! Data file constants for header and item format.

// Data file header constants

/// Magic bytes identifying a data file.
pub const DATA_FILE_MAGIC: [u8; 4] = *b"VDAT";

/// Current format version.
pub const DATA_FILE_VERSION: u32 = 1;

/// Data file header size in bytes.
pub const DATA_FILE_HEADER_SIZE: usize = 48;

/// Extension of data files.
pub const DATA_FILE_EXTENSION: &str = "vdf";

/// Header flag set once the file is complete and immutable.
pub const FLAG_SEALED: u32 = 1;

// Header field offsets

/// Offset of the magic field.
pub const OFF_MAGIC: usize = 0;

/// Offset of the version field.
pub const OFF_VERSION: usize = 4;

/// Offset of the file index field.
pub const OFF_FILE_INDEX: usize = 8;

/// Offset of the compaction level field.
pub const OFF_LEVEL: usize = 12;

/// Offset of the generation field.
pub const OFF_GENERATION: usize = 16;

/// Offset of the creation time field (unix nanos).
pub const OFF_CREATED: usize = 24;

/// Offset of the item count field.
pub const OFF_ITEM_COUNT: usize = 32;

/// Offset of the flags field.
pub const OFF_FLAGS: usize = 40;

/// Offset of the header checksum.
pub const OFF_CHECKSUM: usize = 44;

// Item frame constants

/// Size of the frame in front of every item: u32 length and u32 crc32.
pub const ITEM_HEADER_SIZE: usize = 8;

/// Largest accepted item payload (64 MB).
pub const MAX_ITEM_SIZE: usize = 64 * 1024 * 1024;

// Collection constants

/// Attempts made by index-driven reads when a file disappears under them.
pub const MAX_INDEX_READ_ATTEMPTS: usize = 5;
