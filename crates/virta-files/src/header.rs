//! Self-describing data file header.

use crate::constants::*;
use std::time::{SystemTime, UNIX_EPOCH};
use virta_common::{Result, VirtaError};

/// Header at the beginning of each data file.
///
/// Layout (48 bytes, little-endian):
/// - magic: 4 bytes ("VDAT")
/// - version: 4 bytes
/// - file_index: 4 bytes
/// - compaction_level: 4 bytes
/// - generation: 8 bytes
/// - creation_nanos: 8 bytes
/// - item_count: 8 bytes
/// - flags: 4 bytes
/// - checksum: 4 bytes (crc32 of the preceding 44 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileHeader {
    /// Magic bytes for identification.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Index of the file within its collection.
    pub file_index: u32,
    /// Compaction level, 0 for files written by a flush.
    pub compaction_level: u32,
    /// Ordering of file contents; newer data has a higher generation.
    pub generation: u64,
    /// Creation time in nanoseconds since the unix epoch.
    pub creation_nanos: u64,
    /// Number of items in the file.
    pub item_count: u64,
    /// Header flags.
    pub flags: u32,
    /// Header checksum.
    pub checksum: u32,
}

impl DataFileHeader {
    /// Creates the header of a file that is still being written.
    pub fn new(file_index: u32, compaction_level: u32) -> Self {
        let creation_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut header = Self {
            magic: DATA_FILE_MAGIC,
            version: DATA_FILE_VERSION,
            file_index,
            compaction_level,
            generation: 0,
            creation_nanos,
            item_count: 0,
            flags: 0,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    /// Marks the header complete with its final generation and item count.
    pub fn seal(&mut self, generation: u64, item_count: u64) {
        self.generation = generation;
        self.item_count = item_count;
        self.flags |= FLAG_SEALED;
        self.checksum = self.compute_checksum();
    }

    /// Returns true once the file is complete.
    pub fn is_sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    fn body_bytes(&self) -> [u8; DATA_FILE_HEADER_SIZE] {
        let mut data = [0u8; DATA_FILE_HEADER_SIZE];
        data[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic);
        data[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        data[OFF_FILE_INDEX..OFF_FILE_INDEX + 4].copy_from_slice(&self.file_index.to_le_bytes());
        data[OFF_LEVEL..OFF_LEVEL + 4].copy_from_slice(&self.compaction_level.to_le_bytes());
        data[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&self.generation.to_le_bytes());
        data[OFF_CREATED..OFF_CREATED + 8].copy_from_slice(&self.creation_nanos.to_le_bytes());
        data[OFF_ITEM_COUNT..OFF_ITEM_COUNT + 8].copy_from_slice(&self.item_count.to_le_bytes());
        data[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        data
    }

    fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.body_bytes()[..OFF_CHECKSUM])
    }

    /// Validates magic, version and checksum.
    pub fn validate(&self) -> Result<()> {
        let location = format!("file {} header", self.file_index);
        if self.magic != DATA_FILE_MAGIC {
            return Err(VirtaError::Corrupted {
                location,
                reason: "invalid magic bytes".to_string(),
            });
        }
        if self.version != DATA_FILE_VERSION {
            return Err(VirtaError::Corrupted {
                location,
                reason: format!("unsupported version: {}", self.version),
            });
        }
        if self.checksum != self.compute_checksum() {
            return Err(VirtaError::Corrupted {
                location,
                reason: "header checksum mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; DATA_FILE_HEADER_SIZE] {
        let mut data = self.body_bytes();
        data[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&self.checksum.to_le_bytes());
        data
    }

    /// Deserializes the header from bytes. Call `validate` before trusting it.
    pub fn from_bytes(data: &[u8; DATA_FILE_HEADER_SIZE]) -> Self {
        let u32_at =
            |off: usize| u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[off..off + 8]);
            u64::from_le_bytes(b)
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[OFF_MAGIC..OFF_MAGIC + 4]);

        Self {
            magic,
            version: u32_at(OFF_VERSION),
            file_index: u32_at(OFF_FILE_INDEX),
            compaction_level: u32_at(OFF_LEVEL),
            generation: u64_at(OFF_GENERATION),
            creation_nanos: u64_at(OFF_CREATED),
            item_count: u64_at(OFF_ITEM_COUNT),
            flags: u32_at(OFF_FLAGS),
            checksum: u32_at(OFF_CHECKSUM),
        }
    }
}

/// Builds the file name of a data file.
pub fn data_file_name(store_name: &str, file_index: u32) -> String {
    format!("{}_{:08}.{}", store_name, file_index, DATA_FILE_EXTENSION)
}

/// Parses the file index out of a data file name belonging to `store_name`.
pub fn parse_data_file_name(store_name: &str, file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(store_name)?.strip_prefix('_')?;
    let digits = rest.strip_suffix(DATA_FILE_EXTENSION)?.strip_suffix('.')?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = DataFileHeader::new(7, 2);
        header.seal(42, 1000);

        let bytes = header.to_bytes();
        let recovered = DataFileHeader::from_bytes(&bytes);

        assert_eq!(recovered, header);
        assert!(recovered.is_sealed());
        assert_eq!(recovered.generation, 42);
        recovered.validate().unwrap();
    }

    #[test]
    fn test_header_validation() {
        let mut header = DataFileHeader::new(1, 0);
        assert!(header.validate().is_ok());
        assert!(!header.is_sealed());

        header.item_count = 9;
        assert!(matches!(
            header.validate(),
            Err(VirtaError::Corrupted { .. })
        ));

        let mut header = DataFileHeader::new(1, 0);
        header.magic = *b"XXXX";
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(data_file_name("leaves", 12), "leaves_00000012.vdf");
        assert_eq!(parse_data_file_name("leaves", "leaves_00000012.vdf"), Some(12));
        assert_eq!(parse_data_file_name("leaves", "hashes_00000012.vdf"), None);
        assert_eq!(parse_data_file_name("leaves", "leaves_12.vdf"), None);
        assert_eq!(parse_data_file_name("leaves", "leaves_00000012.tmp"), None);
        // A store whose name is a prefix of another must not claim its files.
        assert_eq!(parse_data_file_name("idx", "idx_hashes_00000001.vdf"), None);
    }
}
