//! Configuration structures for VirtaDB.

use crate::error::{Result, VirtaError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lowest accepted value for `min_number_of_files_in_compaction`.
pub const MIN_FILES_IN_COMPACTION_FLOOR: usize = 2;

/// Lowest accepted value for `max_compaction_level`.
pub const MAX_COMPACTION_LEVEL_FLOOR: u32 = 3;

/// Storage engine configuration.
///
/// Passed explicitly into every store constructor; there is no process-wide
/// configuration state. Absent JSON fields fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MerkleDbConfig {
    /// Expected maximum number of keys, used to pre-size the bucket index.
    pub max_num_of_keys: u64,
    /// Paths below this value keep their hash in RAM, the rest go to disk.
    pub hashes_ram_to_disk_threshold: u64,
    /// Number of background compaction threads.
    pub compaction_threads: usize,
    /// Number of files of one level that triggers a compaction.
    pub min_number_of_files_in_compaction: usize,
    /// Highest compaction level a file can be promoted to.
    pub max_compaction_level: u32,
    /// Read buffer size for sequential file iteration.
    pub iterator_input_buffer_bytes: usize,
    /// Treat keys that resolve outside the live leaf range as absent.
    pub reconnect_key_leak_mitigation_enabled: bool,
    /// Rebuild in-memory indexes from data files on startup.
    pub index_rebuilding_enforced: bool,
    /// Percentage of available processors used for flush threads.
    pub percent_half_disk_hash_map_flush_threads: u32,
    /// Explicit flush thread count; -1 derives it from the percentage.
    pub num_half_disk_hash_map_flush_threads: i32,
    /// Slack kept around the valid range of in-memory long lists.
    pub reserved_buffer_length_for_leaf_list: u64,
    /// Capacity of the leaf record read cache; 0 disables it.
    pub leaf_record_cache_size: usize,
    /// Maximum open file handles per data file reader.
    pub max_file_channels_per_file_reader: usize,
    /// Concurrent readers per file handle before another handle is opened.
    pub max_threads_per_file_channel: usize,
    /// Attempts for transient I/O failures before giving up.
    pub io_retry_attempts: u32,
    /// Base backoff between I/O retries, doubled on each attempt.
    pub io_retry_backoff_ms: u64,
    /// Compaction output rolls over to a new file past this size.
    pub max_data_file_size_bytes: u64,
    /// Use file-backed long lists for indexes instead of RAM.
    pub prefer_disk_based_indices: bool,
    /// Number of longs per long-list chunk.
    pub long_list_chunk_size: usize,
    /// Enable fsync when sealing data files.
    pub fsync_enabled: bool,
}

impl Default for MerkleDbConfig {
    fn default() -> Self {
        Self {
            max_num_of_keys: 500_000_000,
            hashes_ram_to_disk_threshold: 8 * 1024 * 1024,
            compaction_threads: 3,
            min_number_of_files_in_compaction: 8,
            max_compaction_level: 5,
            iterator_input_buffer_bytes: 1024 * 1024,
            reconnect_key_leak_mitigation_enabled: false,
            index_rebuilding_enforced: false,
            percent_half_disk_hash_map_flush_threads: 50,
            num_half_disk_hash_map_flush_threads: -1,
            reserved_buffer_length_for_leaf_list: 256 * 1024,
            leaf_record_cache_size: 1 << 20,
            max_file_channels_per_file_reader: 8,
            max_threads_per_file_channel: 8,
            io_retry_attempts: 3,
            io_retry_backoff_ms: 10,
            max_data_file_size_bytes: 1024 * 1024 * 1024,
            prefer_disk_based_indices: false,
            long_list_chunk_size: 1024 * 1024,
            fsync_enabled: true,
        }
    }
}

impl MerkleDbConfig {
    /// Loads a configuration from a JSON file and validates it.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let config: MerkleDbConfig = serde_json::from_slice(&raw).map_err(|e| {
            VirtaError::ConfigError(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every option against its accepted range.
    ///
    /// Invalid values are rejected, never clamped.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_of_keys == 0 {
            return Err(VirtaError::invalid_parameter("max_num_of_keys", 0));
        }
        if self.compaction_threads < 1 {
            return Err(VirtaError::invalid_parameter(
                "compaction_threads",
                self.compaction_threads,
            ));
        }
        if self.min_number_of_files_in_compaction < MIN_FILES_IN_COMPACTION_FLOOR {
            return Err(VirtaError::invalid_parameter(
                "min_number_of_files_in_compaction",
                self.min_number_of_files_in_compaction,
            ));
        }
        if self.max_compaction_level < MAX_COMPACTION_LEVEL_FLOOR {
            return Err(VirtaError::invalid_parameter(
                "max_compaction_level",
                self.max_compaction_level,
            ));
        }
        if self.iterator_input_buffer_bytes == 0 {
            return Err(VirtaError::invalid_parameter("iterator_input_buffer_bytes", 0));
        }
        if self.percent_half_disk_hash_map_flush_threads > 100 {
            return Err(VirtaError::invalid_parameter(
                "percent_half_disk_hash_map_flush_threads",
                self.percent_half_disk_hash_map_flush_threads,
            ));
        }
        if self.num_half_disk_hash_map_flush_threads < -1 {
            return Err(VirtaError::invalid_parameter(
                "num_half_disk_hash_map_flush_threads",
                self.num_half_disk_hash_map_flush_threads,
            ));
        }
        if self.reserved_buffer_length_for_leaf_list == 0 {
            return Err(VirtaError::invalid_parameter(
                "reserved_buffer_length_for_leaf_list",
                0,
            ));
        }
        if self.max_file_channels_per_file_reader < 1 {
            return Err(VirtaError::invalid_parameter(
                "max_file_channels_per_file_reader",
                self.max_file_channels_per_file_reader,
            ));
        }
        if self.max_threads_per_file_channel < 1 {
            return Err(VirtaError::invalid_parameter(
                "max_threads_per_file_channel",
                self.max_threads_per_file_channel,
            ));
        }
        if self.io_retry_attempts < 1 {
            return Err(VirtaError::invalid_parameter("io_retry_attempts", 0));
        }
        if self.long_list_chunk_size == 0 {
            return Err(VirtaError::invalid_parameter("long_list_chunk_size", 0));
        }
        Ok(())
    }

    /// Returns the number of flush threads for the half-disk hash map.
    ///
    /// An explicit non-negative thread count wins over the percentage. At
    /// least one thread is always used.
    pub fn flush_thread_count(&self) -> usize {
        if self.num_half_disk_hash_map_flush_threads >= 0 {
            return (self.num_half_disk_hash_map_flush_threads as usize).max(1);
        }
        let derived = num_cpus() * self.percent_half_disk_hash_map_flush_threads as usize / 100;
        derived.max(1)
    }

    /// Returns true when node hashes at or above the threshold go to disk.
    pub fn has_disk_store_for_hashes(&self) -> bool {
        self.hashes_ram_to_disk_threshold < u64::MAX
    }
}

/// Returns the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MerkleDbConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_number_of_files_in_compaction, 8);
        assert_eq!(config.num_half_disk_hash_map_flush_threads, -1);
        assert!(!config.index_rebuilding_enforced);
    }

    #[test]
    fn test_min_files_in_compaction_below_two_rejected() {
        let config = MerkleDbConfig {
            min_number_of_files_in_compaction: 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, VirtaError::InvalidParameter { ref name, .. }
            if name == "min_number_of_files_in_compaction"));

        let config = MerkleDbConfig {
            min_number_of_files_in_compaction: 2,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_other_ranges_rejected() {
        let bad = [
            MerkleDbConfig { compaction_threads: 0, ..Default::default() },
            MerkleDbConfig { max_compaction_level: 2, ..Default::default() },
            MerkleDbConfig { max_num_of_keys: 0, ..Default::default() },
            MerkleDbConfig { percent_half_disk_hash_map_flush_threads: 101, ..Default::default() },
            MerkleDbConfig { num_half_disk_hash_map_flush_threads: -2, ..Default::default() },
            MerkleDbConfig { max_file_channels_per_file_reader: 0, ..Default::default() },
            MerkleDbConfig { max_threads_per_file_channel: 0, ..Default::default() },
            MerkleDbConfig { iterator_input_buffer_bytes: 0, ..Default::default() },
            MerkleDbConfig { reserved_buffer_length_for_leaf_list: 0, ..Default::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }

    #[test]
    fn test_threshold_extremes_are_valid() {
        let all_disk = MerkleDbConfig {
            hashes_ram_to_disk_threshold: 0,
            ..Default::default()
        };
        assert!(all_disk.validate().is_ok());
        assert!(all_disk.has_disk_store_for_hashes());

        let all_ram = MerkleDbConfig {
            hashes_ram_to_disk_threshold: u64::MAX,
            ..Default::default()
        };
        assert!(all_ram.validate().is_ok());
        assert!(!all_ram.has_disk_store_for_hashes());
    }

    #[test]
    fn test_flush_thread_count() {
        let explicit = MerkleDbConfig {
            num_half_disk_hash_map_flush_threads: 6,
            ..Default::default()
        };
        assert_eq!(explicit.flush_thread_count(), 6);

        let explicit_zero = MerkleDbConfig {
            num_half_disk_hash_map_flush_threads: 0,
            ..Default::default()
        };
        assert_eq!(explicit_zero.flush_thread_count(), 1);

        let zero_percent = MerkleDbConfig {
            percent_half_disk_hash_map_flush_threads: 0,
            ..Default::default()
        };
        assert_eq!(zero_percent.flush_thread_count(), 1);

        let full = MerkleDbConfig {
            percent_half_disk_hash_map_flush_threads: 100,
            ..Default::default()
        };
        assert_eq!(full.flush_thread_count(), num_cpus());
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = MerkleDbConfig {
            hashes_ram_to_disk_threshold: 0,
            leaf_record_cache_size: 0,
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: MerkleDbConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_from_json_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merkledb.json");
        std::fs::write(
            &path,
            r#"{ "compaction_threads": 2, "reconnect_key_leak_mitigation_enabled": true }"#,
        )
        .unwrap();

        let config = MerkleDbConfig::from_json_file(&path).unwrap();
        assert_eq!(config.compaction_threads, 2);
        assert!(config.reconnect_key_leak_mitigation_enabled);
        assert_eq!(config.max_compaction_level, 5);
    }

    #[test]
    fn test_from_json_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merkledb.json");
        std::fs::write(&path, r#"{ "min_number_of_files_in_compaction": 1 }"#).unwrap();
        assert!(MerkleDbConfig::from_json_file(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        let err = MerkleDbConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, VirtaError::ConfigError(_)));
    }
}
