//! Node hashes by tree path, split over two tiers.
//!
//! Paths below `hashes_ram_to_disk_threshold` live in a RAM hash list that
//! is persisted on close. Paths at or above it live in a disk key/value
//! store. A threshold of `u64::MAX` keeps every hash in RAM.

use crate::path::{path_capacity, MAX_LEAF_COUNT};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use virta_collections::HashListRam;
use virta_common::{Hash, MerkleDbConfig, Result, TaskExecutor};
use virta_files::{CompactionSummary, DiskKeyValueStore};

/// Name of the disk tier store.
pub const HASHES_STORE_NAME: &str = "hashes";

/// File holding the RAM tier between sessions.
pub const HASHES_RAM_FILE_NAME: &str = "hashes_ram.hl";

const HASHES_PER_CHUNK: usize = 16 * 1024;

pub struct HashStore {
    dir: PathBuf,
    threshold: u64,
    ram_capacity: u64,
    ram: HashListRam,
    disk: Option<DiskKeyValueStore>,
}

impl HashStore {
    /// Opens the hash tiers in `dir` for a tree whose last leaf is at
    /// `last_path`.
    ///
    /// The persisted RAM tier is consumed on open; it is written again on
    /// `close`.
    pub fn open(
        dir: &Path,
        config: &MerkleDbConfig,
        last_path: Option<u64>,
        compaction_executor: Option<Arc<dyn TaskExecutor>>,
    ) -> Result<Self> {
        let threshold = config.hashes_ram_to_disk_threshold;
        let max_paths = path_capacity(MAX_LEAF_COUNT);
        let ram_capacity = threshold.min(max_paths);

        let ram_path = dir.join(HASHES_RAM_FILE_NAME);
        let ram = if ram_path.exists() {
            let ram = HashListRam::load(&ram_path, HASHES_PER_CHUNK, ram_capacity)?;
            std::fs::remove_file(&ram_path)?;
            ram
        } else {
            HashListRam::new(HASHES_PER_CHUNK, ram_capacity)
        };

        let disk = if config.has_disk_store_for_hashes() {
            Some(DiskKeyValueStore::open(
                dir,
                HASHES_STORE_NAME,
                config,
                max_paths,
                disk_range(threshold, last_path),
                compaction_executor,
            )?)
        } else {
            None
        };

        debug!(
            threshold,
            ram_hashes = ram.size(),
            disk_tier = disk.is_some(),
            "Opened hash store"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            threshold,
            ram_capacity,
            ram,
            disk,
        })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Returns the stored hash of `path`.
    pub fn get(&self, path: u64) -> Result<Option<Hash>> {
        if path < self.threshold {
            if path >= self.ram_capacity {
                return Ok(None);
            }
            return self.ram.get(path);
        }
        match &self.disk {
            Some(disk) => disk.get(path)?.map(|raw| Hash::from_slice(&raw)).transpose(),
            None => Ok(None),
        }
    }

    /// Stores `hashes`, each path in its tier.
    pub fn write(&self, hashes: &BTreeMap<u64, Hash>) -> Result<()> {
        for (path, hash) in hashes.range(..self.threshold) {
            self.ram.put(*path, hash)?;
        }
        let Some(disk) = &self.disk else {
            return Ok(());
        };
        let high: Vec<(u64, &[u8])> = hashes
            .range(self.threshold..)
            .map(|(path, hash)| (*path, hash.as_bytes().as_slice()))
            .collect();
        disk.write_items(&high)
    }

    /// Drops every hash above `last_path`, or all of them for None.
    pub fn set_last_path(&self, last_path: Option<u64>) -> Result<()> {
        self.ram.truncate(last_path.map_or(0, |last| last + 1));
        match &self.disk {
            Some(disk) => disk.set_valid_range(disk_range(self.threshold, last_path)),
            None => Ok(()),
        }
    }

    /// Merges the disk tier files.
    pub fn compact_all(&self) -> Result<Option<CompactionSummary>> {
        match &self.disk {
            Some(disk) => disk.compact_all(),
            None => Ok(None),
        }
    }

    /// Number of disk tier data files.
    pub fn file_count(&self) -> usize {
        self.disk.as_ref().map_or(0, |d| d.file_count())
    }

    pub fn snapshot(&self, target: &Path) -> Result<()> {
        self.ram.write_to_file(&target.join(HASHES_RAM_FILE_NAME))?;
        match &self.disk {
            Some(disk) => disk.snapshot(target),
            None => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        self.ram.write_to_file(&self.dir.join(HASHES_RAM_FILE_NAME))?;
        match &self.disk {
            Some(disk) => disk.close(),
            None => Ok(()),
        }
    }
}

fn disk_range(threshold: u64, last_path: Option<u64>) -> Option<(u64, u64)> {
    last_path
        .filter(|last| *last >= threshold)
        .map(|last| (threshold, last))
}
