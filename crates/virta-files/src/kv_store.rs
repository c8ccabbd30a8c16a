//! Path-keyed key/value store on top of a data file collection.
//!
//! Item payload layout: key (u64, little-endian) followed by the value
//! bytes. The key prefix lets the index be rebuilt from the files alone.

use crate::collection::DataFileCollection;
use crate::compactor::{CompactionSummary, Compactor};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use virta_collections::{LongList, LongListDisk, LongListHeap};
use virta_common::{MerkleDbConfig, Result, TaskExecutor, VirtaError};

/// Size of the key prefix in every item.
const KEY_PREFIX_SIZE: usize = 8;

/// Builds the persisted index file name of a store.
pub fn index_file_name(store_name: &str) -> String {
    format!("{}_index.ll", store_name)
}

/// Opens an index for `store_name`, loading `source` when given.
pub fn open_index(
    dir: &Path,
    store_name: &str,
    config: &MerkleDbConfig,
    capacity: u64,
    source: Option<&Path>,
) -> Result<Arc<dyn LongList>> {
    let list: Arc<dyn LongList> = if config.prefer_disk_based_indices {
        let scratch = dir.join(format!("{}_index.scratch", store_name));
        match source {
            Some(source) => Arc::new(LongListDisk::load(source, &scratch, capacity)?),
            None => Arc::new(LongListDisk::new(&scratch, capacity)?),
        }
    } else {
        let chunk = config.long_list_chunk_size;
        let reserved = config.reserved_buffer_length_for_leaf_list;
        match source {
            Some(source) => Arc::new(LongListHeap::load(source, chunk, capacity, reserved)?),
            None => Arc::new(LongListHeap::new(chunk, capacity, reserved)),
        }
    };
    Ok(list)
}

/// Key/value store keyed by tree path.
///
/// Only keys inside the valid range are live. Each `write_items` call
/// produces one data file; the index only moves to the new locations once
/// that file is sealed and registered.
pub struct DiskKeyValueStore {
    /// Store name.
    name: String,
    /// Directory holding the store.
    dir: PathBuf,
    /// Data files.
    collection: Arc<DataFileCollection>,
    /// Key to packed location.
    index: Arc<dyn LongList>,
    /// Merges data files.
    compactor: Arc<Compactor>,
    /// Runs background compactions.
    compaction_executor: Option<Arc<dyn TaskExecutor>>,
}

impl DiskKeyValueStore {
    /// Opens or creates the store.
    ///
    /// `valid_range` is the live key range known to the owner. A persisted
    /// index is consumed on open, so a crash before the next `close` forces
    /// the index to be rebuilt from the data files.
    pub fn open(
        dir: &Path,
        name: &str,
        config: &MerkleDbConfig,
        capacity: u64,
        valid_range: Option<(u64, u64)>,
        compaction_executor: Option<Arc<dyn TaskExecutor>>,
    ) -> Result<Self> {
        let collection = Arc::new(DataFileCollection::open(dir, name, config)?);
        let index_path = dir.join(index_file_name(name));
        let use_saved = index_path.exists() && !config.index_rebuilding_enforced;

        let source = use_saved.then_some(index_path.as_path());
        let index = open_index(dir, name, config, capacity, source)?;
        if index_path.exists() {
            std::fs::remove_file(&index_path)?;
        }

        let store = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            compactor: Arc::new(Compactor::new(
                Arc::clone(&collection),
                Arc::clone(&index),
                config,
            )),
            collection,
            index,
            compaction_executor,
        };
        store.set_valid_range(valid_range)?;
        if !use_saved {
            store.rebuild_index()?;
        }
        Ok(store)
    }

    /// Returns the store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the data file collection.
    pub fn collection(&self) -> &Arc<DataFileCollection> {
        &self.collection
    }

    /// Returns the key index.
    pub fn index(&self) -> &Arc<dyn LongList> {
        &self.index
    }

    /// Returns the current valid key range.
    pub fn valid_range(&self) -> Option<(u64, u64)> {
        self.index.valid_range()
    }

    /// Moves the valid key range; keys outside it are dropped.
    pub fn set_valid_range(&self, range: Option<(u64, u64)>) -> Result<()> {
        match range {
            Some((min, max)) => self.index.update_valid_range(min, max)?,
            None => self.index.clear_valid_range()?,
        }
        self.collection.set_valid_key_range(range);
        Ok(())
    }

    /// Replays every data file, oldest generation first, into the index.
    fn rebuild_index(&self) -> Result<()> {
        let Some((min, max)) = self.valid_range() else {
            return Ok(());
        };
        let files = self.collection.files_in_generation_order();
        let mut items = 0u64;
        for file in &files {
            for item in file.iter(self.collection.iterator_buffer())? {
                let item = item?;
                let key = decode_key(&item.payload)?;
                if key >= min && key <= max {
                    self.index.put(key, item.location.as_u64())?;
                    items += 1;
                }
            }
        }
        info!(store = %self.name, files = files.len(), items, "Rebuilt index from data files");
        Ok(())
    }

    /// Writes `items` to one new data file, then points the index at them.
    ///
    /// Nothing becomes visible until the file is sealed. A key outside the
    /// valid range fails the call before anything is written. Transient I/O
    /// failures restart the file from scratch. Compaction is scheduled
    /// afterwards if one is due.
    pub fn write_items<V: AsRef<[u8]>>(&self, items: &[(u64, V)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let range = self.valid_range();
        if let Some((key, _)) = items
            .iter()
            .find(|(key, _)| !range.is_some_and(|(min, max)| *key >= min && *key <= max))
        {
            return Err(VirtaError::IndexOutOfBounds {
                index: *key,
                capacity: range.map_or(0, |(_, max)| max + 1),
            });
        }
        let (locations, _) = self.collection.write_flush_file(|collection| {
            let mut locations = Vec::with_capacity(items.len());
            for (key, value) in items {
                let value = value.as_ref();
                let mut payload = Vec::with_capacity(KEY_PREFIX_SIZE + value.len());
                payload.extend_from_slice(&key.to_le_bytes());
                payload.extend_from_slice(value);
                locations.push((*key, collection.store_data_item(&payload)?.as_u64()));
            }
            Ok(locations)
        })?;
        for (key, location) in &locations {
            self.index.put(*key, *location)?;
        }
        debug!(store = %self.name, items = locations.len(), "Published data file");
        if let Some(executor) = &self.compaction_executor {
            self.compactor.schedule(executor.as_ref());
        }
        Ok(())
    }

    /// Reads the value for `key`, or None when absent or out of range.
    pub fn get(&self, key: u64) -> Result<Option<Bytes>> {
        match self.valid_range() {
            Some((min, max)) if key >= min && key <= max => {}
            _ => return Ok(None),
        }
        let Some(payload) = self
            .collection
            .read_data_item_using_index(self.index.as_ref(), key)?
        else {
            return Ok(None);
        };
        let stored = decode_key(&payload)?;
        if stored != key {
            return Err(VirtaError::Corrupted {
                location: format!("{} key {}", self.name, key),
                reason: format!("item belongs to key {}", stored),
            });
        }
        Ok(Some(payload.slice(KEY_PREFIX_SIZE..)))
    }

    /// Runs one compaction now if a level has reached the trigger.
    pub fn compact(&self) -> Result<Option<CompactionSummary>> {
        self.compactor.compact()
    }

    /// Merges every file into one level.
    pub fn compact_all(&self) -> Result<Option<CompactionSummary>> {
        self.compactor.compact_all()
    }

    /// Returns the number of live data files.
    pub fn file_count(&self) -> usize {
        self.collection.file_count()
    }

    /// Hard-links the data files into `target` and writes the index there.
    pub fn snapshot(&self, target: &Path) -> Result<()> {
        let _suspended = self.compactor.suspend();
        self.collection.snapshot(target)?;
        self.index.write_to_file(&target.join(index_file_name(&self.name)))
    }

    /// Waits for compaction and persists the index.
    pub fn close(&self) -> Result<()> {
        self.compactor.wait_idle();
        self.collection.close()?;
        self.index
            .write_to_file(&self.dir.join(index_file_name(&self.name)))?;
        debug!(store = %self.name, "Closed key/value store");
        Ok(())
    }
}

fn decode_key(payload: &[u8]) -> Result<u64> {
    if payload.len() < KEY_PREFIX_SIZE {
        return Err(VirtaError::DecodeError(format!(
            "item of {} bytes has no key prefix",
            payload.len()
        )));
    }
    let mut key = [0u8; KEY_PREFIX_SIZE];
    key.copy_from_slice(&payload[..KEY_PREFIX_SIZE]);
    Ok(u64::from_le_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> MerkleDbConfig {
        MerkleDbConfig {
            min_number_of_files_in_compaction: 2,
            fsync_enabled: false,
            long_list_chunk_size: 64,
            reserved_buffer_length_for_leaf_list: 64,
            ..Default::default()
        }
    }

    fn open(dir: &Path, config: &MerkleDbConfig, range: Option<(u64, u64)>) -> DiskKeyValueStore {
        DiskKeyValueStore::open(dir, "leaves", config, 10_000, range, None).unwrap()
    }

    fn write(store: &DiskKeyValueStore, entries: &[(u64, &[u8])]) {
        store.write_items(entries).unwrap();
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), &config(), Some((1, 10)));
        write(&store, &[(1, b"one"), (2, b"two")]);
        assert_eq!(store.get(1).unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(store.get(3).unwrap(), None);
        assert_eq!(store.get(11).unwrap(), None);
    }

    #[test]
    fn test_failed_write_publishes_nothing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), &config(), Some((1, 10)));
        write(&store, &[(1, b"kept")]);
        let result = store.write_items(&[(2, &b"new"[..]), (11, &b"bad"[..])]);
        assert!(matches!(
            result,
            Err(VirtaError::IndexOutOfBounds { index: 11, .. })
        ));
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.get(1).unwrap(), Some(Bytes::from_static(b"kept")));
        assert_eq!(store.get(2).unwrap(), None);
        // An empty batch writes no file.
        store.write_items::<&[u8]>(&[]).unwrap();
    }

    #[test]
    fn test_range_shrink_hides_keys() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), &config(), Some((1, 10)));
        write(&store, &[(1, b"a"), (10, b"b")]);
        store.set_valid_range(Some((2, 9))).unwrap();
        assert_eq!(store.get(1).unwrap(), None);
        assert_eq!(store.get(10).unwrap(), None);
        store.set_valid_range(None).unwrap();
        assert_eq!(store.get(5).unwrap(), None);
    }

    #[test]
    fn test_close_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), &config(), Some((1, 4)));
            write(&store, &[(1, b"a"), (2, b"b")]);
            write(&store, &[(2, b"c")]);
            store.close().unwrap();
        }
        assert!(dir.path().join(index_file_name("leaves")).exists());
        let store = open(dir.path(), &config(), Some((1, 4)));
        // The saved index is consumed at open.
        assert!(!dir.path().join(index_file_name("leaves")).exists());
        assert_eq!(store.get(1).unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(store.get(2).unwrap(), Some(Bytes::from_static(b"c")));
    }

    #[test]
    fn test_rebuild_after_crash() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), &config(), Some((1, 4)));
            write(&store, &[(1, b"a"), (2, b"b"), (4, b"d")]);
            write(&store, &[(2, b"c")]);
            // No close: index never saved.
        }
        let store = open(dir.path(), &config(), Some((1, 3)));
        assert_eq!(store.get(1).unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(store.get(2).unwrap(), Some(Bytes::from_static(b"c")));
        assert_eq!(store.get(4).unwrap(), None);
    }

    #[test]
    fn test_rebuild_enforced_matches_saved() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), &config(), Some((0, 20)));
            for round in 0..5u64 {
                let value = round.to_le_bytes();
                write(&store, &[(round, &value[..]), (20, &value[..])]);
            }
            store.compact().unwrap();
            store.close().unwrap();
        }
        let enforced = MerkleDbConfig {
            index_rebuilding_enforced: true,
            ..config()
        };
        let store = open(dir.path(), &enforced, Some((0, 20)));
        for round in 0..5u64 {
            assert_eq!(store.get(round).unwrap().unwrap().as_ref(), &round.to_le_bytes());
        }
        assert_eq!(store.get(20).unwrap().unwrap().as_ref(), &4u64.to_le_bytes());
    }

    #[test]
    fn test_disk_based_index() {
        let dir = tempdir().unwrap();
        let config = MerkleDbConfig {
            prefer_disk_based_indices: true,
            ..config()
        };
        {
            let store = open(dir.path(), &config, Some((1, 100)));
            write(&store, &[(50, b"disk")]);
            store.close().unwrap();
        }
        let store = open(dir.path(), &config, Some((1, 100)));
        assert_eq!(store.get(50).unwrap(), Some(Bytes::from_static(b"disk")));
    }

    #[test]
    fn test_snapshot() {
        let dir = tempdir().unwrap();
        let snap = tempdir().unwrap();
        let store = open(dir.path(), &config(), Some((1, 4)));
        write(&store, &[(1, b"before")]);
        store.snapshot(snap.path()).unwrap();
        write(&store, &[(1, b"after")]);

        let copy = open(snap.path(), &config(), Some((1, 4)));
        assert_eq!(copy.get(1).unwrap(), Some(Bytes::from_static(b"before")));
        assert_eq!(store.get(1).unwrap(), Some(Bytes::from_static(b"after")));
    }
}
