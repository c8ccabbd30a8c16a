//! Half-disk hash map from arbitrary keys to `u64` values.
//!
//! The bucket index (bucket to page location) is a long list. The bucket
//! pages themselves live in a data file collection. Writes are buffered per
//! bucket in [`BucketMutation`]s and reach disk on `end_writing`:
//! 1. The bucket count doubles if buckets average more than
//!    [`GOOD_AVERAGE_BUCKET_ENTRY_COUNT`] entries.
//! 2. The new page of every touched bucket is built on the flush pool.
//! 3. Pages are appended in bucket order to one new data file.
//! 4. The file is sealed, then the bucket index moves to the new pages.
//!
//! Reads check the pending mutations, then the round being flushed, then
//! the latest page of the bucket.
//!
//! Doubling rewrites no pages. Bucket `b + n` starts out sharing the page of
//! bucket `b`. The first flush touching a shared page splits it, so every
//! bucket of the family gets its own page.

use crate::bucket::{bucket_for_hash, Bucket, BucketView};
use crate::mutation::BucketMutation;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use virta_collections::LongList;
use virta_common::{
    key_hash_code, MerkleDbConfig, RayonExecutor, Result, TaskExecutor, VirtaError,
    NON_EXISTENT_LOCATION,
};
use virta_files::{
    index_file_name, open_index, CompactionSummary, Compactor, DataFileCollection,
};

/// Average bucket size above which the bucket count doubles.
pub const GOOD_AVERAGE_BUCKET_ENTRY_COUNT: u64 = 32;

/// Upper bound for the bucket count.
pub const MAX_BUCKET_COUNT: u32 = 1 << 31;

/// Number of locks the pending mutations are spread over.
const MUTATION_SHARDS: usize = 16;

/// Current metadata file format version.
const METADATA_FILE_VERSION: u32 = 1;

/// Pending mutations keyed by bucket.
type Round = BTreeMap<u32, BucketMutation>;

/// Builds the metadata file name of a store.
pub fn metadata_file_name(store_name: &str) -> String {
    format!("{}_metadata.json", store_name)
}

/// Bucket count for a new map expected to hold `max_keys` keys: the power of
/// two above `max_keys / 32`, at least 2.
pub fn initial_bucket_count(max_keys: u64) -> u32 {
    let minimum = (max_keys / GOOD_AVERAGE_BUCKET_ENTRY_COUNT).min(MAX_BUCKET_COUNT as u64 / 2);
    let highest_one_bit = match minimum {
        0 => 0,
        m => 1u64 << (63 - m.leading_zeros()),
    };
    (highest_one_bit * 2).max(2) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct HashMapMetadata {
    version: u32,
    bucket_count: u32,
    entry_count: u64,
}

fn read_metadata(path: &Path) -> Result<Option<HashMapMetadata>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path)?;
    let metadata: HashMapMetadata = serde_json::from_slice(&raw).map_err(|e| {
        VirtaError::DecodeError(format!("cannot parse {}: {}", path.display(), e))
    })?;
    if metadata.version != METADATA_FILE_VERSION {
        return Err(VirtaError::DecodeError(format!(
            "unsupported hash map metadata version {}",
            metadata.version
        )));
    }
    if !metadata.bucket_count.is_power_of_two() {
        return Err(VirtaError::Corrupted {
            location: path.display().to_string(),
            reason: format!("bucket count {} is not a power of two", metadata.bucket_count),
        });
    }
    Ok(Some(metadata))
}

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    /// Bucket pages written.
    pub buckets_written: usize,
    /// Pending keys applied.
    pub keys_written: usize,
    /// Bucket count after the flush.
    pub bucket_count: u32,
    /// Index of the new data file.
    pub file_index: Option<u32>,
}

/// Pages sharing one on-disk location and the buckets of the round that
/// point at it.
struct FlushGroup {
    location: u64,
    buckets: Vec<u32>,
}

/// A round taken out of the pending mutations, ready to be written.
///
/// Holds the flush lock until committed or dropped.
pub struct PreparedFlush<'a> {
    map: &'a HalfDiskHashMap,
    round: Arc<Round>,
    _flush: MutexGuard<'a, ()>,
}

impl PreparedFlush<'_> {
    /// Number of pending keys in the round.
    pub fn key_count(&self) -> usize {
        self.round.values().map(|m| m.size()).sum()
    }

    /// Writes the round to disk.
    pub fn commit(self) -> Result<FlushSummary> {
        self.map.write_round(&self.round)
    }
}

/// Disk-resident hash map with a RAM bucket index.
pub struct HalfDiskHashMap {
    /// Store name.
    name: String,
    /// Directory holding the store.
    dir: PathBuf,
    /// Bucket pages.
    collection: Arc<DataFileCollection>,
    /// Bucket index to page location.
    bucket_index: Arc<dyn LongList>,
    /// Merges data files.
    compactor: Arc<Compactor>,
    /// Runs background compactions.
    compaction_executor: Option<Arc<dyn TaskExecutor>>,
    /// Builds bucket pages in parallel.
    flush_pool: Arc<RayonExecutor>,
    /// Current bucket count, a power of two.
    bucket_count: AtomicU32,
    /// Approximate number of keys on disk.
    entry_count: AtomicU64,
    /// Held shared by readers and writers, exclusively while the bucket
    /// count changes or a round is taken.
    resize_lock: RwLock<()>,
    /// Pending mutations, sharded by bucket.
    pending: Vec<Mutex<Round>>,
    /// Round being written by the current flush.
    flushing: RwLock<Option<Arc<Round>>>,
    /// One flush at a time.
    flush_lock: Mutex<()>,
    /// Set after a failed flush.
    halted: AtomicBool,
}

impl HalfDiskHashMap {
    /// Opens or creates the map `name` in `dir`.
    ///
    /// A persisted bucket index is consumed on open. Without one, or with
    /// `index_rebuilding_enforced`, the index is rebuilt from the pages.
    pub fn open(
        dir: &Path,
        name: &str,
        config: &MerkleDbConfig,
        flush_pool: Arc<RayonExecutor>,
        compaction_executor: Option<Arc<dyn TaskExecutor>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let collection = Arc::new(DataFileCollection::open(dir, name, config)?);
        let metadata_path = dir.join(metadata_file_name(name));
        let (bucket_count, entry_count) = match read_metadata(&metadata_path)? {
            Some(metadata) => (metadata.bucket_count, metadata.entry_count),
            None if collection.file_count() > 0 => {
                return Err(VirtaError::Corrupted {
                    location: dir.display().to_string(),
                    reason: format!("data files of {} found without metadata", name),
                });
            }
            None => (initial_bucket_count(config.max_num_of_keys), 0),
        };

        let index_path = dir.join(index_file_name(name));
        let use_saved = index_path.exists() && !config.index_rebuilding_enforced;
        let bucket_index = open_index(
            dir,
            name,
            config,
            MAX_BUCKET_COUNT as u64,
            use_saved.then_some(index_path.as_path()),
        )?;
        if index_path.exists() {
            std::fs::remove_file(&index_path)?;
        }
        bucket_index.update_valid_range(0, bucket_count as u64 - 1)?;
        collection.set_valid_key_range(Some((0, bucket_count as u64 - 1)));

        let map = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            compactor: Arc::new(Compactor::new(
                Arc::clone(&collection),
                Arc::clone(&bucket_index),
                config,
            )),
            collection,
            bucket_index,
            compaction_executor,
            flush_pool,
            bucket_count: AtomicU32::new(bucket_count),
            entry_count: AtomicU64::new(entry_count),
            resize_lock: RwLock::new(()),
            pending: (0..MUTATION_SHARDS).map(|_| Mutex::new(Round::new())).collect(),
            flushing: RwLock::new(None),
            flush_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
        };
        if !use_saved {
            map.rebuild_index()?;
        }
        map.write_metadata(&map.dir)?;
        info!(
            store = %map.name,
            buckets = bucket_count,
            files = map.collection.file_count(),
            "Opened half-disk hash map"
        );
        Ok(map)
    }

    /// Returns the store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current bucket count.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count.load(Ordering::Acquire)
    }

    /// Returns the approximate number of keys on disk.
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Acquire)
    }

    /// Returns the number of pending keys.
    pub fn pending_count(&self) -> usize {
        self.pending
            .iter()
            .map(|shard| shard.lock().values().map(|m| m.size()).sum::<usize>())
            .sum()
    }

    /// Returns the data file collection.
    pub fn collection(&self) -> &Arc<DataFileCollection> {
        &self.collection
    }

    /// Returns the number of live data files.
    pub fn file_count(&self) -> usize {
        self.collection.file_count()
    }

    /// Returns true after a failed flush.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn shard(&self, bucket: u32) -> &Mutex<Round> {
        &self.pending[bucket as usize % MUTATION_SHARDS]
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_halted() {
            return Err(VirtaError::Halted(self.name.clone()));
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        let hash = key_hash_code(key);
        let _resize = self.resize_lock.read();
        let bucket = bucket_for_hash(hash, self.bucket_count());
        let pending = self.shard(bucket).lock().get(&bucket).and_then(|m| m.get(key, hash));
        if let Some(value) = pending {
            return Ok(value);
        }
        self.committed_value(key, hash, bucket)
    }

    /// Value as of the flushing round and the pages, ignoring pending writes.
    fn committed_value(&self, key: &[u8], hash: u64, bucket: u32) -> Result<Option<u64>> {
        let flushing = self.flushing.read().clone();
        if let Some(round) = flushing {
            if let Some(value) = round.get(&bucket).and_then(|m| m.get(key, hash)) {
                return Ok(value);
            }
        }
        let page = self
            .collection
            .read_data_item_using_index(self.bucket_index.as_ref(), bucket as u64)?;
        match page {
            Some(page) => BucketView::new(&page)?.find_value(key, hash),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Sets `key` to `value`.
    pub fn put(&self, key: &[u8], value: u64) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Deletes `key`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<u64>) -> Result<()> {
        self.check_writable()?;
        let hash = key_hash_code(key);
        let _resize = self.resize_lock.read();
        let bucket = bucket_for_hash(hash, self.bucket_count());
        self.shard(bucket)
            .lock()
            .entry(bucket)
            .or_default()
            .put(Bytes::copy_from_slice(key), hash, value);
        Ok(())
    }

    /// Sets `key` to `value` if it currently holds `expected`.
    ///
    /// Returns false, changing nothing, on a mismatch.
    pub fn put_if_equal(&self, key: &[u8], expected: u64, value: u64) -> Result<bool> {
        self.write_if_equal(key, expected, Some(value))
    }

    /// Deletes `key` if it currently holds `expected`.
    pub fn delete_if_equal(&self, key: &[u8], expected: u64) -> Result<bool> {
        self.write_if_equal(key, expected, None)
    }

    fn write_if_equal(&self, key: &[u8], expected: u64, value: Option<u64>) -> Result<bool> {
        self.check_writable()?;
        let hash = key_hash_code(key);
        let _resize = self.resize_lock.read();
        let bucket = bucket_for_hash(hash, self.bucket_count());
        let mut shard = self.shard(bucket).lock();
        let current = match shard.get(&bucket).and_then(|m| m.get(key, hash)) {
            Some(value) => value,
            None => self.committed_value(key, hash, bucket)?,
        };
        if current != Some(expected) {
            return Ok(false);
        }
        Ok(shard
            .entry(bucket)
            .or_default()
            .put_if_equal(Bytes::copy_from_slice(key), hash, expected, value))
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Writes every pending mutation to a new data file.
    ///
    /// Returns None when nothing was pending. A failure halts the map.
    pub fn end_writing(&self) -> Result<Option<FlushSummary>> {
        match self.begin_flush()? {
            Some(prepared) => prepared.commit().map(Some),
            None => Ok(None),
        }
    }

    /// Takes the pending mutations as the next round to flush.
    ///
    /// Writes issued after this call go to the following round. Returns None
    /// when nothing was pending.
    pub fn begin_flush(&self) -> Result<Option<PreparedFlush<'_>>> {
        self.check_writable()?;
        let flush = self.flush_lock.lock();
        let _resize = self.resize_lock.write();
        self.maybe_resize()?;

        let mut round = Round::new();
        for shard in &self.pending {
            round.append(&mut shard.lock());
        }
        if round.is_empty() {
            return Ok(None);
        }
        let round = Arc::new(round);
        *self.flushing.write() = Some(Arc::clone(&round));
        Ok(Some(PreparedFlush {
            map: self,
            round,
            _flush: flush,
        }))
    }

    /// Doubles the bucket count when buckets have grown too large.
    ///
    /// Caller holds the resize lock exclusively.
    fn maybe_resize(&self) -> Result<bool> {
        let count = self.bucket_count();
        let keys = self.entry_count() + self.pending_count() as u64;
        if keys / count as u64 <= GOOD_AVERAGE_BUCKET_ENTRY_COUNT || count >= MAX_BUCKET_COUNT {
            return Ok(false);
        }
        let new_count = count * 2;
        self.bucket_index.update_valid_range(0, new_count as u64 - 1)?;
        for bucket in 0..count as u64 {
            let location = self.bucket_index.get(bucket)?;
            if location != NON_EXISTENT_LOCATION {
                self.bucket_index.put(bucket + count as u64, location)?;
            }
        }
        self.collection
            .set_valid_key_range(Some((0, new_count as u64 - 1)));
        self.bucket_count.store(new_count, Ordering::Release);
        self.write_metadata(&self.dir)?;

        let mut nodes = Vec::new();
        for shard in &self.pending {
            for (_, mutation) in std::mem::take(&mut *shard.lock()) {
                nodes.extend(mutation.into_nodes());
            }
        }
        for node in nodes {
            let bucket = bucket_for_hash(node.hash, new_count);
            self.shard(bucket)
                .lock()
                .entry(bucket)
                .or_default()
                .push_node(node);
        }
        info!(
            store = %self.name,
            from = count,
            to = new_count,
            keys,
            "Resized bucket index"
        );
        Ok(true)
    }

    fn write_round(&self, round: &Round) -> Result<FlushSummary> {
        let result = self.try_write_round(round);
        if let Err(e) = &result {
            self.halted.store(true, Ordering::Release);
            error!(store = %self.name, error = %e, "Flush failed, halting map");
        }
        result
    }

    fn try_write_round(&self, round: &Round) -> Result<FlushSummary> {
        let bucket_count = self.bucket_count();
        let groups = self.group_by_location(round)?;
        let built = self.flush_pool.install(|| {
            groups
                .par_iter()
                .map(|group| self.build_pages(group, round, bucket_count))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut pages: BTreeMap<u32, Bucket> = BTreeMap::new();
        let mut old_entries = 0u64;
        for (group_pages, replaced) in built {
            old_entries += replaced as u64;
            for page in group_pages {
                pages.insert(page.bucket_index(), page);
            }
        }
        let new_entries: u64 = pages.values().map(|p| p.len() as u64).sum();

        let encoded: Vec<(u32, Vec<u8>)> = pages
            .iter()
            .map(|(bucket, page)| (*bucket, page.to_bytes()))
            .collect();
        let (locations, file) = self.collection.write_flush_file(|collection| {
            let mut locations = Vec::with_capacity(encoded.len());
            for (bucket, page) in &encoded {
                locations.push((*bucket, collection.store_data_item(page)?.as_u64()));
            }
            Ok(locations)
        })?;
        for (bucket, location) in &locations {
            self.bucket_index.put(*bucket as u64, *location)?;
        }
        *self.flushing.write() = None;

        let entries = (self.entry_count() + new_entries).saturating_sub(old_entries);
        self.entry_count.store(entries, Ordering::Release);
        self.write_metadata(&self.dir)?;

        let summary = FlushSummary {
            buckets_written: pages.len(),
            keys_written: round.values().map(|m| m.size()).sum(),
            bucket_count,
            file_index: file.map(|f| f.file_index()),
        };
        debug!(
            store = %self.name,
            buckets = summary.buckets_written,
            keys = summary.keys_written,
            entries,
            "Flushed round"
        );
        if let Some(executor) = &self.compaction_executor {
            self.compactor.schedule(executor.as_ref());
        }
        Ok(summary)
    }

    /// Groups the buckets of a round by the page they currently point at.
    fn group_by_location(&self, round: &Round) -> Result<Vec<FlushGroup>> {
        let mut groups = Vec::new();
        let mut shared: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for bucket in round.keys() {
            let location = self.bucket_index.get(*bucket as u64)?;
            if location == NON_EXISTENT_LOCATION {
                groups.push(FlushGroup {
                    location,
                    buckets: vec![*bucket],
                });
            } else {
                shared.entry(location).or_default().push(*bucket);
            }
        }
        groups.extend(
            shared
                .into_iter()
                .map(|(location, buckets)| FlushGroup { location, buckets }),
        );
        Ok(groups)
    }

    /// Builds the new pages for one group. Returns the pages and the number
    /// of entries in the page they replace.
    fn build_pages(
        &self,
        group: &FlushGroup,
        round: &Round,
        bucket_count: u32,
    ) -> Result<(Vec<Bucket>, usize)> {
        let existing = if group.location == NON_EXISTENT_LOCATION {
            None
        } else {
            // The page may move under a concurrent compaction; its content
            // does not change, so follow the index of any bucket sharing it.
            let first = group.buckets[0] as u64;
            self.collection
                .read_data_item_using_index(self.bucket_index.as_ref(), first)?
                .map(|payload| Bucket::from_bytes(&payload))
                .transpose()?
        };

        let mut members = group.buckets.clone();
        if let Some(page) = &existing {
            let page_count = page.bucket_count();
            if page_count < bucket_count {
                let family = (page.bucket_index()..bucket_count).step_by(page_count as usize);
                members.extend(family);
                members.sort_unstable();
                members.dedup();
            }
        }

        let replaced = existing.as_ref().map_or(0, |p| p.len());
        let mut pages = Vec::with_capacity(members.len());
        for bucket in members {
            let mut page = match &existing {
                Some(existing) => existing.sanitized(bucket, bucket_count),
                None => Bucket::new(bucket, bucket_count),
            };
            if let Some(mutation) = round.get(&bucket) {
                page.apply(mutation);
            }
            pages.push(page);
        }
        Ok((pages, replaced))
    }

    // =========================================================================
    // Index
    // =========================================================================

    /// Replays every page, oldest generation first, into the bucket index.
    ///
    /// Buckets without a page of their own were never written since the
    /// bucket count last grew; they inherit the page of the bucket they
    /// split from.
    fn rebuild_index(&self) -> Result<()> {
        let bucket_count = self.bucket_count() as u64;
        let files = self.collection.files_in_generation_order();
        let mut pages = 0u64;
        for file in &files {
            for item in file.iter(self.collection.iterator_buffer())? {
                let item = item?;
                let bucket = BucketView::new(&item.payload)?.bucket_index() as u64;
                if bucket >= bucket_count {
                    warn!(
                        store = %self.name,
                        bucket,
                        bucket_count,
                        "Skipping page of unknown bucket"
                    );
                    continue;
                }
                self.bucket_index.put(bucket, item.location.as_u64())?;
                pages += 1;
            }
        }

        let mut inherited = 0u64;
        for bucket in 1..bucket_count {
            if self.bucket_index.get(bucket)? != NON_EXISTENT_LOCATION {
                continue;
            }
            let parent = bucket ^ (1u64 << (63 - bucket.leading_zeros()));
            let location = self.bucket_index.get(parent)?;
            if location != NON_EXISTENT_LOCATION {
                self.bucket_index.put(bucket, location)?;
                inherited += 1;
            }
        }
        info!(
            store = %self.name,
            files = files.len(),
            pages,
            inherited,
            "Rebuilt bucket index"
        );
        Ok(())
    }

    fn write_metadata(&self, dir: &Path) -> Result<()> {
        let metadata = HashMapMetadata {
            version: METADATA_FILE_VERSION,
            bucket_count: self.bucket_count(),
            entry_count: self.entry_count(),
        };
        let raw = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| VirtaError::Internal(format!("cannot encode metadata: {}", e)))?;
        let path = dir.join(metadata_file_name(&self.name));
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Runs one compaction now if a level has reached the trigger.
    pub fn compact(&self) -> Result<Option<CompactionSummary>> {
        self.compactor.compact()
    }

    /// Merges every data file into one level.
    pub fn compact_all(&self) -> Result<Option<CompactionSummary>> {
        self.compactor.compact_all()
    }

    /// Writes the flushed state into `target`: data file links, bucket
    /// index and metadata.
    pub fn snapshot(&self, target: &Path) -> Result<()> {
        let _flush = self.flush_lock.lock();
        let _suspended = self.compactor.suspend();
        std::fs::create_dir_all(target)?;
        self.collection.snapshot(target)?;
        self.bucket_index
            .write_to_file(&target.join(index_file_name(&self.name)))?;
        self.write_metadata(target)
    }

    /// Flushes pending writes, waits for compaction and persists the index.
    pub fn close(&self) -> Result<()> {
        if !self.is_halted() && self.pending_count() > 0 {
            self.end_writing()?;
        }
        let _flush = self.flush_lock.lock();
        self.compactor.wait_idle();
        self.collection.close()?;
        self.bucket_index
            .write_to_file(&self.dir.join(index_file_name(&self.name)))?;
        self.write_metadata(&self.dir)?;
        info!(store = %self.name, buckets = self.bucket_count(), "Closed half-disk hash map");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn config(max_keys: u64) -> MerkleDbConfig {
        MerkleDbConfig {
            max_num_of_keys: max_keys,
            min_number_of_files_in_compaction: 2,
            fsync_enabled: false,
            long_list_chunk_size: 1024,
            reserved_buffer_length_for_leaf_list: 1024,
            ..MerkleDbConfig::default()
        }
    }

    fn open(dir: &Path, config: &MerkleDbConfig) -> HalfDiskHashMap {
        let pool = RayonExecutor::shared("test-flush", 2).unwrap();
        HalfDiskHashMap::open(dir, "objects", config, pool, None).unwrap()
    }

    fn key(i: u64) -> Vec<u8> {
        format!("key-{}", i).into_bytes()
    }

    #[test]
    fn test_initial_bucket_count() {
        assert_eq!(initial_bucket_count(0), 2);
        assert_eq!(initial_bucket_count(31), 2);
        assert_eq!(initial_bucket_count(100), 4);
        assert_eq!(initial_bucket_count(500_000_000), 1 << 24);
    }

    #[test]
    fn test_read_after_write_before_and_after_flush() {
        let dir = tempdir().unwrap();
        let map = open(dir.path(), &config(1000));
        assert_eq!(map.get(b"missing").unwrap(), None);

        map.put(b"a", 1).unwrap();
        map.put(b"b", 2).unwrap();
        map.put(b"a", 3).unwrap();
        assert_eq!(map.get(b"a").unwrap(), Some(3));

        let summary = map.end_writing().unwrap().unwrap();
        assert_eq!(summary.keys_written, 2);
        assert_eq!(map.pending_count(), 0);
        assert_eq!(map.get(b"a").unwrap(), Some(3));
        assert_eq!(map.get(b"b").unwrap(), Some(2));
        assert_eq!(map.get(b"c").unwrap(), None);
        assert!(map.end_writing().unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let map = open(dir.path(), &config(1000));
        map.put(b"a", 1).unwrap();
        map.end_writing().unwrap();
        map.delete(b"a").unwrap();
        assert_eq!(map.get(b"a").unwrap(), None);
        map.end_writing().unwrap();
        assert_eq!(map.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_put_if_equal() {
        let dir = tempdir().unwrap();
        let map = open(dir.path(), &config(1000));
        map.put(b"a", 10).unwrap();
        map.end_writing().unwrap();

        assert!(!map.put_if_equal(b"a", 9, 11).unwrap());
        assert_eq!(map.get(b"a").unwrap(), Some(10));
        assert!(map.put_if_equal(b"a", 10, 11).unwrap());
        assert_eq!(map.get(b"a").unwrap(), Some(11));
        assert!(!map.put_if_equal(b"missing", 0, 1).unwrap());

        map.end_writing().unwrap();
        assert_eq!(map.get(b"a").unwrap(), Some(11));
        assert!(!map.delete_if_equal(b"a", 10).unwrap());
        assert!(map.delete_if_equal(b"a", 11).unwrap());
        assert_eq!(map.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_resize_keeps_all_keys() {
        let dir = tempdir().unwrap();
        let map = open(dir.path(), &config(64));
        assert_eq!(map.bucket_count(), 4);

        for i in 0..100 {
            map.put(&key(i), i).unwrap();
        }
        map.end_writing().unwrap();
        assert_eq!(map.bucket_count(), 4);

        for i in 100..300 {
            map.put(&key(i), i).unwrap();
        }
        map.end_writing().unwrap();
        assert_eq!(map.bucket_count(), 8);
        for i in 0..300 {
            assert_eq!(map.get(&key(i)).unwrap(), Some(i), "key {}", i);
        }

        // Touch a single bucket so only its family is split.
        map.put(&key(0), 1000).unwrap();
        map.end_writing().unwrap();
        assert_eq!(map.get(&key(0)).unwrap(), Some(1000));
        for i in 1..300 {
            assert_eq!(map.get(&key(i)).unwrap(), Some(i), "key {}", i);
        }
    }

    #[test]
    fn test_reopen_with_saved_and_rebuilt_index() {
        let dir = tempdir().unwrap();
        let cfg = config(64);
        {
            let map = open(dir.path(), &cfg);
            for i in 0..200 {
                map.put(&key(i), i).unwrap();
            }
            map.end_writing().unwrap();
            for i in 200..400 {
                map.put(&key(i), i).unwrap();
            }
            map.delete(&key(7)).unwrap();
            map.close().unwrap();
        }
        let expected_count = {
            let map = open(dir.path(), &cfg);
            for i in 0..400 {
                let want = if i == 7 { None } else { Some(i) };
                assert_eq!(map.get(&key(i)).unwrap(), want, "key {}", i);
            }
            map.bucket_count()
        };

        let rebuild = MerkleDbConfig {
            index_rebuilding_enforced: true,
            ..cfg
        };
        let map = open(dir.path(), &rebuild);
        assert_eq!(map.bucket_count(), expected_count);
        for i in 0..400 {
            let want = if i == 7 { None } else { Some(i) };
            assert_eq!(map.get(&key(i)).unwrap(), want, "key {}", i);
        }
    }

    #[test]
    fn test_crash_without_close_rebuilds_index() {
        let dir = tempdir().unwrap();
        let cfg = config(1000);
        {
            let map = open(dir.path(), &cfg);
            map.put(b"a", 1).unwrap();
            map.end_writing().unwrap();
            map.put(b"a", 2).unwrap();
            map.end_writing().unwrap();
            map.put(b"lost", 3).unwrap();
        }
        let map = open(dir.path(), &cfg);
        assert_eq!(map.get(b"a").unwrap(), Some(2));
        assert_eq!(map.get(b"lost").unwrap(), None);
    }

    #[test]
    fn test_compaction_preserves_values() {
        let dir = tempdir().unwrap();
        let map = open(dir.path(), &config(1000));
        let mut expected = HashMap::new();
        for round in 0..4u64 {
            for i in 0..50u64 {
                let value = round * 100 + i;
                map.put(&key(i), value).unwrap();
                expected.insert(i, value);
            }
            map.end_writing().unwrap();
        }
        assert_eq!(map.file_count(), 4);
        map.compact_all().unwrap().unwrap();
        assert_eq!(map.file_count(), 1);
        for (i, value) in &expected {
            assert_eq!(map.get(&key(*i)).unwrap(), Some(*value));
        }
    }

    #[test]
    fn test_metadata_without_data_files_is_created() {
        let dir = tempdir().unwrap();
        let map = open(dir.path(), &config(1000));
        drop(map);
        let metadata = read_metadata(&dir.path().join(metadata_file_name("objects")))
            .unwrap()
            .unwrap();
        assert_eq!(metadata.bucket_count, initial_bucket_count(1000));
    }

    #[test]
    fn test_missing_metadata_with_files_rejected() {
        let dir = tempdir().unwrap();
        let cfg = config(1000);
        {
            let map = open(dir.path(), &cfg);
            map.put(b"a", 1).unwrap();
            map.close().unwrap();
        }
        std::fs::remove_file(dir.path().join(metadata_file_name("objects"))).unwrap();
        let pool = RayonExecutor::shared("test-flush", 1).unwrap();
        let result = HalfDiskHashMap::open(dir.path(), "objects", &cfg, pool, None);
        assert!(matches!(result, Err(VirtaError::Corrupted { .. })));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let dir = tempdir().unwrap();
        let snap = tempdir().unwrap();
        let cfg = config(1000);
        let map = open(dir.path(), &cfg);
        map.put(b"a", 1).unwrap();
        map.end_writing().unwrap();
        map.snapshot(snap.path()).unwrap();

        map.put(b"a", 2).unwrap();
        map.end_writing().unwrap();

        let copy = open(snap.path(), &cfg);
        assert_eq!(copy.get(b"a").unwrap(), Some(1));
        assert_eq!(map.get(b"a").unwrap(), Some(2));
    }

    #[test]
    fn test_failed_flush_halts_map() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("store");
        let map = open(&store, &config(1000));
        map.put(b"a", 1).unwrap();
        std::fs::remove_dir_all(&store).unwrap();

        assert!(map.end_writing().is_err());
        assert!(map.is_halted());
        assert!(matches!(map.put(b"b", 2), Err(VirtaError::Halted(_))));
        assert!(matches!(map.delete(b"a"), Err(VirtaError::Halted(_))));
    }
}
