//! Virtual Merkle map.
//!
//! A key/value map whose records are the leaves of a complete binary tree
//! (see [`crate::path`]). Three stores back it, all in one directory:
//!
//! ```text
//! key_to_path   half-disk hash map   key  -> leaf path
//! leaves        path-keyed store     path -> leaf record
//! hashes        tiered hash store    path -> node hash
//! ```
//!
//! Mutations collect in memory and reach the stores on [`VirtualMap::flush`].
//! The root hash depends only on the sequence of mutations, never on when
//! flushes or compactions ran.

use crate::cache::LeafCache;
use crate::hash_store::HashStore;
use crate::hashmap::{HalfDiskHashMap, PreparedFlush};
use crate::path::{
    left_child, parent, path_capacity, plan_add, plan_remove, right_child, LeafRange,
    MAX_LEAF_COUNT, ROOT_PATH,
};
use crate::record::LeafRecord;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use virta_common::{
    Hash, MerkleDbConfig, RayonExecutor, Result, TaskExecutor, VirtaError,
};
use virta_files::DiskKeyValueStore;

/// Metadata file of a map directory.
pub const MAP_METADATA_FILE_NAME: &str = "virtual_map.json";

pub const KEY_TO_PATH_STORE_NAME: &str = "key_to_path";
pub const LEAVES_STORE_NAME: &str = "leaves";

const MAP_METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct MapMetadata {
    version: u32,
    hashes_ram_to_disk_threshold: u64,
    first_leaf_path: Option<u64>,
    last_leaf_path: Option<u64>,
}

impl MapMetadata {
    fn new(threshold: u64, range: Option<LeafRange>) -> Self {
        Self {
            version: MAP_METADATA_VERSION,
            hashes_ram_to_disk_threshold: threshold,
            first_leaf_path: range.map(|r| r.first),
            last_leaf_path: range.map(|r| r.last),
        }
    }

    fn range(&self) -> Option<LeafRange> {
        match (self.first_leaf_path, self.last_leaf_path) {
            (Some(first), Some(last)) => Some(LeafRange::new(first, last)),
            _ => None,
        }
    }

    fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MAP_METADATA_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        let metadata: MapMetadata = serde_json::from_slice(&raw).map_err(|e| {
            VirtaError::DecodeError(format!("cannot parse {}: {}", path.display(), e))
        })?;
        if metadata.version != MAP_METADATA_VERSION {
            return Err(VirtaError::DecodeError(format!(
                "unsupported map metadata version {}",
                metadata.version
            )));
        }
        Ok(Some(metadata))
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| VirtaError::Internal(format!("cannot encode metadata: {}", e)))?;
        let path = dir.join(MAP_METADATA_FILE_NAME);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Changes made since the last flush.
#[derive(Default)]
struct MapState {
    range: Option<LeafRange>,
    /// Changed leaves; None marks a path that no longer holds a leaf.
    leaves: BTreeMap<u64, Option<LeafRecord>>,
    /// Hashes computed since the last flush.
    hashes: BTreeMap<u64, Hash>,
    /// Paths whose hash must be recomputed.
    dirty: BTreeSet<u64>,
}

/// Changes being written by the current flush.
#[derive(Default)]
struct FlushingState {
    leaves: BTreeMap<u64, Option<LeafRecord>>,
    hashes: BTreeMap<u64, Hash>,
}

/// Result of looking a key up.
enum Lookup {
    Absent,
    Found(u64, LeafRecord),
    /// The key maps to a path whose leaf holds another key, or no leaf.
    Leaked(u64, Option<LeafRecord>),
}

/// Key/value map with a deterministic Merkle root hash.
pub struct VirtualMap {
    dir: PathBuf,
    config: MerkleDbConfig,
    read_only: bool,
    key_to_path: HalfDiskHashMap,
    leaves: DiskKeyValueStore,
    hashes: HashStore,
    leaf_cache: LeafCache,
    state: RwLock<MapState>,
    flushing: RwLock<Arc<FlushingState>>,
    /// Leaf range as of the last flush.
    flushed_range: Mutex<Option<LeafRange>>,
    flush_lock: Mutex<()>,
    flush_pool: Arc<RayonExecutor>,
    halted: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl VirtualMap {
    /// Opens or creates the map stored in `dir`.
    ///
    /// Fails with `ConfigError` when the configuration is invalid or its
    /// hash threshold differs from the one the map was created with.
    pub fn open(dir: &Path, config: MerkleDbConfig) -> Result<Self> {
        config.validate()?;
        let flush_pool = RayonExecutor::shared("virta-flush", config.flush_thread_count())?;
        let compaction_pool: Arc<dyn TaskExecutor> =
            RayonExecutor::shared("virta-compaction", config.compaction_threads)?;
        Self::open_with(dir, config, false, flush_pool, Some(compaction_pool))
    }

    fn open_with(
        dir: &Path,
        config: MerkleDbConfig,
        read_only: bool,
        flush_pool: Arc<RayonExecutor>,
        compaction_pool: Option<Arc<dyn TaskExecutor>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let threshold = config.hashes_ram_to_disk_threshold;
        let range = match MapMetadata::read(dir)? {
            Some(metadata) if metadata.hashes_ram_to_disk_threshold != threshold => {
                return Err(VirtaError::ConfigError(format!(
                    "map in {} was created with hashes_ram_to_disk_threshold {}, not {}",
                    dir.display(),
                    metadata.hashes_ram_to_disk_threshold,
                    threshold
                )));
            }
            Some(metadata) => metadata.range(),
            None => None,
        };

        let key_to_path = HalfDiskHashMap::open(
            dir,
            KEY_TO_PATH_STORE_NAME,
            &config,
            Arc::clone(&flush_pool),
            compaction_pool.clone(),
        )?;
        let leaves = DiskKeyValueStore::open(
            dir,
            LEAVES_STORE_NAME,
            &config,
            path_capacity(MAX_LEAF_COUNT),
            range.map(|r| (r.first, r.last)),
            compaction_pool.clone(),
        )?;
        let hashes = HashStore::open(dir, &config, range.map(|r| r.last), compaction_pool)?;
        MapMetadata::new(threshold, range).write(dir)?;

        info!(
            dir = %dir.display(),
            leaves = range.map_or(0, |r| r.leaf_count()),
            read_only,
            "Opened virtual map"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            leaf_cache: LeafCache::new(config.leaf_record_cache_size),
            config,
            read_only,
            key_to_path,
            leaves,
            hashes,
            state: RwLock::new(MapState {
                range,
                ..MapState::default()
            }),
            flushing: RwLock::new(Arc::new(FlushingState::default())),
            flushed_range: Mutex::new(range),
            flush_lock: Mutex::new(()),
            flush_pool,
            halted: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding the stores.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the map was opened with.
    pub fn config(&self) -> &MerkleDbConfig {
        &self.config
    }

    /// True for snapshot maps, which reject every mutation.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The key to path index.
    pub fn key_to_path(&self) -> &HalfDiskHashMap {
        &self.key_to_path
    }

    /// The path-keyed leaf record store.
    pub fn leaf_store(&self) -> &DiskKeyValueStore {
        &self.leaves
    }

    /// The path-keyed node hash store.
    pub fn hash_store(&self) -> &HashStore {
        &self.hashes
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VirtaError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(VirtaError::ReadOnly);
        }
        if let Some(reason) = self.halted.lock().as_ref() {
            return Err(VirtaError::Halted(reason.clone()));
        }
        Ok(())
    }

    fn halt(&self, cause: &VirtaError) {
        error!(dir = %self.dir.display(), error = %cause, "Flush failed, halting map");
        self.halted.lock().get_or_insert_with(|| cause.to_string());
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Number of leaves.
    pub fn size(&self) -> u64 {
        self.state.read().range.map_or(0, |r| r.leaf_count())
    }

    /// Path of the first leaf, None when the map is empty.
    pub fn first_leaf_path(&self) -> Option<u64> {
        self.state.read().range.map(|r| r.first)
    }

    /// Path of the last leaf, None when the map is empty.
    pub fn last_leaf_path(&self) -> Option<u64> {
        self.state.read().range.map(|r| r.last)
    }

    /// Returns the value stored for `key`.
    ///
    /// A key whose path holds another key's leaf is a leak left by a
    /// reconnect. With leak mitigation on it reads as absent; otherwise the
    /// leaf found at its path is returned.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_open()?;
        let state = self.state.read();
        let flushing = self.flushing.read().clone();
        match self.resolve(&state, &flushing, key)? {
            Lookup::Absent => Ok(None),
            Lookup::Found(_, record) => Ok(Some(record.value)),
            Lookup::Leaked(path, leaf) => {
                if self.config.reconnect_key_leak_mitigation_enabled {
                    debug!(path, "Ignoring leaked key");
                    Ok(None)
                } else {
                    warn!(path, found = leaf.is_some(), "Returning leaked key");
                    Ok(leaf.map(|r| r.value))
                }
            }
        }
    }

    /// Returns the leaf record at `path`.
    pub fn get_leaf_by_path(&self, path: u64) -> Result<Option<LeafRecord>> {
        self.check_open()?;
        let state = self.state.read();
        match state.range {
            Some(range) if range.contains(path) => {
                let flushing = self.flushing.read().clone();
                self.leaf_at(&state, &flushing, path)
            }
            _ => Ok(None),
        }
    }

    /// Returns the stored hash of the node at `path`.
    ///
    /// Hashes are only current after `compute_root_hash`; nothing is
    /// recomputed here.
    pub fn get_hash(&self, path: u64) -> Result<Option<Hash>> {
        self.check_open()?;
        let state = self.state.read();
        match state.range {
            Some(range) if path <= range.last => {
                let flushing = self.flushing.read().clone();
                self.stored_hash(&state, &flushing, path)
            }
            _ => Ok(None),
        }
    }

    fn resolve(&self, state: &MapState, flushing: &FlushingState, key: &[u8]) -> Result<Lookup> {
        let Some(path) = self.key_to_path.get(key)? else {
            return Ok(Lookup::Absent);
        };
        let leaf = match state.range {
            Some(range) if range.contains(path) => self.leaf_at(state, flushing, path)?,
            _ => None,
        };
        Ok(match leaf {
            Some(record) if record.key.as_ref() == key => Lookup::Found(path, record),
            other => Lookup::Leaked(path, other),
        })
    }

    fn leaf_at(
        &self,
        state: &MapState,
        flushing: &FlushingState,
        path: u64,
    ) -> Result<Option<LeafRecord>> {
        if let Some(leaf) = state.leaves.get(&path) {
            return Ok(leaf.clone());
        }
        if let Some(leaf) = flushing.leaves.get(&path) {
            return Ok(leaf.clone());
        }
        if let Some(leaf) = self.leaf_cache.get(path) {
            return Ok(Some(leaf));
        }
        let Some(raw) = self.leaves.get(path)? else {
            return Ok(None);
        };
        let record = LeafRecord::from_bytes(&raw)?;
        self.leaf_cache.put(path, record.clone());
        Ok(Some(record))
    }

    fn stored_hash(
        &self,
        state: &MapState,
        flushing: &FlushingState,
        path: u64,
    ) -> Result<Option<Hash>> {
        if let Some(hash) = state.hashes.get(&path) {
            return Ok(Some(*hash));
        }
        if let Some(hash) = flushing.hashes.get(&path) {
            return Ok(Some(*hash));
        }
        self.hashes.get(path)
    }

    fn require_leaf(
        &self,
        state: &MapState,
        flushing: &FlushingState,
        path: u64,
    ) -> Result<LeafRecord> {
        self.leaf_at(state, flushing, path)?
            .ok_or_else(|| VirtaError::Corrupted {
                location: format!("leaf path {}", path),
                reason: "no leaf record".to_string(),
            })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Sets `key` to `value`.
    ///
    /// Fails with `InvalidParameter`, changing nothing, when a new key would
    /// grow the tree past [`MAX_LEAF_COUNT`] leaves.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        // Lookups may read disk. The write lock is only taken to mutate.
        let state = self.state.upgradable_read();
        let flushing = self.flushing.read().clone();
        let record = LeafRecord::new(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        match self.resolve(&state, &flushing, key)? {
            Lookup::Found(path, _) => {
                let mut state = RwLockUpgradableReadGuard::upgrade(state);
                set_leaf(&mut state, path, record);
                return Ok(());
            }
            Lookup::Leaked(path, _) => {
                debug!(path, "Replacing leaked key with a new leaf");
            }
            Lookup::Absent => {}
        }

        let plan = plan_add(state.range);
        if plan.range.leaf_count() > MAX_LEAF_COUNT {
            return Err(VirtaError::invalid_parameter(
                "leaf_count",
                plan.range.leaf_count(),
            ));
        }
        let moved = match plan.moved {
            Some((from, to)) => Some((from, to, self.require_leaf(&state, &flushing, from)?)),
            None => None,
        };

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        if let Some((from, to, moved)) = moved {
            self.key_to_path.put(&moved.key, to)?;
            set_leaf(&mut state, to, moved);
            state.leaves.insert(from, None);
            state.dirty.insert(from);
        }
        self.key_to_path.put(key, plan.new_path)?;
        set_leaf(&mut state, plan.new_path, record);
        state.range = Some(plan.range);
        Ok(())
    }

    /// Deletes `key`. Returns false if it was absent.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        let state = self.state.upgradable_read();
        let flushing = self.flushing.read().clone();
        let path = match self.resolve(&state, &flushing, key)? {
            Lookup::Found(path, _) => path,
            Lookup::Leaked(path, _) => {
                debug!(path, "Dropping leaked key");
                self.key_to_path.delete_if_equal(key, path)?;
                return Ok(false);
            }
            Lookup::Absent => return Ok(false),
        };
        let Some(range) = state.range else {
            return Err(VirtaError::Internal(format!("leaf {} found in an empty tree", path)));
        };

        let plan = plan_remove(range, path);
        let mut moves = Vec::with_capacity(plan.moves.len());
        for (from, to) in &plan.moves {
            moves.push((*to, self.require_leaf(&state, &flushing, *from)?));
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        self.key_to_path.delete(key)?;
        for (to, moved) in moves {
            self.key_to_path.put(&moved.key, to)?;
            set_leaf(&mut state, to, moved);
        }
        let kept = plan.range.map_or(range.first, |r| r.last + 1);
        for vacated in kept..=range.last {
            state.leaves.insert(vacated, None);
            state.hashes.remove(&vacated);
            state.dirty.remove(&vacated);
        }
        if let Some(p) = parent(range.last) {
            state.dirty.insert(p);
        }
        state.range = plan.range;
        Ok(true)
    }

    // =========================================================================
    // Hashing
    // =========================================================================

    /// Computes the root hash of the current state.
    pub fn compute_root_hash(&self) -> Result<Hash> {
        self.check_open()?;
        let mut state = self.state.write();
        let flushing = self.flushing.read().clone();
        self.compute_root_locked(&mut state, &flushing)
    }

    /// Rehashes every dirty path, children before parents.
    fn compute_root_locked(&self, state: &mut MapState, flushing: &FlushingState) -> Result<Hash> {
        let Some(range) = state.range else {
            state.dirty.clear();
            return Ok(Hash::empty());
        };

        let mut internal = BTreeSet::new();
        let dirty: Vec<u64> = state.dirty.iter().copied().collect();
        for path in dirty {
            if range.contains(path) {
                let hash = self.require_leaf(state, flushing, path)?.hash();
                state.hashes.insert(path, hash);
                if let Some(p) = parent(path) {
                    internal.insert(p);
                }
            } else if range.is_internal(path) {
                internal.insert(path);
            }
        }
        while let Some(path) = internal.pop_last() {
            let hash = self.internal_hash(state, flushing, range, path)?;
            state.hashes.insert(path, hash);
            if let Some(p) = parent(path) {
                internal.insert(p);
            }
        }
        state.dirty.clear();
        self.node_hash(state, flushing, range, ROOT_PATH)
    }

    fn internal_hash(
        &self,
        state: &MapState,
        flushing: &FlushingState,
        range: LeafRange,
        path: u64,
    ) -> Result<Hash> {
        let left = self.node_hash(state, flushing, range, left_child(path))?;
        let right_path = right_child(path);
        let right = if right_path <= range.last {
            Some(self.node_hash(state, flushing, range, right_path)?)
        } else {
            None
        };
        Ok(Hash::of_internal(&left, right.as_ref()))
    }

    /// Returns the hash of `path`, recomputing it from the leaves when no
    /// stored hash exists.
    fn node_hash(
        &self,
        state: &MapState,
        flushing: &FlushingState,
        range: LeafRange,
        path: u64,
    ) -> Result<Hash> {
        if let Some(hash) = self.stored_hash(state, flushing, path)? {
            return Ok(hash);
        }
        if range.contains(path) {
            return Ok(self.require_leaf(state, flushing, path)?.hash());
        }
        self.internal_hash(state, flushing, range, path)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Writes every change since the last flush to the stores.
    ///
    /// A failure halts the map: later mutations return `Halted`.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.check_writable()?;
        let _flush = self.flush_lock.lock();

        let (flushing, range, prepared) = {
            let mut state = self.state.write();
            let current = self.flushing.read().clone();
            if let Err(e) = self.compute_root_locked(&mut state, &current) {
                self.halt(&e);
                return Err(e);
            }
            let flushing = Arc::new(FlushingState {
                leaves: std::mem::take(&mut state.leaves),
                hashes: std::mem::take(&mut state.hashes),
            });
            *self.flushing.write() = Arc::clone(&flushing);
            let prepared = match self.key_to_path.begin_flush() {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.halt(&e);
                    return Err(e);
                }
            };
            (flushing, state.range, prepared)
        };

        if let Err(e) = self.write_flushing(&flushing, range, prepared) {
            self.halt(&e);
            return Err(e);
        }

        for (path, leaf) in &flushing.leaves {
            match leaf {
                Some(record) if range.is_some_and(|r| r.contains(*path)) => {
                    self.leaf_cache.put(*path, record.clone())
                }
                _ => self.leaf_cache.remove(*path),
            }
        }
        self.leaf_cache
            .retain_below(range.map_or(0, |r| r.last + 1));
        *self.flushing.write() = Arc::new(FlushingState::default());
        *self.flushed_range.lock() = range;
        MapMetadata::new(self.hashes.threshold(), range).write(&self.dir)?;
        debug!(
            leaves = flushing.leaves.len(),
            hashes = flushing.hashes.len(),
            size = range.map_or(0, |r| r.leaf_count()),
            "Flushed virtual map"
        );
        Ok(())
    }

    fn write_flushing(
        &self,
        flushing: &FlushingState,
        range: Option<LeafRange>,
        prepared: Option<PreparedFlush<'_>>,
    ) -> Result<()> {
        self.leaves.set_valid_range(range.map(|r| (r.first, r.last)))?;
        let live: Vec<(u64, Vec<u8>)> = flushing
            .leaves
            .iter()
            .filter(|(path, _)| range.is_some_and(|r| r.contains(**path)))
            .filter_map(|(path, leaf)| leaf.as_ref().map(|record| (*path, record.to_bytes())))
            .collect();
        self.leaves.write_items(&live)?;

        let last = range.map(|r| r.last);
        self.hashes.set_last_path(last)?;
        let hashes: BTreeMap<u64, Hash> = match last {
            Some(last) => flushing
                .hashes
                .range(..=last)
                .map(|(p, h)| (*p, *h))
                .collect(),
            None => BTreeMap::new(),
        };
        self.hashes.write(&hashes)?;

        if let Some(prepared) = prepared {
            prepared.commit()?;
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Merges the data files of every store.
    pub fn compact_all(&self) -> Result<()> {
        self.check_open()?;
        self.key_to_path.compact_all()?;
        self.leaves.compact_all()?;
        self.hashes.compact_all()?;
        Ok(())
    }

    /// Flushes, then writes the flushed state into `target` and opens it as
    /// a read-only map.
    pub fn snapshot(&self, target: &Path) -> Result<MapSnapshot> {
        self.check_open()?;
        self.flush()?;
        {
            let _flush = self.flush_lock.lock();
            std::fs::create_dir_all(target)?;
            self.key_to_path.snapshot(target)?;
            self.leaves.snapshot(target)?;
            self.hashes.snapshot(target)?;
            let range = *self.flushed_range.lock();
            MapMetadata::new(self.hashes.threshold(), range).write(target)?;
        }
        let map = Self::open_with(
            target,
            self.config.clone(),
            true,
            Arc::clone(&self.flush_pool),
            None,
        )?;
        info!(source = %self.dir.display(), target = %target.display(), "Created snapshot");
        Ok(MapSnapshot(Arc::new(map)))
    }

    /// Flushes and persists every store. Later calls return `Closed`.
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        self.flush()?;
        let _flush = self.flush_lock.lock();
        self.key_to_path.close()?;
        self.leaves.close()?;
        self.hashes.close()?;
        let range = *self.flushed_range.lock();
        MapMetadata::new(self.hashes.threshold(), range).write(&self.dir)?;
        self.closed.store(true, Ordering::Release);
        info!(dir = %self.dir.display(), "Closed virtual map");
        Ok(())
    }
}

fn set_leaf(state: &mut MapState, path: u64, record: LeafRecord) {
    state.leaves.insert(path, Some(record));
    state.dirty.insert(path);
}

/// Read-only map over a snapshot directory, shared by reference count.
#[derive(Clone)]
pub struct MapSnapshot(Arc<VirtualMap>);

impl Deref for MapSnapshot {
    type Target = VirtualMap;

    fn deref(&self) -> &VirtualMap {
        &self.0
    }
}
