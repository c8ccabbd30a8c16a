//! A directory of data files belonging to one store.
//!
//! The collection owns every physical file of a store. Indexes hold packed
//! `DataLocation`s into it, never file handles. The set of live files is an
//! immutable map behind an `ArcSwap`, replaced wholesale when a flush adds a
//! file or a compaction swaps inputs for outputs.

use crate::constants::MAX_INDEX_READ_ATTEMPTS;
use crate::header::{data_file_name, parse_data_file_name};
use crate::reader::{ChannelLimits, DataFileReader};
use crate::retry::RetryPolicy;
use crate::writer::DataFileWriter;
use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use virta_collections::LongList;
use virta_common::{DataLocation, MerkleDbConfig, Result, VirtaError, NON_EXISTENT_LOCATION};

/// Live files keyed by file index.
pub type FileSet = BTreeMap<u32, Arc<DataFileReader>>;

/// Append-only set of data files for one store.
pub struct DataFileCollection {
    /// Directory holding the files.
    dir: PathBuf,
    /// Store name, used as file name prefix.
    store_name: String,
    /// Current set of live files.
    files: ArcSwap<FileSet>,
    /// Next file index to hand out.
    next_file_index: AtomicU32,
    /// Next generation to assign to a flush file.
    next_generation: AtomicU64,
    /// File currently written by a flush.
    current_writer: Mutex<Option<DataFileWriter>>,
    /// Serializes file set replacement and generation assignment.
    file_set_lock: Mutex<()>,
    /// Valid key range for path-keyed stores.
    valid_key_range: Mutex<Option<(u64, u64)>>,
    /// Handle limits for readers.
    limits: ChannelLimits,
    /// Retry budget for transient I/O.
    retry: RetryPolicy,
    /// Scan buffer size.
    iterator_buffer: usize,
    /// Enable fsync when sealing.
    fsync: bool,
}

impl DataFileCollection {
    /// Opens the collection in `dir`, loading every sealed file of the store.
    ///
    /// Unsealed files are left over from a crash mid-write and are deleted.
    pub fn open(dir: &Path, store_name: &str, config: &MerkleDbConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let limits = ChannelLimits {
            max_channels: config.max_file_channels_per_file_reader,
            max_threads_per_channel: config.max_threads_per_file_channel,
        };
        let retry = RetryPolicy::from_config(config);

        let mut files = FileSet::new();
        let mut max_index = 0u32;
        let mut max_generation = 0u64;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(file_index) = parse_data_file_name(store_name, &name.to_string_lossy()) else {
                continue;
            };
            let path = entry.path();
            max_index = max_index.max(file_index);

            let header = DataFileReader::read_header(&mut File::open(&path)?);
            match header {
                Ok(h) if h.is_sealed() && h.file_index == file_index => {
                    let reader = DataFileReader::open(&path, limits, retry)?;
                    max_generation = max_generation.max(reader.generation());
                    files.insert(file_index, Arc::new(reader));
                }
                Ok(_) | Err(VirtaError::Corrupted { .. }) => {
                    warn!(
                        store = store_name,
                        path = %path.display(),
                        "Deleting incomplete data file"
                    );
                    std::fs::remove_file(&path)?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            store = store_name,
            files = files.len(),
            next_file_index = max_index + 1,
            "Opened data file collection"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            store_name: store_name.to_string(),
            files: ArcSwap::from_pointee(files),
            next_file_index: AtomicU32::new(max_index + 1),
            next_generation: AtomicU64::new(max_generation + 1),
            current_writer: Mutex::new(None),
            file_set_lock: Mutex::new(()),
            valid_key_range: Mutex::new(None),
            limits,
            retry,
            iterator_buffer: config.iterator_input_buffer_bytes,
            fsync: config.fsync_enabled,
        })
    }

    /// Returns the directory of the collection.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the store name.
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Returns the retry policy used for file I/O.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Returns the scan buffer size.
    pub fn iterator_buffer(&self) -> usize {
        self.iterator_buffer
    }

    /// Returns the current set of live files.
    pub fn files(&self) -> Arc<FileSet> {
        self.files.load_full()
    }

    /// Returns the number of live files.
    pub fn file_count(&self) -> usize {
        self.files.load().len()
    }

    /// Returns live files in `(generation, file_index)` order, oldest first.
    pub fn files_in_generation_order(&self) -> Vec<Arc<DataFileReader>> {
        let mut files: Vec<_> = self.files.load().values().cloned().collect();
        files.sort_by_key(|f| (f.generation(), f.file_index()));
        files
    }

    /// Groups completed files by compaction level.
    pub fn files_by_level(&self) -> BTreeMap<u32, Vec<Arc<DataFileReader>>> {
        let mut levels: BTreeMap<u32, Vec<Arc<DataFileReader>>> = BTreeMap::new();
        for file in self.files.load().values() {
            if file.is_completed() {
                levels.entry(file.level()).or_default().push(Arc::clone(file));
            }
        }
        levels
    }

    /// Returns the valid key range, if one is set.
    pub fn valid_key_range(&self) -> Option<(u64, u64)> {
        *self.valid_key_range.lock()
    }

    /// Sets the range of keys that are still live for path-keyed stores.
    pub fn set_valid_key_range(&self, range: Option<(u64, u64)>) {
        *self.valid_key_range.lock() = range;
    }

    /// Returns true if a flush file is being written.
    pub fn is_writing(&self) -> bool {
        self.current_writer.lock().is_some()
    }

    /// Starts a new flush file.
    pub fn start_writing(&self) -> Result<()> {
        let mut current = self.current_writer.lock();
        if current.is_some() {
            return Err(VirtaError::AlreadyWriting(self.store_name.clone()));
        }
        let file_index = self.next_file_index.fetch_add(1, Ordering::AcqRel);
        *current = Some(DataFileWriter::create(&self.dir, &self.store_name, file_index, 0)?);
        Ok(())
    }

    /// Appends an item to the flush file.
    pub fn store_data_item(&self, payload: &[u8]) -> Result<DataLocation> {
        let mut current = self.current_writer.lock();
        let writer = current
            .as_mut()
            .ok_or_else(|| VirtaError::NotWriting(self.store_name.clone()))?;
        writer.store_item(payload)
    }

    /// Seals the flush file and adds it to the live set.
    ///
    /// Returns None when nothing was written; the empty file is discarded.
    pub fn end_writing(&self) -> Result<Option<Arc<DataFileReader>>> {
        let writer = self
            .current_writer
            .lock()
            .take()
            .ok_or_else(|| VirtaError::NotWriting(self.store_name.clone()))?;
        if writer.item_count() == 0 {
            writer.abort()?;
            return Ok(None);
        }

        let _guard = self.file_set_lock.lock();
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let path = writer.path().to_path_buf();
        let reader = match writer
            .finish(generation, self.fsync)
            .and_then(|(path, _)| DataFileReader::open(&path, self.limits, self.retry))
        {
            Ok(reader) => Arc::new(reader),
            Err(e) => {
                self.discard_file(&path);
                return Err(e);
            }
        };
        self.files.rcu(|current| {
            let mut next = FileSet::clone(current);
            next.insert(reader.file_index(), Arc::clone(&reader));
            next
        });
        debug!(
            store = %self.store_name,
            file_index = reader.file_index(),
            generation,
            "Registered flush file"
        );
        Ok(Some(reader))
    }

    /// Writes one flush file with `write`, then seals and registers it.
    ///
    /// A failed attempt discards its file. Transient I/O failures are retried
    /// with a fresh file until the retry budget runs out, so `write` must be
    /// safe to run more than once. Returns what `write` produced and the new
    /// file, or None when `write` stored nothing.
    pub fn write_flush_file<T>(
        &self,
        mut write: impl FnMut(&Self) -> Result<T>,
    ) -> Result<(T, Option<Arc<DataFileReader>>)> {
        let what = format!("flush {}", self.store_name);
        self.retry.run(&what, || {
            self.start_writing()?;
            let written = write(self).and_then(|value| Ok((value, self.end_writing()?)));
            if written.is_err() {
                if let Err(abort) = self.abort_writing() {
                    warn!(store = %self.store_name, error = %abort, "Failed to discard flush file");
                }
            }
            written
        })
    }

    /// Discards the flush file without registering it.
    pub fn abort_writing(&self) -> Result<()> {
        if let Some(writer) = self.current_writer.lock().take() {
            writer.abort()?;
        }
        Ok(())
    }

    /// Creates a writer for compaction output at `level`.
    pub fn new_compaction_writer(&self, level: u32) -> Result<DataFileWriter> {
        let file_index = self.next_file_index.fetch_add(1, Ordering::AcqRel);
        DataFileWriter::create(&self.dir, &self.store_name, file_index, level)
    }

    /// Seals compaction output and adds it to the live set.
    ///
    /// Outputs take `generation`, the highest generation among the inputs, so
    /// data flushed after the compaction started still sorts as newer. The
    /// inputs stay live until `remove_files`, so readers following the index
    /// always find a file.
    pub fn add_compacted_files(
        &self,
        outputs: Vec<DataFileWriter>,
        generation: u64,
    ) -> Result<Vec<Arc<DataFileReader>>> {
        let mut sealed: Vec<Arc<DataFileReader>> = Vec::with_capacity(outputs.len());
        let mut outputs = outputs.into_iter();
        while let Some(writer) = outputs.next() {
            let path = writer.path().to_path_buf();
            let opened = writer
                .finish(generation, self.fsync)
                .and_then(|(path, _)| DataFileReader::open(&path, self.limits, self.retry));
            match opened {
                Ok(reader) => sealed.push(Arc::new(reader)),
                Err(e) => {
                    // Nothing is registered yet; drop every output of this run.
                    self.discard_file(&path);
                    for reader in &sealed {
                        reader.mark_obsolete();
                    }
                    for writer in outputs {
                        if let Err(abort) = writer.abort() {
                            warn!(
                                store = %self.store_name,
                                error = %abort,
                                "Failed to discard output"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        let _guard = self.file_set_lock.lock();
        self.files.rcu(|current| {
            let mut next = FileSet::clone(current);
            for output in &sealed {
                next.insert(output.file_index(), Arc::clone(output));
            }
            next
        });
        Ok(sealed)
    }

    /// Drops files from the live set and schedules them for deletion.
    pub fn remove_files(&self, files: &[Arc<DataFileReader>]) {
        let _guard = self.file_set_lock.lock();
        self.files.rcu(|current| {
            let mut next = FileSet::clone(current);
            for file in files {
                next.remove(&file.file_index());
            }
            next
        });
        for file in files {
            file.mark_obsolete();
        }
    }

    fn discard_file(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                store = %self.store_name,
                path = %path.display(),
                error = %e,
                "Failed to delete unsealed data file"
            ),
        }
    }

    /// Reads the item at a packed location.
    ///
    /// Returns None for the "no location" value and `FileNotFound` when the
    /// file is no longer live.
    pub fn read_data_item(&self, location: u64) -> Result<Option<Bytes>> {
        let Some(location) = DataLocation::from_u64(location) else {
            return Ok(None);
        };
        let reader = self
            .files
            .load()
            .get(&location.file_index)
            .cloned()
            .ok_or(VirtaError::FileNotFound {
                file_index: location.file_index,
            })?;
        reader.read_item(location.offset).map(Some)
    }

    /// Reads the item `index` points to for `key`.
    ///
    /// A concurrent compaction may move the item and delete its file between
    /// the index lookup and the read, so the lookup is retried a few times.
    pub fn read_data_item_using_index(
        &self,
        index: &dyn LongList,
        key: u64,
    ) -> Result<Option<Bytes>> {
        let mut last_missing = 0;
        for _ in 0..MAX_INDEX_READ_ATTEMPTS {
            let location = index.get(key)?;
            if location == NON_EXISTENT_LOCATION {
                return Ok(None);
            }
            match self.read_data_item(location) {
                Err(VirtaError::FileNotFound { file_index }) => last_missing = file_index,
                other => return other,
            }
        }
        Err(VirtaError::RetriesExhausted {
            attempts: MAX_INDEX_READ_ATTEMPTS as u32,
            reason: format!(
                "{} key {} points to missing file {}",
                self.store_name, key, last_missing
            ),
        })
    }

    /// Hard-links every live file into `target_dir`.
    pub fn snapshot(&self, target_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(target_dir)?;
        let files = self.files();
        for reader in files.values() {
            let target = target_dir.join(data_file_name(&self.store_name, reader.file_index()));
            std::fs::hard_link(reader.path(), &target)?;
        }
        debug!(
            store = %self.store_name,
            files = files.len(),
            target = %target_dir.display(),
            "Snapshot data files"
        );
        Ok(())
    }

    /// Stops writing; live files stay on disk.
    pub fn close(&self) -> Result<()> {
        if self.is_writing() {
            warn!(store = %self.store_name, "Closing collection with an unfinished flush file");
            self.abort_writing()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;
    use virta_collections::LongListHeap;

    fn config() -> MerkleDbConfig {
        MerkleDbConfig {
            fsync_enabled: false,
            ..Default::default()
        }
    }

    fn flush(collection: &DataFileCollection, items: &[&[u8]]) -> Vec<DataLocation> {
        collection.start_writing().unwrap();
        let locations = items
            .iter()
            .map(|i| collection.store_data_item(i).unwrap())
            .collect();
        collection.end_writing().unwrap();
        locations
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        let locations = flush(&collection, &[b"a", b"b"]);

        assert_eq!(collection.file_count(), 1);
        assert_eq!(
            collection.read_data_item(locations[1].as_u64()).unwrap(),
            Some(Bytes::from_static(b"b"))
        );
        assert_eq!(collection.read_data_item(NON_EXISTENT_LOCATION).unwrap(), None);
        assert!(matches!(
            collection.read_data_item(DataLocation::new(99, 48).as_u64()),
            Err(VirtaError::FileNotFound { file_index: 99 })
        ));
    }

    #[test]
    fn test_writing_state_errors() {
        let dir = tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        assert!(matches!(
            collection.store_data_item(b"x"),
            Err(VirtaError::NotWriting(_))
        ));
        assert!(matches!(collection.end_writing(), Err(VirtaError::NotWriting(_))));
        collection.start_writing().unwrap();
        assert!(matches!(
            collection.start_writing(),
            Err(VirtaError::AlreadyWriting(_))
        ));
        // Nothing stored: the file is dropped.
        assert!(collection.end_writing().unwrap().is_none());
        assert_eq!(collection.file_count(), 0);
    }

    #[test]
    fn test_flush_file_retried_after_transient_failure() {
        let dir = tempdir().unwrap();
        let config = MerkleDbConfig {
            io_retry_backoff_ms: 0,
            ..config()
        };
        let collection = DataFileCollection::open(dir.path(), "store", &config).unwrap();
        let mut attempts = 0;
        let (location, file) = collection
            .write_flush_file(|c| {
                attempts += 1;
                let location = c.store_data_item(b"retried")?;
                if attempts == 1 {
                    let interrupted = std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr");
                    return Err(interrupted.into());
                }
                Ok(location)
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert!(!collection.is_writing());
        assert_eq!(collection.file_count(), 1);
        assert_eq!(file.unwrap().file_index(), location.file_index);
        assert_eq!(
            collection.read_data_item(location.as_u64()).unwrap(),
            Some(Bytes::from_static(b"retried"))
        );
        // The file of the failed attempt is gone.
        let on_disk = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(on_disk, 1);
    }

    #[test]
    fn test_flush_file_permanent_failure_not_retried() {
        let dir = tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        let mut attempts = 0;
        let result: Result<((), _)> = collection.write_flush_file(|c| {
            attempts += 1;
            c.store_data_item(b"x")?;
            Err(VirtaError::invalid_parameter("item", "bad"))
        });
        assert!(matches!(result, Err(VirtaError::InvalidParameter { .. })));
        assert_eq!(attempts, 1);
        assert_eq!(collection.file_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_generations_increase() {
        let dir = tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        flush(&collection, &[b"1"]);
        flush(&collection, &[b"2"]);
        let ordered = collection.files_in_generation_order();
        assert_eq!(ordered.len(), 2);
        assert!(ordered[0].generation() < ordered[1].generation());
    }

    #[test]
    fn test_reopen_loads_sealed_and_drops_unsealed() {
        let dir = tempdir().unwrap();
        let location;
        {
            let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
            location = flush(&collection, &[b"persisted"])[0];
            collection.start_writing().unwrap();
            collection.store_data_item(b"lost").unwrap();
            // Simulated crash: the writer is dropped without sealing.
        }
        let unsealed = dir.path().join(data_file_name("store", 2));
        assert!(unsealed.exists());

        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        assert_eq!(collection.file_count(), 1);
        assert!(!unsealed.exists());
        assert_eq!(
            collection.read_data_item(location.as_u64()).unwrap(),
            Some(Bytes::from_static(b"persisted"))
        );

        // New files never reuse an index.
        let next = flush(&collection, &[b"new"])[0];
        assert_eq!(next.file_index, 3);
        let gens: Vec<_> = collection
            .files_in_generation_order()
            .iter()
            .map(|f| f.generation())
            .collect();
        assert_eq!(gens, vec![1, 2]);
    }

    #[test]
    fn test_other_stores_ignored() {
        let dir = tempdir().unwrap();
        let a = DataFileCollection::open(dir.path(), "a", &config()).unwrap();
        flush(&a, &[b"x"]);
        let b = DataFileCollection::open(dir.path(), "b", &config()).unwrap();
        assert_eq!(b.file_count(), 0);
    }

    #[test]
    fn test_read_using_index_follows_moves() {
        let dir = tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        let index = LongListHeap::new(16, 100, 0);
        index.update_valid_range(0, 99).unwrap();

        let old = flush(&collection, &[b"v1"])[0];
        index.put(7, old.as_u64()).unwrap();
        assert_eq!(
            collection.read_data_item_using_index(&index, 7).unwrap(),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(collection.read_data_item_using_index(&index, 8).unwrap(), None);

        // Dangling location never resolves.
        index.put(9, DataLocation::new(500, 48).as_u64()).unwrap();
        assert!(matches!(
            collection.read_data_item_using_index(&index, 9),
            Err(VirtaError::RetriesExhausted { .. })
        ));
    }

    #[test]
    fn test_compacted_files_swap() {
        let dir = tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        flush(&collection, &[b"1"]);
        flush(&collection, &[b"2"]);
        let inputs: Vec<_> = collection.files().values().cloned().collect();
        let held = Arc::clone(&inputs[0]);

        let mut out = collection.new_compaction_writer(1).unwrap();
        out.store_item(b"2").unwrap();
        let sealed = collection.add_compacted_files(vec![out], 2).unwrap();
        assert_eq!(collection.file_count(), 3);
        collection.remove_files(&inputs);
        drop(inputs);

        assert_eq!(collection.file_count(), 1);
        assert_eq!(sealed[0].level(), 1);
        assert_eq!(sealed[0].generation(), 2);
        assert!(held.is_obsolete());
        assert!(held.path().exists());
        let held_path = held.path().to_path_buf();
        drop(held);
        assert!(!held_path.exists());
    }

    #[test]
    fn test_snapshot_links_files() {
        let dir = tempdir().unwrap();
        let snap = tempdir().unwrap();
        let collection = DataFileCollection::open(dir.path(), "store", &config()).unwrap();
        let location = flush(&collection, &[b"snap"])[0];
        collection.snapshot(snap.path()).unwrap();

        let copy = DataFileCollection::open(snap.path(), "store", &config()).unwrap();
        assert_eq!(
            copy.read_data_item(location.as_u64()).unwrap(),
            Some(Bytes::from_static(b"snap"))
        );
    }

    #[test]
    fn test_concurrent_reads_during_flushes() {
        let dir = tempdir().unwrap();
        let collection =
            Arc::new(DataFileCollection::open(dir.path(), "store", &config()).unwrap());
        let first = flush(&collection, &[b"stable"])[0];
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let collection = Arc::clone(&collection);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    assert_eq!(
                        collection.read_data_item(first.as_u64()).unwrap(),
                        Some(Bytes::from_static(b"stable"))
                    );
                }
            })
        };
        for i in 0..20u32 {
            flush(&collection, &[&i.to_le_bytes()]);
        }
        stop.store(true, Ordering::Release);
        reader.join().unwrap();
        assert_eq!(collection.file_count(), 21);
    }
}
