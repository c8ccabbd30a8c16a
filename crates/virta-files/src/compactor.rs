//! Index-driven compaction of data files.
//!
//! ## Algorithm
//! - Files are grouped by compaction level; flush files start at level 0
//! - Trigger: at least `min_number_of_files_in_compaction` live files
//! - The lowest level holding that many files is merged into one level
//!   higher. When no single level does, every live file is merged into one
//!   level above the highest input. Output levels are capped at
//!   `max_compaction_level`
//! - Only items the index still points to are copied, so superseded items
//!   are dropped; outputs roll over at `max_data_file_size_bytes`
//! - Transient I/O failures restart the output files from scratch; any other
//!   failure leaves the inputs and the index untouched
//!
//! The index is updated with `put_if_equal`, so a flush that moves a key
//! while the compaction runs always wins.

use crate::collection::DataFileCollection;
use crate::reader::DataFileReader;
use crate::writer::DataFileWriter;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use virta_collections::LongList;
use virta_common::{DataLocation, MerkleDbConfig, Result, TaskExecutor, VirtaError};

/// Outcome of one compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Level the inputs came from.
    pub input_level: u32,
    /// Level of the output files.
    pub output_level: u32,
    /// Number of files merged.
    pub input_files: usize,
    /// Number of files written.
    pub output_files: usize,
    /// Number of distinct items copied.
    pub items_copied: u64,
    /// Number of index entries moved to the output.
    pub index_updates: u64,
}

/// Merges the data files of one store.
pub struct Compactor {
    /// Files being compacted.
    collection: Arc<DataFileCollection>,
    /// Index from key to packed data location.
    index: Arc<dyn LongList>,
    /// Files per level that trigger a compaction.
    min_files: usize,
    /// Highest level.
    max_level: u32,
    /// Output rollover size.
    max_file_size: u64,
    /// Set while a compaction is running.
    running: AtomicBool,
    /// Held for the duration of a compaction.
    run_lock: Mutex<()>,
}

/// Clears the running flag when dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Compactor {
    /// Creates a compactor for `collection` driven by `index`.
    pub fn new(
        collection: Arc<DataFileCollection>,
        index: Arc<dyn LongList>,
        config: &MerkleDbConfig,
    ) -> Self {
        Self {
            collection,
            index,
            min_files: config.min_number_of_files_in_compaction,
            max_level: config.max_compaction_level,
            max_file_size: config.max_data_file_size_bytes,
            running: AtomicBool::new(false),
            run_lock: Mutex::new(()),
        }
    }

    /// Returns true while a compaction is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Picks the files of the next compaction and the level they come from.
    ///
    /// Prefers the lowest level holding enough files on its own. Otherwise,
    /// once enough files are live in total, takes all of them; the level
    /// returned is then the highest among them.
    pub fn select_candidates(&self) -> Option<(u32, Vec<Arc<DataFileReader>>)> {
        let levels = self.collection.files_by_level();
        let full_level = levels
            .iter()
            .find(|(_, files)| files.len() >= self.min_files);
        if let Some((level, files)) = full_level {
            return Some((*level, files.clone()));
        }
        let total: usize = levels.values().map(Vec::len).sum();
        if total < self.min_files {
            return None;
        }
        let highest = levels.keys().next_back().copied().unwrap_or(0);
        Some((highest, levels.into_values().flatten().collect()))
    }

    /// Returns true if enough files are live to compact.
    pub fn should_compact(&self) -> bool {
        self.select_candidates().is_some()
    }

    /// Runs one compaction if enough files are live.
    ///
    /// Waits for a running compaction first, then returns None when nothing
    /// is due any more.
    pub fn compact(&self) -> Result<Option<CompactionSummary>> {
        let _run = self.run_lock.lock();
        self.running.store(true, Ordering::Release);
        let _guard = RunningGuard(&self.running);
        let Some((level, files)) = self.select_candidates() else {
            return Ok(None);
        };
        let output_level = (level + 1).min(self.max_level);
        self.compact_files(level, output_level, &files).map(Some)
    }

    /// Merges every completed file into one level, regardless of counts.
    ///
    /// Waits for a running background compaction instead of skipping.
    pub fn compact_all(&self) -> Result<Option<CompactionSummary>> {
        let _run = self.run_lock.lock();
        self.running.store(true, Ordering::Release);
        let _guard = RunningGuard(&self.running);
        let levels = self.collection.files_by_level();
        let files: Vec<_> = levels.values().flatten().cloned().collect();
        if files.len() < 2 {
            return Ok(None);
        }
        let input_level = levels.keys().next_back().copied().unwrap_or(0);
        let output_level = (input_level + 1).min(self.max_level);
        self.compact_files(input_level, output_level, &files).map(Some)
    }

    /// Submits a compaction to `executor` when one is due.
    pub fn schedule(self: &Arc<Self>, executor: &dyn TaskExecutor) {
        if self.is_running() || !self.should_compact() {
            return;
        }
        let compactor = Arc::clone(self);
        executor.submit(Box::new(move || {
            if let Err(e) = compactor.compact() {
                warn!(
                    store = compactor.collection.store_name(),
                    error = %e,
                    "Background compaction failed"
                );
            }
        }));
    }

    /// Blocks until a running compaction finishes.
    pub fn wait_idle(&self) {
        drop(self.run_lock.lock());
    }

    /// Holds off compactions until the returned guard is dropped.
    pub fn suspend(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock()
    }

    fn compact_files(
        &self,
        input_level: u32,
        output_level: u32,
        files: &[Arc<DataFileReader>],
    ) -> Result<CompactionSummary> {
        let store = self.collection.store_name().to_string();
        info!(
            store = %store,
            input_level,
            output_level,
            files = files.len(),
            "Starting compaction"
        );

        let what = format!("compact {}", store);
        let written = self
            .collection
            .retry_policy()
            .run(&what, || self.write_outputs(files, output_level));
        let (moves, items_copied, output_files) = match written {
            Ok(written) => written,
            Err(e) => {
                warn!(store = %store, error = %e, "Compaction aborted, inputs left untouched");
                return Err(e);
            }
        };

        let mut index_updates = 0;
        for (key, old, new) in moves {
            if self.index.put_if_equal(key, old, new)? {
                index_updates += 1;
            }
        }
        self.collection.remove_files(files);

        let summary = CompactionSummary {
            input_level,
            output_level,
            input_files: files.len(),
            output_files,
            items_copied,
            index_updates,
        };
        info!(
            store = %store,
            input_files = summary.input_files,
            output_files = summary.output_files,
            items = summary.items_copied,
            "Finished compaction"
        );
        Ok(summary)
    }

    /// Copies the live items of `files` into new sealed files registered at
    /// the highest input generation. Returns the index moves, the number of
    /// items copied and the number of output files.
    ///
    /// On failure every output of this attempt is deleted and nothing is
    /// registered.
    #[allow(clippy::type_complexity)]
    fn write_outputs(
        &self,
        files: &[Arc<DataFileReader>],
        output_level: u32,
    ) -> Result<(Vec<(u64, u64, u64)>, u64, usize)> {
        let mut outputs: Vec<DataFileWriter> = Vec::new();
        let copied = self.copy_live_items(files, output_level, &mut outputs);
        let (moves, items_copied) = match copied {
            Ok(copied) => copied,
            Err(e) => {
                for writer in outputs {
                    if let Err(cleanup) = writer.abort() {
                        warn!(
                            store = self.collection.store_name(),
                            error = %cleanup,
                            "Failed to delete partial compaction output"
                        );
                    }
                }
                return Err(e);
            }
        };
        let generation = files.iter().map(|f| f.generation()).max().unwrap_or(0);
        let sealed = self.collection.add_compacted_files(outputs, generation)?;
        Ok((moves, items_copied, sealed.len()))
    }

    /// Copies every item the index still references in `files` into new
    /// output files. Returns the index moves to apply and the item count.
    #[allow(clippy::type_complexity)]
    fn copy_live_items(
        &self,
        files: &[Arc<DataFileReader>],
        output_level: u32,
        outputs: &mut Vec<DataFileWriter>,
    ) -> Result<(Vec<(u64, u64, u64)>, u64)> {
        let by_index: HashMap<u32, &Arc<DataFileReader>> =
            files.iter().map(|f| (f.file_index(), f)).collect();
        let candidates: HashSet<u32> = by_index.keys().copied().collect();
        let key_range = self.collection.valid_key_range();

        let mut moved: HashMap<u64, u64> = HashMap::new();
        let mut moves = Vec::new();
        self.index.for_each(&mut |key, location| {
            let file_index = DataLocation::file_index_of(location);
            if !candidates.contains(&file_index) {
                return Ok(());
            }
            if let Some((min, max)) = key_range {
                if key < min || key > max {
                    return Ok(());
                }
            }
            let new_location = match moved.get(&location) {
                Some(new_location) => *new_location,
                None => {
                    let reader = by_index.get(&file_index).ok_or_else(|| {
                        VirtaError::Internal(format!("candidate file {} vanished", file_index))
                    })?;
                    let offset = DataLocation::from_u64(location).map_or(0, |l| l.offset);
                    let payload = reader.read_item(offset)?;
                    let writer = self.output_writer(outputs, output_level)?;
                    let new_location = writer.store_item(&payload)?.as_u64();
                    moved.insert(location, new_location);
                    new_location
                }
            };
            moves.push((key, location, new_location));
            Ok(())
        })?;

        debug!(
            store = self.collection.store_name(),
            items = moved.len(),
            keys = moves.len(),
            "Copied live items"
        );
        Ok((moves, moved.len() as u64))
    }

    /// Returns the current output writer, rolling over to a new file when
    /// the current one is full.
    fn output_writer<'a>(
        &self,
        outputs: &'a mut Vec<DataFileWriter>,
        level: u32,
    ) -> Result<&'a mut DataFileWriter> {
        let full = outputs
            .last()
            .map_or(true, |w| w.size() >= self.max_file_size);
        if full {
            outputs.push(self.collection.new_compaction_writer(level)?);
        }
        outputs
            .last_mut()
            .ok_or_else(|| VirtaError::Internal("no compaction output".to_string()))
    }
}
