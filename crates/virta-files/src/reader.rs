//! Data file reader for random access and sequential scans.

use crate::constants::{DATA_FILE_HEADER_SIZE, ITEM_HEADER_SIZE, MAX_ITEM_SIZE};
use crate::header::DataFileHeader;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use virta_common::{DataLocation, Result, VirtaError};

/// Limits on open file handles for one reader.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    /// Maximum open file handles.
    pub max_channels: usize,
    /// Concurrent readers per handle before another handle is opened.
    pub max_threads_per_channel: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_channels: 8,
            max_threads_per_channel: 8,
        }
    }
}

/// One open file handle and the number of readers using it.
struct Channel {
    file: Mutex<File>,
    users: AtomicUsize,
}

/// Releases a channel reservation when dropped.
struct ChannelLease {
    channel: Arc<Channel>,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.channel.users.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reads items from one sealed data file.
///
/// Readers are shared through `Arc`. When a compaction makes the file
/// redundant it is marked obsolete, and the file is deleted once the last
/// `Arc` is dropped, so in-flight reads always complete.
pub struct DataFileReader {
    /// Path to the file.
    path: PathBuf,
    /// Validated file header.
    header: DataFileHeader,
    /// Total file length.
    file_size: u64,
    /// Open file handles.
    channels: RwLock<Vec<Arc<Channel>>>,
    /// Handle limits.
    limits: ChannelLimits,
    /// Retry budget for transient read errors.
    retry: RetryPolicy,
    /// Delete the file on drop.
    obsolete: AtomicBool,
}

impl DataFileReader {
    /// Opens a data file and validates its header.
    pub fn open(path: &Path, limits: ChannelLimits, retry: RetryPolicy) -> Result<Self> {
        let mut file = File::open(path)?;
        let header = Self::read_header(&mut file)?;
        let file_size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            header,
            file_size,
            channels: RwLock::new(vec![Arc::new(Channel {
                file: Mutex::new(file),
                users: AtomicUsize::new(0),
            })]),
            limits,
            retry,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Reads and validates the header of an open data file.
    pub fn read_header(file: &mut File) -> Result<DataFileHeader> {
        let mut buf = [0u8; DATA_FILE_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => VirtaError::Corrupted {
                location: "header".to_string(),
                reason: "file shorter than header".to_string(),
            },
            _ => e.into(),
        })?;
        let header = DataFileHeader::from_bytes(&buf);
        header.validate()?;
        Ok(header)
    }

    /// Returns the file header.
    pub fn header(&self) -> &DataFileHeader {
        &self.header
    }

    /// Returns the file index.
    pub fn file_index(&self) -> u32 {
        self.header.file_index
    }

    /// Returns the compaction level.
    pub fn level(&self) -> u32 {
        self.header.compaction_level
    }

    /// Returns the generation.
    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    /// Returns true if the file is complete.
    pub fn is_completed(&self) -> bool {
        self.header.is_sealed()
    }

    /// Returns the path to the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Returns the number of open file handles.
    pub fn open_channels(&self) -> usize {
        self.channels.read().len()
    }

    /// Schedules the file for deletion once no reader holds it.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Returns true if the file is scheduled for deletion.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Picks the least used handle, opening another one when all are busy.
    fn lease_channel(&self) -> Result<ChannelLease> {
        {
            let channels = self.channels.read();
            if let Some(channel) = least_used(&channels) {
                let users = channel.users.load(Ordering::Acquire);
                if users < self.limits.max_threads_per_channel
                    || channels.len() >= self.limits.max_channels
                {
                    channel.users.fetch_add(1, Ordering::AcqRel);
                    return Ok(ChannelLease {
                        channel: Arc::clone(channel),
                    });
                }
            }
        }

        let mut channels = self.channels.write();
        let channel = if channels.len() < self.limits.max_channels {
            let channel = Arc::new(Channel {
                file: Mutex::new(File::open(&self.path)?),
                users: AtomicUsize::new(0),
            });
            channels.push(Arc::clone(&channel));
            debug!(
                file_index = self.header.file_index,
                channels = channels.len(),
                "Opened additional file channel"
            );
            channel
        } else {
            least_used(&channels)
                .cloned()
                .ok_or_else(|| VirtaError::Internal("reader has no channels".to_string()))?
        };
        channel.users.fetch_add(1, Ordering::AcqRel);
        Ok(ChannelLease { channel })
    }

    /// Reads the item at `offset`, verifying its checksum.
    pub fn read_item(&self, offset: u64) -> Result<Bytes> {
        if offset < DATA_FILE_HEADER_SIZE as u64
            || offset + ITEM_HEADER_SIZE as u64 > self.file_size
        {
            return Err(VirtaError::Corrupted {
                location: DataLocation::new(self.header.file_index, offset).to_string(),
                reason: format!("offset outside file of {} bytes", self.file_size),
            });
        }
        let lease = self.lease_channel()?;
        let (len, crc, payload) = self.retry.run("read data item", || {
            let mut file = lease.channel.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            let mut frame = [0u8; ITEM_HEADER_SIZE];
            file.read_exact(&mut frame)?;
            let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
            let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            if len > MAX_ITEM_SIZE || offset + (ITEM_HEADER_SIZE + len) as u64 > self.file_size {
                return Ok((len, crc, Vec::new()));
            }
            let mut payload = vec![0u8; len];
            file.read_exact(&mut payload)?;
            Ok((len, crc, payload))
        })?;

        let location = || DataLocation::new(self.header.file_index, offset).to_string();
        if payload.len() != len {
            return Err(VirtaError::Corrupted {
                location: location(),
                reason: format!("item length {} runs past end of file", len),
            });
        }
        if crc32fast::hash(&payload) != crc {
            warn!(file_index = self.header.file_index, offset, "Data item checksum mismatch");
            return Err(VirtaError::Corrupted {
                location: location(),
                reason: "checksum mismatch".to_string(),
            });
        }
        Ok(Bytes::from(payload))
    }

    /// Returns a sequential iterator over all items in the file.
    pub fn iter(&self, buffer_size: usize) -> Result<DataFileIterator> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(DATA_FILE_HEADER_SIZE as u64))?;
        Ok(DataFileIterator {
            input: BufReader::with_capacity(buffer_size.max(ITEM_HEADER_SIZE), file),
            file_index: self.header.file_index,
            offset: DATA_FILE_HEADER_SIZE as u64,
            remaining: self.header.item_count,
        })
    }
}

fn least_used(channels: &[Arc<Channel>]) -> Option<&Arc<Channel>> {
    channels
        .iter()
        .min_by_key(|c| c.users.load(Ordering::Acquire))
}

impl Drop for DataFileReader {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        self.channels.write().clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Deleted obsolete data file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to delete obsolete data file"
            ),
        }
    }
}

impl std::fmt::Debug for DataFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileReader")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

/// An item read during a sequential scan.
#[derive(Debug, Clone)]
pub struct DataItem {
    /// Location of the item.
    pub location: DataLocation,
    /// Item payload.
    pub payload: Bytes,
}

/// Sequential iterator over the items of one data file.
pub struct DataFileIterator {
    input: BufReader<File>,
    file_index: u32,
    offset: u64,
    remaining: u64,
}

impl DataFileIterator {
    fn read_next(&mut self) -> Result<DataItem> {
        let location = DataLocation::new(self.file_index, self.offset);
        let mut frame = [0u8; ITEM_HEADER_SIZE];
        self.input.read_exact(&mut frame)?;
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len > MAX_ITEM_SIZE {
            return Err(VirtaError::Corrupted {
                location: location.to_string(),
                reason: format!("item length {} too large", len),
            });
        }
        let mut payload = vec![0u8; len];
        self.input.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(VirtaError::Corrupted {
                location: location.to_string(),
                reason: "checksum mismatch".to_string(),
            });
        }
        self.offset += (ITEM_HEADER_SIZE + len) as u64;
        Ok(DataItem {
            location,
            payload: Bytes::from(payload),
        })
    }
}

impl Iterator for DataFileIterator {
    type Item = Result<DataItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.read_next() {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DataFileWriter;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, items: &[&[u8]]) -> (PathBuf, Vec<DataLocation>) {
        let mut writer = DataFileWriter::create(dir, "test", 1, 0).unwrap();
        let locations = items.iter().map(|i| writer.store_item(i).unwrap()).collect();
        let (path, _) = writer.finish(1, false).unwrap();
        (path, locations)
    }

    #[test]
    fn test_read_items() {
        let dir = tempdir().unwrap();
        let (path, locations) = write_file(dir.path(), &[b"alpha", b"", b"gamma"]);
        let reader = DataFileReader::open(&path, ChannelLimits::default(), RetryPolicy::default()).unwrap();

        assert!(reader.is_completed());
        assert_eq!(reader.file_index(), 1);
        assert_eq!(reader.read_item(locations[0].offset).unwrap(), Bytes::from_static(b"alpha"));
        assert_eq!(reader.read_item(locations[1].offset).unwrap(), Bytes::new());
        assert_eq!(reader.read_item(locations[2].offset).unwrap(), Bytes::from_static(b"gamma"));
    }

    #[test]
    fn test_iterate_items() {
        let dir = tempdir().unwrap();
        let (path, locations) = write_file(dir.path(), &[b"one", b"two", b"three"]);
        let reader = DataFileReader::open(&path, ChannelLimits::default(), RetryPolicy::default()).unwrap();

        let items: Vec<_> = reader.iter(16).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].payload, Bytes::from_static(b"three"));
        let scanned: Vec<_> = items.iter().map(|i| i.location).collect();
        assert_eq!(scanned, locations);
    }

    #[test]
    fn test_corrupted_item_detected() {
        let dir = tempdir().unwrap();
        let (path, locations) = write_file(dir.path(), &[b"payload-bytes"]);

        let mut bytes = std::fs::read(&path).unwrap();
        let flip = locations[0].offset as usize + ITEM_HEADER_SIZE + 3;
        bytes[flip] ^= 0xFF;
        std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

        let reader = DataFileReader::open(&path, ChannelLimits::default(), RetryPolicy::default()).unwrap();
        let err = reader.read_item(locations[0].offset).unwrap_err();
        assert!(matches!(err, VirtaError::Corrupted { .. }));

        let scanned: Vec<_> = reader.iter(64).unwrap().collect();
        assert!(scanned[0].is_err());
    }

    #[test]
    fn test_bad_offset_rejected() {
        let dir = tempdir().unwrap();
        let (path, _) = write_file(dir.path(), &[b"x"]);
        let reader = DataFileReader::open(&path, ChannelLimits::default(), RetryPolicy::default()).unwrap();
        assert!(reader.read_item(0).is_err());
        assert!(reader.read_item(reader.size() + 10).is_err());
    }

    #[test]
    fn test_channels_grow_under_load() {
        let dir = tempdir().unwrap();
        let (path, locations) = write_file(dir.path(), &[b"shared"]);
        let limits = ChannelLimits {
            max_channels: 3,
            max_threads_per_channel: 1,
        };
        let reader = Arc::new(DataFileReader::open(&path, limits, RetryPolicy::default()).unwrap());

        let leases: Vec<_> = (0..5).map(|_| reader.lease_channel().unwrap()).collect();
        assert_eq!(reader.open_channels(), 3);
        drop(leases);

        let offset = locations[0].offset;
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(reader.read_item(offset).unwrap(), Bytes::from_static(b"shared"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(reader.open_channels() <= 3);
    }

    #[test]
    fn test_obsolete_file_deleted_after_last_reader() {
        let dir = tempdir().unwrap();
        let (path, locations) = write_file(dir.path(), &[b"keep"]);
        let reader = Arc::new(DataFileReader::open(&path, ChannelLimits::default(), RetryPolicy::default()).unwrap());
        let in_flight = Arc::clone(&reader);

        reader.mark_obsolete();
        drop(reader);
        assert!(path.exists());
        assert_eq!(in_flight.read_item(locations[0].offset).unwrap(), Bytes::from_static(b"keep"));

        drop(in_flight);
        assert!(!path.exists());
    }
}
