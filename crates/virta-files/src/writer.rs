//! Data file writer for appending items.

use crate::constants::{DATA_FILE_HEADER_SIZE, ITEM_HEADER_SIZE, MAX_ITEM_SIZE};
use crate::header::{data_file_name, DataFileHeader};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use virta_common::location::{MAX_FILE_INDEX, MAX_OFFSET};
use virta_common::{DataLocation, Result, VirtaError};

/// Buffer size used while appending items.
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Appends items to a new data file.
///
/// The file starts with an unsealed header. `finish` rewrites the header
/// with the final generation and the sealed flag, after which the file is
/// immutable. A file left unsealed by a crash is discarded on the next open.
pub struct DataFileWriter {
    /// Path to the file.
    path: PathBuf,
    /// Buffered file handle.
    out: BufWriter<File>,
    /// Header written at the start of the file.
    header: DataFileHeader,
    /// Offset where the next item frame starts.
    write_offset: u64,
    /// Number of items written so far.
    item_count: u64,
}

impl DataFileWriter {
    /// Creates a new data file in `dir`.
    pub fn create(dir: &Path, store_name: &str, file_index: u32, level: u32) -> Result<Self> {
        if file_index > MAX_FILE_INDEX {
            return Err(VirtaError::invalid_parameter("file_index", file_index));
        }
        let path = dir.join(data_file_name(store_name, file_index));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let header = DataFileHeader::new(file_index, level);
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        out.write_all(&header.to_bytes())?;

        Ok(Self {
            path,
            out,
            header,
            write_offset: DATA_FILE_HEADER_SIZE as u64,
            item_count: 0,
        })
    }

    /// Returns the file index.
    pub fn file_index(&self) -> u32 {
        self.header.file_index
    }

    /// Returns the path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of bytes written so far.
    pub fn size(&self) -> u64 {
        self.write_offset
    }

    /// Returns the number of items written so far.
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Appends one item and returns its location.
    ///
    /// Frame layout: u32 payload length, u32 crc32 of the payload, payload.
    pub fn store_item(&mut self, payload: &[u8]) -> Result<DataLocation> {
        if payload.len() > MAX_ITEM_SIZE {
            return Err(VirtaError::invalid_parameter("item_size", payload.len()));
        }
        let frame_len = (ITEM_HEADER_SIZE + payload.len()) as u64;
        if self.write_offset + frame_len > MAX_OFFSET {
            return Err(VirtaError::IoError(format!(
                "data file {} exceeds addressable size",
                self.header.file_index
            )));
        }

        let location = DataLocation::new(self.header.file_index, self.write_offset);
        let mut frame = [0u8; ITEM_HEADER_SIZE];
        frame[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        frame[4..8].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
        self.out.write_all(&frame)?;
        self.out.write_all(payload)?;

        self.write_offset += frame_len;
        self.item_count += 1;
        Ok(location)
    }

    /// Seals the file with `generation` and returns its final header.
    pub fn finish(mut self, generation: u64, fsync: bool) -> Result<(PathBuf, DataFileHeader)> {
        self.out.flush()?;
        self.header.seal(generation, self.item_count);

        let file = self.out.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.header.to_bytes())?;
        if fsync {
            file.sync_all()?;
        }

        debug!(
            file_index = self.header.file_index,
            level = self.header.compaction_level,
            generation,
            items = self.item_count,
            bytes = self.write_offset,
            "Sealed data file"
        );
        Ok((self.path, self.header))
    }

    /// Discards the partially written file.
    pub fn abort(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.out);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DATA_FILE_HEADER_SIZE;
    use tempfile::tempdir;

    #[test]
    fn test_store_and_finish() {
        let dir = tempdir().unwrap();
        let mut writer = DataFileWriter::create(dir.path(), "store", 3, 0).unwrap();

        let first = writer.store_item(b"hello").unwrap();
        let second = writer.store_item(b"world!").unwrap();
        assert_eq!(first, DataLocation::new(3, DATA_FILE_HEADER_SIZE as u64));
        assert_eq!(
            second.offset,
            (DATA_FILE_HEADER_SIZE + ITEM_HEADER_SIZE + 5) as u64
        );
        assert_eq!(writer.item_count(), 2);

        let (path, header) = writer.finish(9, true).unwrap();
        assert!(header.is_sealed());
        assert_eq!(header.generation, 9);
        assert_eq!(header.item_count, 2);

        let bytes = std::fs::read(&path).unwrap();
        let mut head = [0u8; DATA_FILE_HEADER_SIZE];
        head.copy_from_slice(&bytes[..DATA_FILE_HEADER_SIZE]);
        let on_disk = DataFileHeader::from_bytes(&head);
        on_disk.validate().unwrap();
        assert_eq!(on_disk, header);
        assert_eq!(
            bytes.len(),
            DATA_FILE_HEADER_SIZE + 2 * ITEM_HEADER_SIZE + 11
        );
    }

    #[test]
    fn test_unfinished_file_is_unsealed() {
        let dir = tempdir().unwrap();
        let mut writer = DataFileWriter::create(dir.path(), "store", 1, 0).unwrap();
        writer.store_item(b"x").unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        let mut head = [0u8; DATA_FILE_HEADER_SIZE];
        head.copy_from_slice(&bytes[..DATA_FILE_HEADER_SIZE]);
        assert!(!DataFileHeader::from_bytes(&head).is_sealed());
    }

    #[test]
    fn test_abort_removes_file() {
        let dir = tempdir().unwrap();
        let mut writer = DataFileWriter::create(dir.path(), "store", 1, 0).unwrap();
        writer.store_item(b"x").unwrap();
        let path = writer.path().to_path_buf();
        writer.abort().unwrap();
        assert!(!path.exists());
    }
}
