//! Append-only data files for Virta.
//!
//! Items are appended to immutable, sealed data files. A collection tracks
//! the live files of one store, a long index maps keys to item locations,
//! and the compactor merges files so superseded items are reclaimed.

pub mod collection;
pub mod compactor;
pub mod constants;
pub mod header;
pub mod kv_store;
pub mod reader;
pub mod retry;
pub mod writer;

pub use collection::{DataFileCollection, FileSet};
pub use compactor::{CompactionSummary, Compactor};
pub use header::{data_file_name, DataFileHeader};
pub use kv_store::{index_file_name, open_index, DiskKeyValueStore};
pub use reader::{ChannelLimits, DataFileIterator, DataFileReader, DataItem};
pub use retry::RetryPolicy;
pub use writer::DataFileWriter;
