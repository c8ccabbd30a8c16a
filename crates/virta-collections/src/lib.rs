//! Index collections for VirtaDB.
//!
//! This crate provides the in-memory and file-backed structures that map
//! dense indexes to data:
//! - Long lists from bucket numbers or tree paths to packed data locations
//! - Chunked RAM storage that releases memory outside the valid range
//! - A RAM list of node hashes for the low tiers of the tree

mod hash_list;
mod long_list;
mod long_list_disk;
mod long_list_heap;

pub use hash_list::HashListRam;
pub use long_list::{LongList, IMPERMISSIBLE_VALUE, LONG_LIST_FILE_VERSION};
pub use long_list_disk::LongListDisk;
pub use long_list_heap::LongListHeap;
