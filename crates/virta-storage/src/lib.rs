//! Storage engine for VirtaDB.
//!
//! This crate provides:
//! - Bucket pages and per-bucket mutation chains
//! - The half-disk hash map from keys to `u64` values
//! - Node hash storage tiered between RAM and disk
//! - Tree path arithmetic for the virtual Merkle tree
//! - The virtual map tying the stores together behind one key/value API

mod bucket;
mod cache;
mod hash_store;
mod hashmap;
mod map;
mod mutation;
mod path;
mod record;

pub use bucket::{
    bucket_for_hash, Bucket, BucketEntry, BucketView, BUCKET_HEADER_SIZE, ENTRY_HEADER_SIZE,
};
pub use cache::LeafCache;
pub use hash_store::{HashStore, HASHES_RAM_FILE_NAME, HASHES_STORE_NAME};
pub use hashmap::{
    initial_bucket_count, metadata_file_name, FlushSummary, HalfDiskHashMap, PreparedFlush,
    GOOD_AVERAGE_BUCKET_ENTRY_COUNT, MAX_BUCKET_COUNT,
};
pub use map::{
    MapSnapshot, VirtualMap, KEY_TO_PATH_STORE_NAME, LEAVES_STORE_NAME, MAP_METADATA_FILE_NAME,
};
pub use mutation::{BucketMutation, MutationNode};
pub use path::{
    left_child, parent, path_capacity, plan_add, plan_remove, right_child, AddPlan, LeafRange,
    RemovePlan, MAX_LEAF_COUNT, ROOT_PATH, SINGLE_LEAF_PATH,
};
pub use record::LeafRecord;
