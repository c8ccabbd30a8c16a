//! VirtaDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all VirtaDB components.

pub mod config;
pub mod error;
pub mod executor;
pub mod hash;
pub mod location;

pub use config::MerkleDbConfig;
pub use error::{Result, VirtaError};
pub use executor::{RayonExecutor, Task, TaskExecutor};
pub use hash::{key_hash_code, Hash, HASH_SIZE};
pub use location::{DataLocation, NON_EXISTENT_LOCATION};
