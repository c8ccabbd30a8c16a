//! SHA-384 hashing for keys and Merkle nodes.

use crate::error::{Result, VirtaError};
use sha2::{Digest, Sha384};
use std::fmt;

/// Size of a SHA-384 digest in bytes.
pub const HASH_SIZE: usize = 48;

/// Domain prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain prefix for internal node hashes.
const INTERNAL_PREFIX: u8 = 0x01;

/// A 48-byte SHA-384 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Wraps raw digest bytes.
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Copies a digest out of a slice of exactly `HASH_SIZE` bytes.
    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        let bytes: [u8; HASH_SIZE] = buf.try_into().map_err(|_| {
            VirtaError::DecodeError(format!(
                "hash must be {} bytes, got {}",
                HASH_SIZE,
                buf.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Hash of an empty map, SHA-384 of the empty input.
    pub fn empty() -> Self {
        Self(Sha384::digest([]).into())
    }

    /// Hashes a leaf record.
    ///
    /// Layout hashed: prefix 0x00, u32 LE key length, key, u32 LE value
    /// length, value.
    pub fn of_leaf(key: &[u8], value: &[u8]) -> Self {
        let mut hasher = Sha384::new();
        hasher.update([LEAF_PREFIX]);
        hasher.update((key.len() as u32).to_le_bytes());
        hasher.update(key);
        hasher.update((value.len() as u32).to_le_bytes());
        hasher.update(value);
        Self(hasher.finalize().into())
    }

    /// Hashes an internal node from its children. A node with a single
    /// child hashes only the left digest.
    pub fn of_internal(left: &Hash, right: Option<&Hash>) -> Self {
        let mut hasher = Sha384::new();
        hasher.update([INTERNAL_PREFIX]);
        hasher.update(left.0);
        if let Some(right) = right {
            hasher.update(right.0);
        }
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

/// Computes the 64-bit hash code used for bucket placement.
///
/// Taken from the first 8 bytes (little-endian) of SHA-384 over the key, so
/// placement is stable across processes and platforms.
pub fn key_hash_code(key: &[u8]) -> u64 {
    let digest = Sha384::digest(key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
