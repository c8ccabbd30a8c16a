//! Pending writes for one bucket.

use bytes::Bytes;

/// One pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationNode {
    /// Serialized key.
    pub key: Bytes,
    /// Key hash code.
    pub hash: u64,
    /// Value the key must hold on disk for the write to apply; None for an
    /// unconditional write.
    pub expected_old: Option<u64>,
    /// New value; None deletes the key.
    pub new_value: Option<u64>,
}

/// Writes to one bucket not yet flushed to disk.
///
/// Each key has at most one node. Nodes keep the order in which their keys
/// were first written, so a flush replays them deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketMutation {
    nodes: Vec<MutationNode>,
}

impl BucketMutation {
    /// Creates an empty mutation chain.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &[u8], hash: u64) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.hash == hash && n.key.as_ref() == key)
    }

    /// Records a write of `value` for `key`.
    ///
    /// An existing node is updated in place and keeps its original
    /// expected value.
    pub fn put(&mut self, key: Bytes, hash: u64, value: Option<u64>) {
        match self.position(&key, hash) {
            Some(pos) => self.nodes[pos].new_value = value,
            None => self.nodes.push(MutationNode {
                key,
                hash,
                expected_old: None,
                new_value: value,
            }),
        }
    }

    /// Records a write of `value` if `key` currently holds `expected`.
    ///
    /// With a node present the check runs against the node's pending value
    /// and a mismatch leaves the chain unchanged. Without one the write is
    /// appended and checked against the page at flush time.
    pub fn put_if_equal(
        &mut self,
        key: Bytes,
        hash: u64,
        expected: u64,
        value: Option<u64>,
    ) -> bool {
        match self.position(&key, hash) {
            Some(pos) => {
                let node = &mut self.nodes[pos];
                if node.new_value != Some(expected) {
                    return false;
                }
                node.new_value = value;
                true
            }
            None => {
                self.nodes.push(MutationNode {
                    key,
                    hash,
                    expected_old: Some(expected),
                    new_value: value,
                });
                true
            }
        }
    }

    /// Returns the pending value for `key`: None when the key has no node,
    /// `Some(None)` when it is pending deletion.
    pub fn get(&self, key: &[u8], hash: u64) -> Option<Option<u64>> {
        self.position(key, hash).map(|pos| self.nodes[pos].new_value)
    }

    /// Visits every node in insertion order with
    /// `(key, hash, expected_old, new_value)`.
    pub fn for_each_key_value(
        &self,
        mut visit: impl FnMut(&[u8], u64, Option<u64>, Option<u64>),
    ) {
        for node in &self.nodes {
            visit(&node.key, node.hash, node.expected_old, node.new_value);
        }
    }

    /// Number of distinct pending keys.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Takes the nodes out, in insertion order.
    pub fn into_nodes(self) -> Vec<MutationNode> {
        self.nodes
    }

    /// Appends a node taken from another chain.
    ///
    /// The caller guarantees the key has no node here yet.
    pub fn push_node(&mut self, node: MutationNode) {
        debug_assert!(self.position(&node.key, node.hash).is_none());
        self.nodes.push(node);
    }
}
