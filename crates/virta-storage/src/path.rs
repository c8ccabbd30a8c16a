//! Tree paths and leaf placement.
//!
//! Nodes of the binary tree are numbered breadth first: the root is path 0
//! and the children of `p` are `2p + 1` and `2p + 2`. With `n >= 2` leaves
//! the leaves occupy the contiguous range `[n - 1, 2n - 2]`. A single leaf
//! sits at path 1, the left child of the root.
//!
//! ```text
//!             0
//!        1         2
//!     3     4   5     6      leaves of a 4-leaf tree: [3, 6]
//! ```
//!
//! Adding or removing a leaf moves at most two existing leaves, so the
//! range stays contiguous.

/// Path of the root node.
pub const ROOT_PATH: u64 = 0;

/// Path of the only leaf of a one-leaf tree.
pub const SINGLE_LEAF_PATH: u64 = 1;

/// Most leaves a tree can hold. Adding beyond it is rejected.
pub const MAX_LEAF_COUNT: u64 = 1 << 38;

pub fn left_child(path: u64) -> u64 {
    path * 2 + 1
}

pub fn right_child(path: u64) -> u64 {
    path * 2 + 2
}

/// Returns the parent of `path`, or None for the root.
pub fn parent(path: u64) -> Option<u64> {
    match path {
        ROOT_PATH => None,
        p => Some((p - 1) / 2),
    }
}

/// Number of paths of a tree holding `leaf_count` leaves.
///
/// Stores indexed by path size their lists with this bound; storage is only
/// allocated for paths actually written.
pub fn path_capacity(leaf_count: u64) -> u64 {
    leaf_count.saturating_mul(2).saturating_sub(1).max(2)
}

/// Inclusive range of leaf paths of a non-empty tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRange {
    pub first: u64,
    pub last: u64,
}

impl LeafRange {
    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    /// Returns true if `path` is a leaf path.
    pub fn contains(&self, path: u64) -> bool {
        path >= self.first && path <= self.last
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> u64 {
        if self.first == self.last {
            1
        } else {
            self.last - self.first + 1
        }
    }

    /// Returns true if `path` is an internal node of this tree.
    pub fn is_internal(&self, path: u64) -> bool {
        path < self.first
    }
}

/// Where a new leaf goes and which existing leaf makes room for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddPlan {
    /// Path of the new leaf.
    pub new_path: u64,
    /// Existing leaf moved down, as `(from, to)`.
    pub moved: Option<(u64, u64)>,
    /// Leaf range after the add.
    pub range: LeafRange,
}

/// Plans adding one leaf to a tree with leaf range `range`.
///
/// The leaf at `first` moves to its left child and the new leaf takes the
/// right child, except when growing from one leaf to two.
pub fn plan_add(range: Option<LeafRange>) -> AddPlan {
    match range {
        None => AddPlan {
            new_path: SINGLE_LEAF_PATH,
            moved: None,
            range: LeafRange::new(SINGLE_LEAF_PATH, SINGLE_LEAF_PATH),
        },
        Some(r) if r.first == r.last => AddPlan {
            new_path: 2,
            moved: None,
            range: LeafRange::new(1, 2),
        },
        Some(r) => AddPlan {
            new_path: right_child(r.first),
            moved: Some((r.first, left_child(r.first))),
            range: LeafRange::new(r.first + 1, right_child(r.first)),
        },
    }
}

/// Leaf moves needed to remove one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovePlan {
    /// Leaves to move, as `(from, to)`, in order.
    pub moves: Vec<(u64, u64)>,
    /// Leaf range after the removal, None when the tree becomes empty.
    pub range: Option<LeafRange>,
}

/// Plans removing the leaf at `path`.
///
/// The last two leaves are siblings. Their parent becomes a leaf that takes
/// whichever of them survives. If the removed leaf is elsewhere, the last
/// leaf fills its slot first.
pub fn plan_remove(range: LeafRange, path: u64) -> RemovePlan {
    debug_assert!(range.contains(path));
    match range.leaf_count() {
        1 => RemovePlan {
            moves: Vec::new(),
            range: None,
        },
        2 => RemovePlan {
            moves: if path == 1 { vec![(2, SINGLE_LEAF_PATH)] } else { Vec::new() },
            range: Some(LeafRange::new(SINGLE_LEAF_PATH, SINGLE_LEAF_PATH)),
        },
        _ => {
            let last = range.last;
            let second_last = last - 1;
            let parent = (last - 1) / 2;
            let moves = if path == last {
                vec![(second_last, parent)]
            } else if path == second_last {
                vec![(last, parent)]
            } else {
                vec![(last, path), (second_last, parent)]
            };
            RemovePlan {
                moves,
                range: Some(LeafRange::new(range.first - 1, range.last - 2)),
            }
        }
    }
}
