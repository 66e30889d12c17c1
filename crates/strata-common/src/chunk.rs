//! Chunk keys identifying cached data blocks.

use serde::{Deserialize, Serialize};

/// Leading key component reserved for anonymous scratch allocations.
///
/// Scratch chunks are real pool residents but are never flushed to a parent
/// tier on checkpoint.
pub const SCRATCH_SENTINEL: i32 = -1;

/// Identifier for a chunk: an ordered sequence of signed integers.
///
/// Keys compare lexicographically (derived from the `Vec` ordering), so all
/// keys sharing a prefix occupy a contiguous range of any ordered map. This
/// is what makes delete-by-prefix a single range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey(Vec<i32>);

impl ChunkKey {
    /// Creates a key from its components.
    pub fn new(components: Vec<i32>) -> Self {
        Self(components)
    }

    /// Returns the key's components in order.
    pub fn components(&self) -> &[i32] {
        &self.0
    }

    /// Returns the number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if this key's first `prefix.len()` components equal
    /// `prefix`.
    pub fn starts_with(&self, prefix: &ChunkKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns true if this key names an anonymous scratch allocation.
    pub fn is_scratch(&self) -> bool {
        self.0.first() == Some(&SCRATCH_SENTINEL)
    }
}

impl From<Vec<i32>> for ChunkKey {
    fn from(components: Vec<i32>) -> Self {
        Self(components)
    }
}

impl From<&[i32]> for ChunkKey {
    fn from(components: &[i32]) -> Self {
        Self(components.to_vec())
    }
}

impl FromIterator<i32> for ChunkKey {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "]")
    }
}
