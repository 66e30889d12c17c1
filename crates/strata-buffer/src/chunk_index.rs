//! Ordered chunk-key index mapping keys to segment handles.

use crate::segment::SegmentHandle;
use std::collections::BTreeMap;
use strata_common::ChunkKey;

/// Maps each chunk key to the segment currently holding that chunk.
///
/// Backed by an ordered map so all keys sharing a prefix are contiguous,
/// which makes delete-by-prefix a single bounded range scan. Handles stay
/// valid across segment-sequence mutations because they name arena slots,
/// not positions.
#[derive(Debug, Default)]
pub(crate) struct ChunkIndex {
    map: BTreeMap<ChunkKey, SegmentHandle>,
}

impl ChunkIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &ChunkKey) -> Option<SegmentHandle> {
        self.map.get(key).copied()
    }

    pub(crate) fn insert(&mut self, key: ChunkKey, handle: SegmentHandle) -> Option<SegmentHandle> {
        self.map.insert(key, handle)
    }

    pub(crate) fn remove(&mut self, key: &ChunkKey) -> Option<SegmentHandle> {
        self.map.remove(key)
    }

    pub(crate) fn contains(&self, key: &ChunkKey) -> bool {
        self.map.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }

    /// Keys whose leading components equal `prefix`, in order.
    ///
    /// Keys matching a prefix form a contiguous run starting at the prefix's
    /// lower bound, so the scan stops at the first non-match.
    pub(crate) fn keys_with_prefix(&self, prefix: &ChunkKey) -> Vec<ChunkKey> {
        self.map
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ChunkKey, SegmentHandle)> {
        self.map.iter().map(|(key, handle)| (key, *handle))
    }
}
