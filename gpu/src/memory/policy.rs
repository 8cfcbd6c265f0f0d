//! Pluggable heap heuristics: fragmentation scoring, compaction placement and
//! the post-free defragmentation policy.
//!
//! Every heap uses the defaults below unless its
//! [`HeapDescriptor`](super::HeapDescriptor) overrides them.

use std::fmt;

use super::free_list::FreeList;
use super::region::MemoryRegion;
use crate::types::align_up;

/// Scores how fragmented a heap's free space is.
///
/// `0.0` means all free bytes are contiguous; values approach `1.0` as free
/// space splinters into many small regions.
pub trait FragmentationAnalyzer: Send + Sync + fmt::Debug {
    /// Compute the fragmentation score of `free` within a heap of `heap_size` bytes.
    fn fragmentation(&self, free: &FreeList, heap_size: u64) -> f32;
}

/// Default fragmentation metric: `1 - largest_free / total_free`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestBlockFragmentation;

impl FragmentationAnalyzer for LargestBlockFragmentation {
    fn fragmentation(&self, free: &FreeList, _heap_size: u64) -> f32 {
        let total = free.total_bytes();
        match free.largest() {
            Some(largest) if total > 0 => 1.0 - (largest.size() as f64 / total as f64) as f32,
            _ => 0.0,
        }
    }
}

/// Computes a compacted placement for the live leases of a heap.
pub trait Defragmenter: Send + Sync + fmt::Debug {
    /// Given every live `(region, alignment)` pair, return the new region for
    /// each entry, in the same order as the input.
    ///
    /// The heap rejects placements that change a size, break an alignment,
    /// overlap, or leave the heap.
    fn compact(&self, entries: &[(MemoryRegion, u64)]) -> Vec<MemoryRegion>;
}

/// Default defragmenter: packs leases from offset zero in their current
/// offset order, padding only as far as each lease's alignment requires.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackingDefragmenter;

impl Defragmenter for PackingDefragmenter {
    fn compact(&self, entries: &[(MemoryRegion, u64)]) -> Vec<MemoryRegion> {
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by_key(|&i| entries[i].0.offset());

        let mut placement = vec![None; entries.len()];
        let mut cursor = 0;
        for i in order {
            let (region, alignment) = entries[i];
            let offset = align_up(cursor, alignment);
            let moved = MemoryRegion::new(offset, region.size());
            cursor = moved.end();
            placement[i] = Some(moved);
        }
        placement.into_iter().flatten().collect()
    }
}

/// Point-in-time view of a heap handed to [`HeapAnalyzer`]s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapSnapshot {
    /// Total heap size in bytes.
    pub heap_size: u64,
    /// Bytes held by live leases.
    pub occupied: u64,
    /// Number of live leases.
    pub lease_count: usize,
    /// Number of free regions.
    pub free_regions: usize,
    /// Size of the largest free region.
    pub largest_free: u64,
    /// Score from the heap's [`FragmentationAnalyzer`].
    pub fragmentation: f32,
}

/// Outcome of a [`HeapAnalyzer`] inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapRecommendation {
    /// Leave the heap as it is.
    None,
    /// Compact the heap now.
    Defragment,
}

/// Inspects a heap after a lease is freed and recommends whether to compact.
pub trait HeapAnalyzer: Send + Sync + fmt::Debug {
    /// Inspect the heap.
    fn analyze(&self, snapshot: &HeapSnapshot) -> HeapRecommendation;
}

/// Default analyzer: compacts once fragmentation reaches `threshold` and free
/// space is split into at least `min_free_regions` pieces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FragmentationThresholdAnalyzer {
    threshold: f32,
    min_free_regions: usize,
}

impl FragmentationThresholdAnalyzer {
    /// Default fragmentation threshold.
    pub const DEFAULT_THRESHOLD: f32 = 0.7;

    /// Default minimum number of free regions before compaction is considered.
    pub const DEFAULT_MIN_FREE_REGIONS: usize = 4;

    /// Create an analyzer with explicit limits.
    pub fn new(threshold: f32, min_free_regions: usize) -> Self {
        Self {
            threshold,
            min_free_regions,
        }
    }

    /// Fragmentation score at which compaction is recommended.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Minimum number of free regions before compaction is considered.
    pub fn min_free_regions(&self) -> usize {
        self.min_free_regions
    }
}

impl Default for FragmentationThresholdAnalyzer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD, Self::DEFAULT_MIN_FREE_REGIONS)
    }
}

impl HeapAnalyzer for FragmentationThresholdAnalyzer {
    fn analyze(&self, snapshot: &HeapSnapshot) -> HeapRecommendation {
        if snapshot.lease_count > 0
            && snapshot.free_regions >= self.min_free_regions
            && snapshot.fragmentation >= self.threshold
        {
            HeapRecommendation::Defragment
        } else {
            HeapRecommendation::None
        }
    }
}
