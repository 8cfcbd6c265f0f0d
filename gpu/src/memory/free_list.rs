//! Free-region bookkeeping for a heap.

use std::collections::{BTreeMap, BTreeSet};

use super::region::MemoryRegion;
use crate::types::align_up;

/// Disjoint set of free regions.
///
/// Regions are indexed twice: by offset, to merge byte-adjacent neighbours on
/// insertion, and by `(size, offset)`, so a best-fit scan visits candidates
/// from the smallest upward. Inserted regions are always merged, so no two
/// stored regions are ever adjacent.
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
    total: u64,
}

impl FreeList {
    /// Create an empty free list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a free list holding a single region.
    pub fn with_region(region: MemoryRegion) -> Self {
        let mut list = Self::new();
        list.insert(region);
        list
    }

    /// Build the free list of a heap of `heap_size` bytes whose occupied
    /// ranges are `occupied` (in any order, non-overlapping).
    pub fn complement(heap_size: u64, occupied: &[MemoryRegion]) -> Self {
        let mut sorted: Vec<MemoryRegion> = occupied.to_vec();
        sorted.sort();

        let mut list = Self::new();
        let mut cursor = 0;
        for region in sorted {
            if let Some(gap) = MemoryRegion::non_empty(cursor, region.offset() - cursor) {
                list.insert(gap);
            }
            cursor = region.end();
        }
        if let Some(tail) = MemoryRegion::non_empty(cursor, heap_size - cursor) {
            list.insert(tail);
        }
        list
    }

    /// Number of free regions.
    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    /// Whether there are no free regions.
    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Sum of all free region sizes.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// The largest free region (lowest offset on ties).
    pub fn largest(&self) -> Option<MemoryRegion> {
        let &(size, _) = self.by_size.iter().next_back()?;
        self.by_size
            .range((size, 0)..)
            .next()
            .map(|&(size, offset)| MemoryRegion::new(offset, size))
    }

    /// Free regions in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        self.by_offset
            .iter()
            .map(|(&offset, &size)| MemoryRegion::new(offset, size))
    }

    /// Free regions in ascending offset order, collected.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.iter().collect()
    }

    /// Return a region to the set, merging it with byte-adjacent neighbours.
    ///
    /// # Panics
    ///
    /// Panics if the region overlaps a region that is already free; that can
    /// only happen when the same bytes are released twice.
    pub fn insert(&mut self, region: MemoryRegion) {
        let mut offset = region.offset();
        let mut end = region.end();

        if let Some((&prev_offset, &prev_size)) = self.by_offset.range(..offset).next_back() {
            let prev_end = prev_offset + prev_size;
            assert!(
                prev_end <= offset,
                "free region [{offset}, {end}) overlaps free region [{prev_offset}, {prev_end})"
            );
            if prev_end == offset {
                self.detach(prev_offset, prev_size);
                offset = prev_offset;
            }
        }

        if let Some((&next_offset, &next_size)) = self.by_offset.range(region.offset()..).next() {
            assert!(
                next_offset >= end,
                "free region [{}, {end}) overlaps free region [{next_offset}, {})",
                region.offset(),
                next_offset + next_size
            );
            if next_offset == end {
                self.detach(next_offset, next_size);
                end = next_offset + next_size;
            }
        }

        self.attach(offset, end - offset);
    }

    /// Remove exactly `region` from the set. Returns `false` if it is not a
    /// stored free region.
    pub fn remove(&mut self, region: MemoryRegion) -> bool {
        match self.by_offset.get(&region.offset()) {
            Some(&size) if size == region.size() => {
                self.detach(region.offset(), size);
                true
            }
            _ => false,
        }
    }

    /// Find the first region, in ascending size order, that can hold `size`
    /// bytes starting at an offset aligned to `alignment`.
    ///
    /// Returns the chosen free region and the aligned offset inside it.
    pub fn find_fit(&self, size: u64, alignment: u64) -> Option<(MemoryRegion, u64)> {
        self.by_size
            .range((size, 0)..)
            .find_map(|&(free_size, free_offset)| {
                let aligned = align_up(free_offset, alignment);
                let padding = aligned - free_offset;
                (padding + size <= free_size)
                    .then(|| (MemoryRegion::new(free_offset, free_size), aligned))
            })
    }

    /// Carve an aligned region of `size` bytes out of the best-fitting free
    /// region. The unused head and tail of the chosen region stay free.
    pub fn carve(&mut self, size: u64, alignment: u64) -> Option<MemoryRegion> {
        let (free, aligned) = self.find_fit(size, alignment)?;
        self.detach(free.offset(), free.size());

        let granted = MemoryRegion::new(aligned, size);
        if let Some(head) = MemoryRegion::non_empty(free.offset(), aligned - free.offset()) {
            self.insert(head);
        }
        if let Some(tail) = MemoryRegion::non_empty(granted.end(), free.end() - granted.end()) {
            self.insert(tail);
        }
        Some(granted)
    }

    fn attach(&mut self, offset: u64, size: u64) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
        self.total += size;
    }

    fn detach(&mut self, offset: u64, size: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
        self.total -= size;
    }
}
