//! Byte ranges within a heap.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A half-open byte range `[offset, offset + size)` within a heap.
///
/// Regions compare, order and hash by their start offset only: within one
/// heap no two live regions share a start offset, so the offset identifies
/// the region.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    offset: u64,
    size: u64,
}

impl MemoryRegion {
    /// Create a region.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the range overflows `u64`.
    pub fn new(offset: u64, size: u64) -> Self {
        assert!(size > 0, "memory region size must be non-zero");
        assert!(
            offset.checked_add(size).is_some(),
            "memory region [{offset}, +{size}) overflows"
        );
        Self { offset, size }
    }

    /// Create a region, returning `None` for an empty range.
    pub fn non_empty(offset: u64, size: u64) -> Option<Self> {
        (size > 0).then(|| Self::new(offset, size))
    }

    /// First byte of the region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether the two ranges share at least one byte.
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Whether `other` lies entirely within this region.
    pub fn contains(&self, other: &MemoryRegion) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// Whether `other` starts exactly where this region ends.
    pub fn is_followed_by(&self, other: &MemoryRegion) -> bool {
        self.end() == other.offset
    }
}

impl PartialEq for MemoryRegion {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl Eq for MemoryRegion {}

impl Hash for MemoryRegion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
    }
}

impl PartialOrd for MemoryRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset.cmp(&other.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end() {
        let region = MemoryRegion::new(64, 128);
        assert_eq!(region.end(), 192);
    }

    #[test]
    fn test_equality_by_offset() {
        assert_eq!(MemoryRegion::new(0, 16), MemoryRegion::new(0, 32));
        assert_ne!(MemoryRegion::new(0, 16), MemoryRegion::new(16, 16));
    }

    #[test]
    fn test_overlaps() {
        let a = MemoryRegion::new(0, 100);
        let b = MemoryRegion::new(50, 100);
        let c = MemoryRegion::new(100, 10);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        // Half-open: touching ranges do not overlap.
        assert!(!a.overlaps(&c));
        assert!(a.is_followed_by(&c));
    }

    #[test]
    fn test_contains() {
        let outer = MemoryRegion::new(0, 256);
        assert!(outer.contains(&MemoryRegion::new(64, 64)));
        assert!(!outer.contains(&MemoryRegion::new(200, 100)));
    }

    #[test]
    fn test_non_empty() {
        assert!(MemoryRegion::non_empty(10, 0).is_none());
        assert_eq!(MemoryRegion::non_empty(10, 5).map(|r| r.size()), Some(5));
    }

    #[test]
    #[should_panic(expected = "memory region size must be non-zero")]
    fn test_zero_size_panics() {
        MemoryRegion::new(0, 0);
    }
}
