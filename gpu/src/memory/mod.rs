//! GPU memory leasing.
//!
//! Device memory is carved out of a small, fixed set of heaps created at
//! startup. Each [`MemoryHeap`] owns one device allocation and hands out
//! [`Lease`]s, byte ranges that stay valid until the holder disposes them.
//! A [`MemoryLessor`] routes requests to the heap for a resource class
//! (`"staging"`, `"image"`, `"uniform"`, ...).
//!
//! # Architecture
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Registry | [`MemoryLessor`] | Heap id → heap dispatch |
//! | **Heap** | [`MemoryHeap`] | Best-fit leasing, free-region merging, compaction |
//! | Policy | [`FragmentationAnalyzer`], [`Defragmenter`], [`HeapAnalyzer`] | Pluggable heuristics |
//! | Device | [`DeviceAllocator`], [`DeviceMemory`] | Backing allocations |
//!
//! # Relocation
//!
//! Compaction moves leases. Anything that caches a lease's offset or backing
//! allocation must [`subscribe`](Lease::subscribe) and rebind when notified;
//! [`LeasedBuffer`](crate::resources::LeasedBuffer) does this automatically.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use redlilium_gpu::memory::{DummyDeviceAllocator, HeapDescriptor, MemoryLessor};
//! use redlilium_gpu::types::MemoryProperties;
//!
//! let allocator = Arc::new(DummyDeviceAllocator::new());
//! let lessor = MemoryLessor::new(vec![
//!     HeapDescriptor::generic("uniform", 64 * 1024, MemoryProperties::HOST_VISIBLE, allocator),
//! ])
//! .unwrap();
//!
//! let lease = lessor.lease("uniform", 256, 256).unwrap();
//! assert_eq!(lease.offset() % 256, 0);
//! lease.dispose();
//! ```

mod device;
mod free_list;
mod heap;
mod lease;
mod lessor;
mod policy;
mod region;

pub use device::{
    AllocationRequest, AllocationStrategy, DeviceAllocator, DeviceMemory, DummyDeviceAllocator,
    DummyDeviceMemory,
};
pub use free_list::FreeList;
pub use heap::{DefragmentationReport, HeapStats, MemoryHeap};
pub use lease::{Lease, LeaseChange, LeaseId, SubscriptionId};
pub use lessor::{HeapDescriptor, MemoryLessor};
pub use policy::{
    Defragmenter, FragmentationAnalyzer, FragmentationThresholdAnalyzer, HeapAnalyzer,
    HeapRecommendation, HeapSnapshot, LargestBlockFragmentation, PackingDefragmenter,
};
pub use region::MemoryRegion;

use std::fmt;

/// Errors that can occur while leasing or accessing device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// No region of the heap can satisfy the request, even after compaction.
    OutOfMemory {
        /// Heap that was asked.
        heap: String,
        /// Requested size in bytes.
        requested: u64,
        /// Unoccupied bytes in the heap at the time of the request.
        available: u64,
    },
    /// No heap with the given id is registered.
    UnknownHeap(String),
    /// Two heap descriptors share the same id.
    DuplicateHeap(String),
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// The lease's heap is not host-visible and cannot be mapped.
    NotHostVisible(String),
    /// Host access was attempted on a lease that is not mapped.
    NotMapped,
    /// Host access outside the leased range.
    OutOfBounds {
        /// Offset of the access within the lease.
        offset: u64,
        /// Length of the access.
        len: u64,
        /// Size of the lease.
        size: u64,
    },
    /// A defragmenter returned a placement that breaks the heap invariants.
    InvalidPlacement(String),
    /// The device allocator failed to provide backing memory.
    AllocationFailed(String),
    /// Heap bookkeeping no longer satisfies its invariants.
    Corrupted(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                heap,
                requested,
                available,
            } => write!(
                f,
                "heap '{heap}' out of memory: requested {requested} bytes, {available} bytes free"
            ),
            Self::UnknownHeap(id) => write!(f, "unknown memory heap '{id}'"),
            Self::DuplicateHeap(id) => write!(f, "memory heap '{id}' is declared twice"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::NotHostVisible(heap) => write!(f, "heap '{heap}' is not host-visible"),
            Self::NotMapped => write!(f, "lease is not mapped"),
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "access of {len} bytes at offset {offset} exceeds lease size {size}"
            ),
            Self::InvalidPlacement(msg) => write!(f, "invalid defragmentation placement: {msg}"),
            Self::AllocationFailed(msg) => write!(f, "device allocation failed: {msg}"),
            Self::Corrupted(msg) => write!(f, "heap corrupted: {msg}"),
        }
    }
}

impl std::error::Error for MemoryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::OutOfMemory {
            heap: "image".into(),
            requested: 4096,
            available: 1024,
        };
        assert_eq!(
            err.to_string(),
            "heap 'image' out of memory: requested 4096 bytes, 1024 bytes free"
        );

        let err = MemoryError::UnknownHeap("vertex".into());
        assert_eq!(err.to_string(), "unknown memory heap 'vertex'");
    }
}
