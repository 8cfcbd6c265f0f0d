//! Device allocation seam.
//!
//! The heap never talks to a graphics API directly. It asks an
//! [`AllocationStrategy`] for backing memory, and the strategy delegates to a
//! [`DeviceAllocator`] supplied by the backend. [`DummyDeviceAllocator`] backs
//! allocations with host memory for tests and headless runs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::MemoryError;
use crate::types::{MemoryProperties, MemoryRequirements, align_up};

/// Parameters of one device allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Debug label, usually the heap id.
    pub label: String,
    /// Size in bytes.
    pub size: u64,
    /// Required alignment of the allocation.
    pub alignment: u64,
    /// Requested memory properties.
    pub properties: MemoryProperties,
    /// Acceptable memory type indices.
    pub memory_type_bits: u32,
}

/// A block of device memory.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Unique identifier of the allocation.
    fn id(&self) -> u64;

    /// Size of the allocation in bytes.
    fn size(&self) -> u64;

    /// Properties of the memory type the block was allocated from.
    fn properties(&self) -> MemoryProperties;

    /// Write `data` at `offset`.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Read `out.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy `size` bytes from this block into `dst`.
    ///
    /// Used by compaction to move lease contents into a fresh allocation.
    /// Backends with device-side copies should override this.
    fn copy_to(
        &self,
        src_offset: u64,
        dst: &dyn DeviceMemory,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), MemoryError> {
        const CHUNK: u64 = 64 * 1024;

        let mut scratch = vec![0u8; size.min(CHUNK) as usize];
        let mut copied = 0;
        while copied < size {
            let len = (size - copied).min(CHUNK) as usize;
            self.read(src_offset + copied, &mut scratch[..len])?;
            dst.write(dst_offset + copied, &scratch[..len])?;
            copied += len as u64;
        }
        Ok(())
    }
}

/// Backend hook that performs device allocations.
pub trait DeviceAllocator: Send + Sync + fmt::Debug {
    /// Allocate a block of device memory.
    fn allocate(&self, request: &AllocationRequest) -> Result<Arc<dyn DeviceMemory>, MemoryError>;
}

/// How a heap obtains its backing allocation.
#[derive(Debug, Clone)]
pub enum AllocationStrategy {
    /// A generic block of exactly the heap's size.
    Generic(Arc<dyn DeviceAllocator>),
    /// A block sized and aligned for one specific resource's requirements.
    ResourceSized {
        /// Allocator that performs the allocation.
        allocator: Arc<dyn DeviceAllocator>,
        /// Requirements reported by the resource.
        requirements: MemoryRequirements,
    },
}

impl AllocationStrategy {
    /// Generic heap allocation.
    pub fn generic(allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self::Generic(allocator)
    }

    /// Allocation sized to a resource's requirements.
    pub fn resource_sized(
        allocator: Arc<dyn DeviceAllocator>,
        requirements: MemoryRequirements,
    ) -> Self {
        Self::ResourceSized {
            allocator,
            requirements,
        }
    }

    /// Build the allocation request for a heap of `size` bytes.
    pub fn request(
        &self,
        label: &str,
        size: u64,
        properties: MemoryProperties,
    ) -> AllocationRequest {
        match self {
            Self::Generic(_) => AllocationRequest {
                label: label.to_string(),
                size,
                alignment: 1,
                properties,
                memory_type_bits: u32::MAX,
            },
            Self::ResourceSized { requirements, .. } => {
                let alignment = requirements.alignment.max(1);
                AllocationRequest {
                    label: label.to_string(),
                    size: align_up(size.max(requirements.size), alignment),
                    alignment,
                    properties,
                    memory_type_bits: requirements.memory_type_bits,
                }
            }
        }
    }

    /// Allocate backing memory for a heap of `size` bytes.
    pub fn allocate(
        &self,
        label: &str,
        size: u64,
        properties: MemoryProperties,
    ) -> Result<Arc<dyn DeviceMemory>, MemoryError> {
        let request = self.request(label, size, properties);
        let allocator = match self {
            Self::Generic(allocator) => allocator,
            Self::ResourceSized { allocator, .. } => allocator,
        };
        let memory = allocator.allocate(&request)?;
        if memory.size() < size {
            return Err(MemoryError::AllocationFailed(format!(
                "allocator returned {} bytes for '{label}', {size} required",
                memory.size()
            )));
        }
        Ok(memory)
    }
}

/// Host-memory device allocator for tests and headless runs.
///
/// An optional byte budget makes allocations fail once the sum of live
/// blocks would exceed it, which simulates device memory exhaustion.
#[derive(Debug, Default)]
pub struct DummyDeviceAllocator {
    budget: Option<u64>,
    next_id: AtomicU64,
    allocations: AtomicUsize,
    live_bytes: Arc<AtomicU64>,
}

impl DummyDeviceAllocator {
    /// Create an allocator without a budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that refuses to hold more than `budget` live bytes.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget: Some(budget),
            ..Self::default()
        }
    }

    /// Number of successful allocations so far.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// Bytes held by blocks that have not been dropped yet.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Acquire)
    }
}

impl DeviceAllocator for DummyDeviceAllocator {
    fn allocate(&self, request: &AllocationRequest) -> Result<Arc<dyn DeviceMemory>, MemoryError> {
        let size = request.size;
        let reserved = self
            .live_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                let next = live.checked_add(size)?;
                match self.budget {
                    Some(budget) if next > budget => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            return Err(MemoryError::AllocationFailed(format!(
                "'{}' needs {size} bytes, budget {:?} exhausted",
                request.label, self.budget
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        log::trace!(
            "Dummy allocation #{id} for '{}': {size} bytes ({:?})",
            request.label,
            request.properties
        );

        Ok(Arc::new(DummyDeviceMemory {
            id,
            properties: request.properties,
            bytes: RwLock::new(vec![0; size as usize]),
            live_bytes: Arc::clone(&self.live_bytes),
        }))
    }
}

/// Host-backed [`DeviceMemory`] produced by [`DummyDeviceAllocator`].
pub struct DummyDeviceMemory {
    id: u64,
    properties: MemoryProperties,
    bytes: RwLock<Vec<u8>>,
    live_bytes: Arc<AtomicU64>,
}

impl DummyDeviceMemory {
    fn check_range(&self, offset: u64, len: usize) -> Result<usize, MemoryError> {
        let size = self.size();
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(offset as usize),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len: len as u64,
                size,
            }),
        }
    }
}

impl DeviceMemory for DummyDeviceMemory {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn properties(&self) -> MemoryProperties {
        self.properties
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        let start = self.check_range(offset, data.len())?;
        self.bytes.write()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let start = self.check_range(offset, out.len())?;
        out.copy_from_slice(&self.bytes.read()[start..start + out.len()]);
        Ok(())
    }
}

impl Drop for DummyDeviceMemory {
    fn drop(&mut self) {
        let size = self.bytes.get_mut().len() as u64;
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
    }
}

impl fmt::Debug for DummyDeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DummyDeviceMemory")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("properties", &self.properties)
            .finish()
    }
}

static_assertions::assert_impl_all!(DummyDeviceMemory: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn request(size: u64) -> AllocationRequest {
        AllocationRequest {
            label: "test".into(),
            size,
            alignment: 1,
            properties: MemoryProperties::HOST_VISIBLE,
            memory_type_bits: u32::MAX,
        }
    }

    #[test]
    fn test_dummy_write_read() {
        let allocator = DummyDeviceAllocator::new();
        let memory = allocator.allocate(&request(64)).unwrap();
        memory.write(8, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        memory.read(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_dummy_out_of_bounds() {
        let allocator = DummyDeviceAllocator::new();
        let memory = allocator.allocate(&request(16)).unwrap();
        let err = memory.write(12, &[0; 8]).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfBounds { offset: 12, .. }));
    }

    #[test]
    fn test_copy_to() {
        let allocator = DummyDeviceAllocator::new();
        let src = allocator.allocate(&request(32)).unwrap();
        let dst = allocator.allocate(&request(32)).unwrap();
        src.write(0, &[9, 8, 7]).unwrap();
        src.copy_to(0, dst.as_ref(), 16, 3).unwrap();

        let mut out = [0u8; 3];
        dst.read(16, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);
    }

    #[test]
    fn test_budget() {
        let allocator = DummyDeviceAllocator::with_budget(100);
        let first = allocator.allocate(&request(60)).unwrap();
        assert!(matches!(
            allocator.allocate(&request(60)),
            Err(MemoryError::AllocationFailed(_))
        ));
        assert_eq!(allocator.live_bytes(), 60);

        drop(first);
        assert_eq!(allocator.live_bytes(), 0);
        assert!(allocator.allocate(&request(60)).is_ok());
        assert_eq!(allocator.allocation_count(), 2);
    }

    #[test]
    fn test_resource_sized_request() {
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(DummyDeviceAllocator::new());
        let strategy = AllocationStrategy::resource_sized(
            allocator,
            MemoryRequirements::new(1000, 256).with_memory_type_bits(0b10),
        );
        let request = strategy.request("image", 512, MemoryProperties::DEVICE_LOCAL);
        assert_eq!(request.size, 1024);
        assert_eq!(request.alignment, 256);
        assert_eq!(request.memory_type_bits, 0b10);
    }
}
