//! Buffers bound to leased memory.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::memory::{Lease, LeaseChange, MemoryError, MemoryLessor, SubscriptionId};
use crate::types::{BufferDescriptor, BufferUsage};

/// Where a [`LeasedBuffer`] is currently bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    /// Offset of the buffer within its heap.
    pub offset: u64,
    /// Id of the backing device allocation.
    pub memory_id: u64,
    /// Placement generation of the lease.
    pub generation: u64,
    /// Number of times the buffer was rebound after heap compaction.
    pub rebind_count: u64,
}

/// A buffer whose memory comes from a [`Lease`].
///
/// The buffer subscribes to its lease and rebinds whenever heap compaction
/// moves it, so [`binding`](Self::binding) always reflects the lease's
/// current placement. The lease is returned to its heap when the buffer is
/// dropped.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use redlilium_gpu::memory::{DummyDeviceAllocator, HeapDescriptor, MemoryLessor};
/// use redlilium_gpu::resources::LeasedBuffer;
/// use redlilium_gpu::types::{BufferDescriptor, BufferUsage, MemoryProperties};
///
/// let lessor = MemoryLessor::new(vec![HeapDescriptor::generic(
///     "uniform",
///     4096,
///     MemoryProperties::HOST_VISIBLE,
///     Arc::new(DummyDeviceAllocator::new()),
/// )])
/// .unwrap();
///
/// let buffer = LeasedBuffer::create(
///     &lessor,
///     "uniform",
///     BufferDescriptor::new(256, BufferUsage::UNIFORM).with_label("camera"),
///     256,
/// )
/// .unwrap();
/// buffer.map().unwrap();
/// buffer.write(0, &[1, 2, 3, 4]).unwrap();
/// assert_eq!(buffer.label(), Some("camera"));
/// ```
pub struct LeasedBuffer {
    descriptor: BufferDescriptor,
    binding: Arc<Mutex<BufferBinding>>,
    subscription: SubscriptionId,
    lease: Lease,
}

impl LeasedBuffer {
    /// Bind a buffer to an existing lease.
    ///
    /// Fails with [`MemoryError::InvalidParameter`] if the lease is smaller
    /// than the buffer.
    pub fn new(descriptor: BufferDescriptor, lease: Lease) -> Result<Self, MemoryError> {
        if lease.size() < descriptor.size {
            return Err(MemoryError::InvalidParameter(format!(
                "buffer {:?} needs {} bytes, lease holds {}",
                descriptor.label,
                descriptor.size,
                lease.size()
            )));
        }

        let binding = Arc::new(Mutex::new(BufferBinding {
            offset: lease.offset(),
            memory_id: lease.memory().id(),
            generation: lease.generation(),
            rebind_count: 0,
        }));

        let subscription = {
            let binding = Arc::clone(&binding);
            let label = descriptor.label.clone();
            lease.subscribe(move |change: &LeaseChange| {
                let mut binding = binding.lock();
                binding.offset = change.current.offset();
                binding.memory_id = change.memory;
                binding.generation = change.generation;
                binding.rebind_count += 1;
                log::trace!(
                    "Rebound buffer {:?}: offset {} -> {}, memory #{} -> #{}",
                    label,
                    change.previous.offset(),
                    change.current.offset(),
                    change.previous_memory,
                    change.memory
                );
            })
        };

        Ok(Self {
            descriptor,
            binding,
            subscription,
            lease,
        })
    }

    /// Lease memory from `group` and bind a new buffer to it.
    pub fn create(
        lessor: &MemoryLessor,
        group: &str,
        descriptor: BufferDescriptor,
        alignment: u64,
    ) -> Result<Self, MemoryError> {
        let lease = lessor.lease(group, descriptor.size, alignment)?;
        Self::new(descriptor, lease)
    }

    /// Get the buffer descriptor.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// Get the buffer usage flags.
    pub fn usage(&self) -> BufferUsage {
        self.descriptor.usage
    }

    /// Get the buffer label, if set.
    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    /// The lease backing this buffer.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Current binding.
    pub fn binding(&self) -> BufferBinding {
        *self.binding.lock()
    }

    /// Map the buffer for host access.
    pub fn map(&self) -> Result<(), MemoryError> {
        self.lease.map()
    }

    /// Write `data` at `offset` bytes into the buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check_range(offset, data.len() as u64)?;
        self.lease.write(offset, data)
    }

    /// Read `out.len()` bytes starting `offset` bytes into the buffer.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(offset, out.len() as u64)?;
        self.lease.read(offset, out)
    }

    /// Stop tracking relocations and return the memory to its heap.
    pub fn dispose(self) {
        self.lease.unsubscribe(self.subscription);
        self.lease.dispose();
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.descriptor.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: self.descriptor.size,
            }),
        }
    }
}

impl std::fmt::Debug for LeasedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedBuffer")
            .field("size", &self.descriptor.size)
            .field("usage", &self.descriptor.usage)
            .field("label", &self.descriptor.label)
            .field("binding", &self.binding())
            .finish()
    }
}

static_assertions::assert_impl_all!(LeasedBuffer: Send, Sync);
