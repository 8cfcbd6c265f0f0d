//! Leases: caller-owned byte ranges within a heap.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::MemoryError;
use super::device::DeviceMemory;
use super::heap::MemoryHeap;
use super::region::MemoryRegion;

/// Identifier of a lease, unique within its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub(crate) u64);

impl LeaseId {
    /// Raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Identifier of a change subscription on a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Notification published when compaction moves a lease.
///
/// Compaction always allocates a fresh backing block, so every live lease
/// receives exactly one change per pass even when its offset is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseChange {
    /// The lease that moved.
    pub lease: LeaseId,
    /// Region before the move.
    pub previous: MemoryRegion,
    /// Region after the move.
    pub current: MemoryRegion,
    /// Backing allocation id before the move.
    pub previous_memory: u64,
    /// Backing allocation id after the move.
    pub memory: u64,
    /// Placement generation after the move (starts at 0, +1 per move).
    pub generation: u64,
}

type Observer = Arc<dyn Fn(&LeaseChange) + Send + Sync>;

/// Where a lease currently lives.
pub(super) struct Placement {
    pub(super) region: MemoryRegion,
    pub(super) memory: Arc<dyn DeviceMemory>,
    pub(super) generation: u64,
}

/// State shared between a [`Lease`] and its heap's lease map.
pub(crate) struct LeaseSlot {
    id: LeaseId,
    alignment: u64,
    pub(super) placement: RwLock<Placement>,
    mapped: AtomicBool,
    observers: Mutex<Vec<(SubscriptionId, Observer)>>,
    next_subscription: AtomicU64,
}

impl LeaseSlot {
    pub(super) fn new(
        id: LeaseId,
        region: MemoryRegion,
        alignment: u64,
        memory: Arc<dyn DeviceMemory>,
    ) -> Self {
        Self {
            id,
            alignment,
            placement: RwLock::new(Placement {
                region,
                memory,
                generation: 0,
            }),
            mapped: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    pub(super) fn id(&self) -> LeaseId {
        self.id
    }

    pub(super) fn alignment(&self) -> u64 {
        self.alignment
    }

    pub(super) fn region(&self) -> MemoryRegion {
        self.placement.read().region
    }

    /// Deliver a change to every subscriber. Called without any heap lock held.
    pub(super) fn notify(&self, change: &LeaseChange) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(change);
        }
    }
}

/// A caller-owned byte range within a [`MemoryHeap`].
///
/// Created by [`MemoryHeap::lease`] or
/// [`MemoryLessor::lease`](super::MemoryLessor::lease). The range is returned
/// to the heap by [`dispose`](Self::dispose), or when the lease is dropped.
///
/// The region and backing allocation may change when the heap compacts.
/// Read them through the lease rather than caching them, or
/// [`subscribe`](Self::subscribe) to be told when they move.
pub struct Lease {
    slot: Arc<LeaseSlot>,
    heap: Arc<MemoryHeap>,
    released: bool,
}

impl Lease {
    pub(super) fn new(slot: Arc<LeaseSlot>, heap: Arc<MemoryHeap>) -> Self {
        Self {
            slot,
            heap,
            released: false,
        }
    }

    /// Lease identifier.
    pub fn id(&self) -> LeaseId {
        self.slot.id
    }

    /// Id of the heap this lease belongs to.
    pub fn heap_id(&self) -> &str {
        self.heap.id()
    }

    /// Current region within the heap.
    pub fn region(&self) -> MemoryRegion {
        self.slot.region()
    }

    /// Current start offset within the heap.
    pub fn offset(&self) -> u64 {
        self.region().offset()
    }

    /// Size of the lease in bytes.
    pub fn size(&self) -> u64 {
        self.region().size()
    }

    /// Alignment requested when the lease was created.
    pub fn alignment(&self) -> u64 {
        self.slot.alignment
    }

    /// The heap's current backing allocation.
    pub fn memory(&self) -> Arc<dyn DeviceMemory> {
        Arc::clone(&self.slot.placement.read().memory)
    }

    /// Number of times compaction has moved this lease.
    pub fn generation(&self) -> u64 {
        self.slot.placement.read().generation
    }

    /// Whether the lease is mapped for host access.
    pub fn is_mapped(&self) -> bool {
        self.slot.mapped.load(Ordering::Acquire)
    }

    /// Map the lease for host access.
    ///
    /// Fails with [`MemoryError::NotHostVisible`] on heaps without
    /// `HOST_VISIBLE` memory. Mapping an already mapped lease is a no-op.
    pub fn map(&self) -> Result<(), MemoryError> {
        if !self.heap.properties().is_host_visible() {
            return Err(MemoryError::NotHostVisible(self.heap.id().to_string()));
        }
        self.slot.mapped.store(true, Ordering::Release);
        Ok(())
    }

    /// Unmap the lease.
    pub fn unmap(&self) {
        self.slot.mapped.store(false, Ordering::Release);
    }

    /// Write `data` at `offset` bytes into the lease.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        let placement = self.slot.placement.read();
        self.check_access(placement.region, offset, data.len() as u64)?;
        placement
            .memory
            .write(placement.region.offset() + offset, data)
    }

    /// Read `out.len()` bytes starting `offset` bytes into the lease.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let placement = self.slot.placement.read();
        self.check_access(placement.region, offset, out.len() as u64)?;
        placement.memory.read(placement.region.offset() + offset, out)
    }

    /// Register a callback invoked whenever the lease is relocated.
    ///
    /// Callbacks run on the thread that triggered compaction, after the heap
    /// lock is released, so they may lease or free memory themselves.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&LeaseChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.slot.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.slot.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.slot.observers.lock();
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    /// Return the range to the heap.
    ///
    /// The heap merges the range with adjacent free space and may compact
    /// itself afterwards.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.slot.mapped.store(false, Ordering::Release);
            self.heap.release(&self.slot);
        }
    }

    fn check_access(&self, region: MemoryRegion, offset: u64, len: u64) -> Result<(), MemoryError> {
        if !self.is_mapped() {
            return Err(MemoryError::NotMapped);
        }
        match offset.checked_add(len) {
            Some(end) if end <= region.size() => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: region.size(),
            }),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.slot.id)
            .field("heap", &self.heap.id())
            .field("region", &self.region())
            .field("alignment", &self.slot.alignment)
            .finish()
    }
}

static_assertions::assert_impl_all!(Lease: Send, Sync);
