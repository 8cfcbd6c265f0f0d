//! A fixed-size device memory heap.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::MemoryError;
use super::device::{AllocationStrategy, DeviceMemory};
use super::free_list::FreeList;
use super::lease::{Lease, LeaseChange, LeaseId, LeaseSlot};
use super::lessor::HeapDescriptor;
use super::policy::{
    Defragmenter, FragmentationAnalyzer, HeapAnalyzer, HeapRecommendation, HeapSnapshot,
};
use super::region::MemoryRegion;
use crate::types::MemoryProperties;

/// Relocations collected under the heap lock, published after it is released.
type PendingChanges = Vec<(Arc<LeaseSlot>, LeaseChange)>;

/// Usage statistics of a heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapStats {
    /// Total heap size in bytes.
    pub size: u64,
    /// Bytes held by live leases.
    pub occupied: u64,
    /// Bytes in free regions.
    pub free_bytes: u64,
    /// Number of live leases.
    pub lease_count: usize,
    /// Number of free regions.
    pub free_regions: usize,
    /// Size of the largest free region.
    pub largest_free: u64,
    /// Current fragmentation score.
    pub fragmentation: f32,
    /// Completed compaction passes.
    pub defragmentations: u64,
    /// Lease requests that failed for lack of space or a failed compaction.
    pub failed_leases: u64,
}

/// Summary of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefragmentationReport {
    /// Leases relocated into the new backing allocation.
    pub leases: usize,
    /// Leases whose offset changed.
    pub moved: usize,
    /// Free regions before the pass.
    pub free_regions_before: usize,
    /// Free regions after the pass.
    pub free_regions_after: usize,
    /// Largest free region after the pass.
    pub largest_free_after: u64,
}

struct HeapState {
    memory: Arc<dyn DeviceMemory>,
    free: FreeList,
    leases: BTreeMap<u64, Arc<LeaseSlot>>,
    occupied: u64,
    defragmentations: u64,
    failed_leases: u64,
}

/// One fixed-size block of device memory, leased out in aligned ranges.
///
/// Leasing scans free regions from the smallest upward and takes the first
/// one that fits after alignment, which approximates best-fit. When nothing
/// fits but enough bytes are free in total, the heap compacts once and
/// retries. Compaction is also considered after every free, as directed by
/// the heap's [`HeapAnalyzer`]s.
///
/// All bookkeeping sits behind one lock. It is held only for bookkeeping and
/// compaction copies, never while change notifications are delivered.
pub struct MemoryHeap {
    id: String,
    size: u64,
    properties: MemoryProperties,
    strategy: AllocationStrategy,
    fragmentation_analyzer: Box<dyn FragmentationAnalyzer>,
    defragmenter: Box<dyn Defragmenter>,
    analyzers: Vec<Box<dyn HeapAnalyzer>>,
    state: Mutex<HeapState>,
    next_lease_id: AtomicU64,
}

impl MemoryHeap {
    /// Create a heap and its backing allocation.
    pub fn new(descriptor: HeapDescriptor) -> Result<Arc<Self>, MemoryError> {
        let HeapDescriptor {
            id,
            size,
            properties,
            strategy,
            fragmentation_analyzer,
            defragmenter,
            analyzers,
        } = descriptor;

        if size == 0 {
            return Err(MemoryError::InvalidParameter(format!(
                "heap '{id}' must have a non-zero size"
            )));
        }

        let memory = strategy.allocate(&id, size, properties)?;
        log::info!(
            "Created memory heap '{}' ({} bytes, {:?}, backing #{})",
            id,
            size,
            properties,
            memory.id()
        );

        Ok(Arc::new(Self {
            id,
            size,
            properties,
            strategy,
            fragmentation_analyzer,
            defragmenter,
            analyzers,
            state: Mutex::new(HeapState {
                memory,
                free: FreeList::with_region(MemoryRegion::new(0, size)),
                leases: BTreeMap::new(),
                occupied: 0,
                defragmentations: 0,
                failed_leases: 0,
            }),
            next_lease_id: AtomicU64::new(0),
        }))
    }

    /// Heap identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Total heap size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Memory properties of the backing allocation.
    pub fn properties(&self) -> MemoryProperties {
        self.properties
    }

    /// The current backing allocation.
    pub fn memory(&self) -> Arc<dyn DeviceMemory> {
        Arc::clone(&self.state.lock().memory)
    }

    /// Lease `size` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::InvalidParameter`] for a zero size or a
    ///   non-power-of-two alignment.
    /// - [`MemoryError::OutOfMemory`] if no free region fits, even after one
    ///   compaction pass.
    /// - [`MemoryError::AllocationFailed`] if that compaction pass could not
    ///   obtain a new backing allocation.
    pub fn lease(self: &Arc<Self>, size: u64, alignment: u64) -> Result<Lease, MemoryError> {
        redlilium_core::profile_scope!("gpu: lease memory");

        if size == 0 {
            return Err(MemoryError::InvalidParameter(
                "lease size must be non-zero".to_string(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(MemoryError::InvalidParameter(format!(
                "alignment must be a power of 2, got {alignment}"
            )));
        }

        let mut pending = PendingChanges::new();
        let slot = {
            let mut state = self.state.lock();

            let mut region = state.free.carve(size, alignment);
            if region.is_none() {
                let available = self.size - state.occupied;
                if available >= size.saturating_add(alignment) {
                    log::debug!(
                        "Heap '{}': no region fits {} bytes (align {}) with {} bytes free, compacting",
                        self.id,
                        size,
                        alignment,
                        available
                    );
                    match self.defragment_locked(&mut state) {
                        Ok((changes, _)) => pending = changes,
                        Err(err) => {
                            state.failed_leases += 1;
                            log::warn!(
                                "Heap '{}': compaction for a {} byte lease failed: {}",
                                self.id,
                                size,
                                err
                            );
                            return Err(err);
                        }
                    }
                    region = state.free.carve(size, alignment);
                }
            }

            match region {
                Some(region) => {
                    let id = LeaseId(self.next_lease_id.fetch_add(1, Ordering::Relaxed));
                    let slot = Arc::new(LeaseSlot::new(
                        id,
                        region,
                        alignment,
                        Arc::clone(&state.memory),
                    ));
                    state.leases.insert(region.offset(), Arc::clone(&slot));
                    state.occupied += size;
                    log::trace!(
                        "Heap '{}': leased {:?} as [{}, {})",
                        self.id,
                        id,
                        region.offset(),
                        region.end()
                    );
                    self.plot(&state);
                    Ok(slot)
                }
                None => {
                    state.failed_leases += 1;
                    let available = self.size - state.occupied;
                    log::warn!(
                        "Heap '{}' out of memory: requested {} bytes (align {}), {} bytes free in {} regions",
                        self.id,
                        size,
                        alignment,
                        available,
                        state.free.len()
                    );
                    Err(MemoryError::OutOfMemory {
                        heap: self.id.clone(),
                        requested: size,
                        available,
                    })
                }
            }
        };

        publish(pending);
        slot.map(|slot| Lease::new(slot, Arc::clone(self)))
    }

    /// Return a lease's range to the free set.
    ///
    /// # Panics
    ///
    /// Panics if the lease is not live in this heap.
    pub(super) fn release(&self, slot: &LeaseSlot) {
        redlilium_core::profile_scope!("gpu: free lease");

        let pending = {
            let mut state = self.state.lock();
            let region = slot.region();

            let live = state
                .leases
                .get(&region.offset())
                .is_some_and(|live| live.id() == slot.id());
            assert!(
                live,
                "lease {:?} at offset {} is not live in heap '{}' (released twice?)",
                slot.id(),
                region.offset(),
                self.id
            );

            state.leases.remove(&region.offset());
            state.free.insert(region);
            state.occupied -= region.size();
            log::trace!(
                "Heap '{}': released {:?} [{}, {})",
                self.id,
                slot.id(),
                region.offset(),
                region.end()
            );

            let snapshot = self.snapshot(&state);
            self.plot(&state);
            let wants_compaction = self
                .analyzers
                .iter()
                .any(|analyzer| analyzer.analyze(&snapshot) == HeapRecommendation::Defragment);

            if wants_compaction {
                log::debug!(
                    "Heap '{}': fragmentation {:.2} over {} free regions, compacting",
                    self.id,
                    snapshot.fragmentation,
                    snapshot.free_regions
                );
                match self.defragment_locked(&mut state) {
                    Ok((changes, _)) => changes,
                    Err(err) => {
                        log::error!("Heap '{}': compaction after free failed: {err}", self.id);
                        PendingChanges::new()
                    }
                }
            } else {
                PendingChanges::new()
            }
        };

        publish(pending);
    }

    /// Compact every live lease towards the start of the heap.
    ///
    /// Lease contents are copied into a fresh backing allocation and every
    /// lease is notified exactly once.
    pub fn defragment(&self) -> Result<DefragmentationReport, MemoryError> {
        let (pending, report) = {
            let mut state = self.state.lock();
            self.defragment_locked(&mut state)?
        };
        publish(pending);
        Ok(report)
    }

    fn defragment_locked(
        &self,
        state: &mut HeapState,
    ) -> Result<(PendingChanges, DefragmentationReport), MemoryError> {
        redlilium_core::profile_scope!("gpu: defragment heap");

        let slots: Vec<Arc<LeaseSlot>> = state.leases.values().cloned().collect();
        let entries: Vec<(MemoryRegion, u64)> = slots
            .iter()
            .map(|slot| (slot.region(), slot.alignment()))
            .collect();
        let placement = self.defragmenter.compact(&entries);
        self.validate_placement(&entries, &placement)?;

        let memory = self.strategy.allocate(&self.id, self.size, self.properties)?;

        // Hold every placement lock across copy and swap so host writes land
        // either before the copy or in the new allocation.
        let mut guards: Vec<_> = slots.iter().map(|slot| slot.placement.write()).collect();
        for (guard, target) in guards.iter().zip(&placement) {
            guard.memory.copy_to(
                guard.region.offset(),
                memory.as_ref(),
                target.offset(),
                target.size(),
            )?;
        }

        let mut changes = PendingChanges::with_capacity(slots.len());
        let mut moved = 0;
        for ((slot, guard), target) in slots.iter().zip(guards.iter_mut()).zip(&placement) {
            let previous = guard.region;
            let previous_memory = guard.memory.id();
            if previous.offset() != target.offset() {
                moved += 1;
            }
            guard.region = *target;
            guard.memory = Arc::clone(&memory);
            guard.generation += 1;
            changes.push((
                Arc::clone(slot),
                LeaseChange {
                    lease: slot.id(),
                    previous,
                    current: *target,
                    previous_memory,
                    memory: memory.id(),
                    generation: guard.generation,
                },
            ));
        }
        drop(guards);

        let free_regions_before = state.free.len();
        state.leases = slots
            .iter()
            .zip(&placement)
            .map(|(slot, region)| (region.offset(), Arc::clone(slot)))
            .collect();
        state.free = FreeList::complement(self.size, &placement);
        state.memory = memory;
        state.defragmentations += 1;

        let report = DefragmentationReport {
            leases: slots.len(),
            moved,
            free_regions_before,
            free_regions_after: state.free.len(),
            largest_free_after: state.free.largest().map_or(0, |r| r.size()),
        };
        log::debug!(
            "Heap '{}': compacted {} leases ({} moved), free regions {} -> {}",
            self.id,
            report.leases,
            report.moved,
            report.free_regions_before,
            report.free_regions_after
        );
        redlilium_core::profile_message!(&format!(
            "heap '{}' compacted, {} leases moved",
            self.id, report.moved
        ));
        self.plot(state);

        Ok((changes, report))
    }

    fn validate_placement(
        &self,
        entries: &[(MemoryRegion, u64)],
        placement: &[MemoryRegion],
    ) -> Result<(), MemoryError> {
        if entries.len() != placement.len() {
            return Err(MemoryError::InvalidPlacement(format!(
                "{} regions returned for {} leases",
                placement.len(),
                entries.len()
            )));
        }

        for ((region, alignment), target) in entries.iter().zip(placement) {
            if target.size() != region.size() {
                return Err(MemoryError::InvalidPlacement(format!(
                    "lease at {} resized from {} to {} bytes",
                    region.offset(),
                    region.size(),
                    target.size()
                )));
            }
            if target.offset() % alignment != 0 {
                return Err(MemoryError::InvalidPlacement(format!(
                    "offset {} breaks alignment {alignment}",
                    target.offset()
                )));
            }
            if target.end() > self.size {
                return Err(MemoryError::InvalidPlacement(format!(
                    "region [{}, {}) exceeds heap size {}",
                    target.offset(),
                    target.end(),
                    self.size
                )));
            }
        }

        let mut sorted = placement.to_vec();
        sorted.sort();
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0].overlaps(&pair[1])) {
            return Err(MemoryError::InvalidPlacement(format!(
                "regions at {} and {} overlap",
                pair[0].offset(),
                pair[1].offset()
            )));
        }
        Ok(())
    }

    /// Current fragmentation score of the free space.
    pub fn fragmentation(&self) -> f32 {
        let state = self.state.lock();
        self.fragmentation_analyzer
            .fragmentation(&state.free, self.size)
    }

    /// Usage statistics, taken under the heap lock.
    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        let snapshot = self.snapshot(&state);
        HeapStats {
            size: self.size,
            occupied: state.occupied,
            free_bytes: state.free.total_bytes(),
            lease_count: state.leases.len(),
            free_regions: snapshot.free_regions,
            largest_free: snapshot.largest_free,
            fragmentation: snapshot.fragmentation,
            defragmentations: state.defragmentations,
            failed_leases: state.failed_leases,
        }
    }

    /// Free regions in ascending offset order.
    pub fn free_regions(&self) -> Vec<MemoryRegion> {
        self.state.lock().free.regions()
    }

    /// Regions of live leases in ascending offset order.
    pub fn lease_regions(&self) -> Vec<MemoryRegion> {
        self.state
            .lock()
            .leases
            .values()
            .map(|slot| slot.region())
            .collect()
    }

    /// Check the heap's bookkeeping invariants.
    ///
    /// Free and leased regions must be pairwise disjoint, their sizes must sum
    /// to the heap size, every lease must be keyed by its own offset and honor
    /// its alignment.
    pub fn verify(&self) -> Result<(), MemoryError> {
        let state = self.state.lock();

        let mut regions: Vec<MemoryRegion> = state.free.regions();
        let mut leased = 0;
        for (&key, slot) in &state.leases {
            let region = slot.region();
            if key != region.offset() {
                return Err(MemoryError::Corrupted(format!(
                    "lease {:?} keyed at {key} but located at {}",
                    slot.id(),
                    region.offset()
                )));
            }
            if region.offset() % slot.alignment() != 0 {
                return Err(MemoryError::Corrupted(format!(
                    "lease {:?} at {} breaks alignment {}",
                    slot.id(),
                    region.offset(),
                    slot.alignment()
                )));
            }
            leased += region.size();
            regions.push(region);
        }

        if leased != state.occupied {
            return Err(MemoryError::Corrupted(format!(
                "occupied counter {} but leases hold {leased} bytes",
                state.occupied
            )));
        }
        let total = leased + state.free.total_bytes();
        if total != self.size {
            return Err(MemoryError::Corrupted(format!(
                "free + leased = {total} bytes, heap size {}",
                self.size
            )));
        }

        regions.sort();
        for pair in regions.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(MemoryError::Corrupted(format!(
                    "[{}, {}) overlaps [{}, {})",
                    pair[0].offset(),
                    pair[0].end(),
                    pair[1].offset(),
                    pair[1].end()
                )));
            }
        }
        if regions.last().is_some_and(|r| r.end() > self.size) {
            return Err(MemoryError::Corrupted("region past heap end".to_string()));
        }
        Ok(())
    }

    fn snapshot(&self, state: &HeapState) -> HeapSnapshot {
        HeapSnapshot {
            heap_size: self.size,
            occupied: state.occupied,
            lease_count: state.leases.len(),
            free_regions: state.free.len(),
            largest_free: state.free.largest().map_or(0, |r| r.size()),
            fragmentation: self
                .fragmentation_analyzer
                .fragmentation(&state.free, self.size),
        }
    }

    fn plot(&self, state: &HeapState) {
        redlilium_core::profile_plot!("gpu: heap occupied bytes", state.occupied);
        redlilium_core::profile_plot!("gpu: heap free regions", state.free.len());
    }
}

fn publish(pending: PendingChanges) {
    for (slot, change) in pending {
        slot.notify(&change);
    }
}

impl fmt::Debug for MemoryHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHeap")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("properties", &self.properties)
            .field("strategy", &self.strategy)
            .finish()
    }
}

static_assertions::assert_impl_all!(MemoryHeap: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        DummyDeviceAllocator, FragmentationThresholdAnalyzer, PackingDefragmenter,
    };
    use std::sync::atomic::AtomicUsize;

    fn heap(size: u64) -> Arc<MemoryHeap> {
        heap_with(HeapDescriptor::generic(
            "test",
            size,
            MemoryProperties::HOST_VISIBLE,
            Arc::new(DummyDeviceAllocator::new()),
        ))
    }

    fn heap_with(descriptor: HeapDescriptor) -> Arc<MemoryHeap> {
        MemoryHeap::new(descriptor).unwrap()
    }

    /// Defragmenter that ignores alignment and shifts everything by one byte.
    #[derive(Debug)]
    struct BrokenDefragmenter;

    impl Defragmenter for BrokenDefragmenter {
        fn compact(&self, entries: &[(MemoryRegion, u64)]) -> Vec<MemoryRegion> {
            entries
                .iter()
                .map(|(r, _)| MemoryRegion::new(r.offset() + 1, r.size()))
                .collect()
        }
    }

    #[test]
    fn test_failed_compaction_counts_as_failed_lease() {
        // The budget leaves no room for the compaction target.
        let heap = heap_with(
            HeapDescriptor::generic(
                "test",
                1024,
                MemoryProperties::HOST_VISIBLE,
                Arc::new(DummyDeviceAllocator::with_budget(1024)),
            )
            .with_analyzers(Vec::new()),
        );
        let leases: Vec<Lease> = (0..8).map(|_| heap.lease(128, 1).unwrap()).collect();
        let kept: Vec<Lease> = leases
            .into_iter()
            .enumerate()
            .filter_map(|(i, lease)| (i % 2 == 1).then_some(lease))
            .collect();

        assert!(matches!(
            heap.lease(384, 1),
            Err(MemoryError::AllocationFailed(_))
        ));
        let stats = heap.stats();
        assert_eq!(stats.failed_leases, 1);
        assert_eq!(stats.defragmentations, 0);
        assert_eq!(stats.lease_count, kept.len());
        heap.verify().unwrap();
    }

    #[test]
    fn test_lease_from_empty_heap() {
        let heap = heap(1024);
        let lease = heap.lease(100, 64).unwrap();
        assert_eq!(lease.offset(), 0);
        assert_eq!(lease.size(), 100);

        let stats = heap.stats();
        assert_eq!(stats.occupied, 100);
        assert_eq!(stats.free_bytes, 924);
        assert_eq!(stats.lease_count, 1);
        heap.verify().unwrap();
    }

    #[test]
    fn test_invalid_parameters() {
        let heap = heap(1024);
        assert!(matches!(
            heap.lease(0, 16),
            Err(MemoryError::InvalidParameter(_))
        ));
        assert!(matches!(
            heap.lease(16, 3),
            Err(MemoryError::InvalidParameter(_))
        ));
        assert!(matches!(
            heap.lease(16, 0),
            Err(MemoryError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_best_fit_prefers_smallest_region() {
        let heap = heap(1024);
        let a = heap.lease(128, 1).unwrap();
        let _b = heap.lease(64, 1).unwrap();
        let c = heap.lease(256, 1).unwrap();
        let _d = heap.lease(64, 1).unwrap();
        // Free: [0,128), [192,448) and [512,1024).
        a.dispose();
        c.dispose();

        let small = heap.lease(100, 1).unwrap();
        assert_eq!(small.offset(), 0);
        let medium = heap.lease(200, 1).unwrap();
        assert_eq!(medium.offset(), 192);
        heap.verify().unwrap();
    }

    #[test]
    fn test_dispose_merges_free_regions() {
        let heap = heap(1024);
        let a = heap.lease(256, 1).unwrap();
        let b = heap.lease(256, 1).unwrap();
        let c = heap.lease(256, 1).unwrap();

        a.dispose();
        c.dispose();
        assert_eq!(heap.free_regions().len(), 2);

        b.dispose();
        let free = heap.free_regions();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size(), 1024);
    }

    #[test]
    fn test_drop_releases() {
        let heap = heap(512);
        {
            let _lease = heap.lease(512, 1).unwrap();
            assert_eq!(heap.stats().free_bytes, 0);
        }
        assert_eq!(heap.stats().free_bytes, 512);
    }

    #[test]
    fn test_out_of_memory() {
        let heap = heap(256);
        let _a = heap.lease(200, 1).unwrap();
        let err = heap.lease(100, 1).unwrap_err();
        assert_eq!(
            err,
            MemoryError::OutOfMemory {
                heap: "test".into(),
                requested: 100,
                available: 56,
            }
        );
        assert_eq!(heap.stats().failed_leases, 1);
        assert_eq!(heap.stats().defragmentations, 0);
    }

    #[test]
    fn test_lease_compacts_when_fragmented() {
        let heap = heap_with(
            HeapDescriptor::generic(
                "manual",
                1024,
                MemoryProperties::HOST_VISIBLE,
                Arc::new(DummyDeviceAllocator::new()),
            )
            .with_analyzers(Vec::new()),
        );
        let leases: Vec<_> = (0..8).map(|_| heap.lease(128, 1).unwrap()).collect();
        let mut kept = Vec::new();
        for (i, lease) in leases.into_iter().enumerate() {
            if i % 2 == 0 {
                lease.dispose();
            } else {
                kept.push(lease);
            }
        }
        // 512 bytes free but in 128-byte pieces.
        let big = heap.lease(384, 1).unwrap();
        assert_eq!(heap.stats().defragmentations, 1);
        assert_eq!(big.offset(), 512);
        for (i, lease) in kept.iter().enumerate() {
            assert_eq!(lease.offset(), i as u64 * 128);
        }
        heap.verify().unwrap();
    }

    #[test]
    fn test_defragment_notifies_each_lease_once() {
        let heap = heap(1024);
        let a = heap.lease(100, 16).unwrap();
        let b = heap.lease(100, 16).unwrap();
        let c = heap.lease(100, 16).unwrap();
        a.dispose();

        let notified = Arc::new(AtomicUsize::new(0));
        for lease in [&b, &c] {
            let notified = Arc::clone(&notified);
            lease.subscribe(move |_| {
                notified.fetch_add(1, Ordering::SeqCst);
            });
        }

        let report = heap.defragment().unwrap();
        assert_eq!(report.leases, 2);
        assert_eq!(report.moved, 2);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        assert_eq!(b.offset(), 0);
        assert_eq!(c.offset(), 112);
        assert_eq!(b.generation(), 1);
        heap.verify().unwrap();
    }

    #[test]
    fn test_defragment_copies_contents() {
        let heap = heap(256);
        let a = heap.lease(64, 1).unwrap();
        let b = heap.lease(64, 1).unwrap();
        b.map().unwrap();
        b.write(0, b"lilium").unwrap();
        let old_memory = b.memory().id();
        a.dispose();

        heap.defragment().unwrap();
        assert_eq!(b.offset(), 0);
        assert_ne!(b.memory().id(), old_memory);

        let mut out = [0u8; 6];
        b.read(0, &mut out).unwrap();
        assert_eq!(&out, b"lilium");
    }

    #[test]
    fn test_defragment_rejects_invalid_placement() {
        let heap = heap_with(
            HeapDescriptor::generic(
                "broken",
                1024,
                MemoryProperties::DEVICE_LOCAL,
                Arc::new(DummyDeviceAllocator::new()),
            )
            .with_defragmenter(BrokenDefragmenter),
        );
        let lease = heap.lease(64, 64).unwrap();

        assert!(matches!(
            heap.defragment(),
            Err(MemoryError::InvalidPlacement(_))
        ));
        assert_eq!(lease.offset(), 0);
        assert_eq!(heap.stats().defragmentations, 0);
        heap.verify().unwrap();
    }

    #[test]
    fn test_failed_backing_allocation_keeps_heap_intact() {
        // Budget covers the heap once, so compaction cannot allocate.
        let heap = heap_with(HeapDescriptor::generic(
            "tight",
            512,
            MemoryProperties::HOST_VISIBLE,
            Arc::new(DummyDeviceAllocator::with_budget(512)),
        ));
        let a = heap.lease(128, 1).unwrap();
        let _b = heap.lease(128, 1).unwrap();
        a.dispose();

        assert!(matches!(
            heap.lease(300, 1),
            Err(MemoryError::AllocationFailed(_))
        ));
        heap.verify().unwrap();
    }

    #[test]
    fn test_analyzer_compacts_after_free() {
        let heap = heap_with(
            HeapDescriptor::generic(
                "eager",
                1024,
                MemoryProperties::HOST_VISIBLE,
                Arc::new(DummyDeviceAllocator::new()),
            )
            .with_defragmenter(PackingDefragmenter)
            .with_analyzer(FragmentationThresholdAnalyzer::new(0.1, 2)),
        );
        let a = heap.lease(128, 1).unwrap();
        let b = heap.lease(128, 1).unwrap();
        a.dispose();
        // Free regions: [0,128) and [256,1024) -> compaction kicks in.
        assert_eq!(heap.stats().defragmentations, 1);
        assert_eq!(b.offset(), 0);
        assert_eq!(heap.free_regions().len(), 1);
    }

    #[test]
    fn test_observer_may_lease_during_notification() {
        let heap = heap(1024);
        let a = heap.lease(128, 1).unwrap();
        let b = heap.lease(128, 1).unwrap();
        a.dispose();

        let nested = Arc::new(parking_lot::Mutex::new(None));
        {
            let heap = Arc::clone(&heap);
            let nested = Arc::clone(&nested);
            b.subscribe(move |_| {
                *nested.lock() = Some(heap.lease(64, 1).unwrap());
            });
        }
        heap.defragment().unwrap();
        assert!(nested.lock().is_some());
        heap.verify().unwrap();
    }
}
