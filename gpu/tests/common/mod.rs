//! Shared fixtures for the GPU integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use redlilium_gpu::memory::{DummyDeviceAllocator, HeapDescriptor, MemoryHeap, MemoryRegion};
use redlilium_gpu::types::MemoryProperties;

/// Route `log` output through the test harness and initialize the crate
/// once per test binary.
pub fn init_logging() {
    if env_logger::builder().is_test(true).try_init().is_ok() {
        redlilium_gpu::init();
    }
}

/// Host-visible heap with automatic compaction disabled, so tests decide
/// when compaction runs.
pub fn manual_heap(size: u64) -> Arc<MemoryHeap> {
    init_logging();
    MemoryHeap::new(
        HeapDescriptor::generic(
            "test",
            size,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            Arc::new(DummyDeviceAllocator::new()),
        )
        .with_analyzers(Vec::new()),
    )
    .expect("heap creation")
}

/// Check that leases and free regions tile the heap exactly.
pub fn assert_tiled(heap: &MemoryHeap) {
    let leases = heap.lease_regions();
    let free = heap.free_regions();

    let mut all: Vec<MemoryRegion> = leases.iter().chain(free.iter()).copied().collect();
    all.sort_by_key(|r| r.offset());
    for pair in all.windows(2) {
        assert!(
            !pair[0].overlaps(&pair[1]),
            "{:?} overlaps {:?}",
            pair[0],
            pair[1]
        );
    }

    let leased: u64 = leases.iter().map(|r| r.size()).sum();
    let free_bytes: u64 = free.iter().map(|r| r.size()).sum();
    assert_eq!(leased + free_bytes, heap.size());
    heap.verify().expect("heap invariants");
}
