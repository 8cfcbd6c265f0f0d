//! Heap descriptors and the heap registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::MemoryError;
use super::device::{AllocationStrategy, DeviceAllocator};
use super::heap::{HeapStats, MemoryHeap};
use super::lease::Lease;
use super::policy::{
    Defragmenter, FragmentationAnalyzer, FragmentationThresholdAnalyzer, HeapAnalyzer,
    LargestBlockFragmentation, PackingDefragmenter,
};
use crate::types::MemoryProperties;

/// Description of a heap to create.
///
/// Policies default to [`LargestBlockFragmentation`], [`PackingDefragmenter`]
/// and a single [`FragmentationThresholdAnalyzer`].
pub struct HeapDescriptor {
    /// Heap identifier used to route lease requests.
    pub id: String,
    /// Total heap size in bytes.
    pub size: u64,
    /// Properties of the backing memory.
    pub properties: MemoryProperties,
    /// How the backing allocation is obtained.
    pub strategy: AllocationStrategy,
    /// Fragmentation metric.
    pub fragmentation_analyzer: Box<dyn FragmentationAnalyzer>,
    /// Compaction placement policy.
    pub defragmenter: Box<dyn Defragmenter>,
    /// Policies consulted after every free.
    pub analyzers: Vec<Box<dyn HeapAnalyzer>>,
}

impl HeapDescriptor {
    /// Create a descriptor with default policies.
    pub fn new(
        id: impl Into<String>,
        size: u64,
        properties: MemoryProperties,
        strategy: AllocationStrategy,
    ) -> Self {
        Self {
            id: id.into(),
            size,
            properties,
            strategy,
            fragmentation_analyzer: Box::new(LargestBlockFragmentation),
            defragmenter: Box::new(PackingDefragmenter),
            analyzers: vec![Box::new(FragmentationThresholdAnalyzer::default())],
        }
    }

    /// Create a descriptor backed by a generic allocation of exactly `size` bytes.
    pub fn generic(
        id: impl Into<String>,
        size: u64,
        properties: MemoryProperties,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Self {
        Self::new(id, size, properties, AllocationStrategy::generic(allocator))
    }

    /// Replace the fragmentation metric.
    pub fn with_fragmentation_analyzer(
        mut self,
        analyzer: impl FragmentationAnalyzer + 'static,
    ) -> Self {
        self.fragmentation_analyzer = Box::new(analyzer);
        self
    }

    /// Replace the compaction placement policy.
    pub fn with_defragmenter(mut self, defragmenter: impl Defragmenter + 'static) -> Self {
        self.defragmenter = Box::new(defragmenter);
        self
    }

    /// Add a policy consulted after every free.
    pub fn with_analyzer(mut self, analyzer: impl HeapAnalyzer + 'static) -> Self {
        self.analyzers.push(Box::new(analyzer));
        self
    }

    /// Replace all post-free policies. An empty list disables automatic
    /// compaction after frees.
    pub fn with_analyzers(mut self, analyzers: Vec<Box<dyn HeapAnalyzer>>) -> Self {
        self.analyzers = analyzers;
        self
    }
}

impl fmt::Debug for HeapDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapDescriptor")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("properties", &self.properties)
            .field("strategy", &self.strategy)
            .field("fragmentation_analyzer", &self.fragmentation_analyzer)
            .field("defragmenter", &self.defragmenter)
            .field("analyzers", &self.analyzers.len())
            .finish()
    }
}

/// Registry of heaps, keyed by resource class.
///
/// All heaps are created up front; a request for an unknown id fails instead
/// of creating a heap on demand.
#[derive(Debug)]
pub struct MemoryLessor {
    heaps: HashMap<String, Arc<MemoryHeap>>,
}

impl MemoryLessor {
    /// Create every heap described by `descriptors`.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::DuplicateHeap`] if two descriptors share an id.
    /// - Any error from creating a heap's backing allocation.
    pub fn new(descriptors: Vec<HeapDescriptor>) -> Result<Self, MemoryError> {
        redlilium_core::profile_function!();

        let mut heaps = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if heaps.contains_key(&descriptor.id) {
                return Err(MemoryError::DuplicateHeap(descriptor.id));
            }
            let id = descriptor.id.clone();
            heaps.insert(id, MemoryHeap::new(descriptor)?);
        }
        log::info!("Memory lessor ready with {} heaps", heaps.len());
        Ok(Self { heaps })
    }

    /// Lease `size` bytes aligned to `alignment` from the heap `group_id`.
    pub fn lease(&self, group_id: &str, size: u64, alignment: u64) -> Result<Lease, MemoryError> {
        self.heap(group_id)
            .ok_or_else(|| MemoryError::UnknownHeap(group_id.to_string()))?
            .lease(size, alignment)
    }

    /// Get a heap by id.
    pub fn heap(&self, id: &str) -> Option<&Arc<MemoryHeap>> {
        self.heaps.get(id)
    }

    /// Ids of all heaps, sorted.
    pub fn heap_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.heaps.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Statistics of every heap, sorted by id.
    pub fn stats(&self) -> Vec<(String, HeapStats)> {
        let mut stats: Vec<_> = self
            .heaps
            .iter()
            .map(|(id, heap)| (id.clone(), heap.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

static_assertions::assert_impl_all!(MemoryLessor: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DummyDeviceAllocator;

    fn lessor() -> MemoryLessor {
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(DummyDeviceAllocator::new());
        MemoryLessor::new(vec![
            HeapDescriptor::generic(
                "staging",
                4096,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
                Arc::clone(&allocator),
            ),
            HeapDescriptor::generic("image", 8192, MemoryProperties::DEVICE_LOCAL, allocator),
        ])
        .unwrap()
    }

    #[test]
    fn test_routes_by_id() {
        let lessor = lessor();
        let lease = lessor.lease("image", 1024, 256).unwrap();
        assert_eq!(lease.heap_id(), "image");
        assert_eq!(lessor.heap("image").unwrap().stats().occupied, 1024);
        assert_eq!(lessor.heap("staging").unwrap().stats().occupied, 0);
    }

    #[test]
    fn test_unknown_heap() {
        let lessor = lessor();
        assert_eq!(
            lessor.lease("vertex", 16, 1).unwrap_err(),
            MemoryError::UnknownHeap("vertex".into())
        );
        assert!(lessor.heap("vertex").is_none());
    }

    #[test]
    fn test_duplicate_heap() {
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(DummyDeviceAllocator::new());
        let err = MemoryLessor::new(vec![
            HeapDescriptor::generic("a", 64, MemoryProperties::DEVICE_LOCAL, Arc::clone(&allocator)),
            HeapDescriptor::generic("a", 64, MemoryProperties::DEVICE_LOCAL, allocator),
        ])
        .unwrap_err();
        assert_eq!(err, MemoryError::DuplicateHeap("a".into()));
    }

    #[test]
    fn test_heap_ids_and_stats_sorted() {
        let lessor = lessor();
        assert_eq!(lessor.heap_ids(), vec!["image", "staging"]);
        let stats = lessor.stats();
        assert_eq!(stats[0].0, "image");
        assert_eq!(stats[0].1.size, 8192);
        assert_eq!(stats[1].1.free_bytes, 4096);
    }

    #[test]
    fn test_map_requires_host_visible() {
        let lessor = lessor();
        let device = lessor.lease("image", 64, 1).unwrap();
        assert_eq!(
            device.map().unwrap_err(),
            MemoryError::NotHostVisible("image".into())
        );

        let staging = lessor.lease("staging", 64, 1).unwrap();
        assert_eq!(staging.write(0, &[1]).unwrap_err(), MemoryError::NotMapped);
        staging.map().unwrap();
        staging.write(60, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            staging.write(62, &[1, 2, 3, 4]),
            Err(MemoryError::OutOfBounds { offset: 62, len: 4, size: 64 })
        ));
    }
}
