//! TOML configuration for heaps and task graph execution.
//!
//! ```toml
//! [[heap]]
//! id = "staging"
//! size = 16777216
//! properties = ["host_visible", "host_coherent"]
//!
//! [[heap]]
//! id = "image"
//! size = 268435456
//! strategy = "resource_sized"
//! requirements = { size = 268435456, alignment = 65536 }
//! fragmentation_threshold = 0.6
//!
//! [graph]
//! strategy = "parallel"
//! frames_in_flight = 3
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::GpuError;
use crate::memory::{
    AllocationStrategy, DeviceAllocator, FragmentationThresholdAnalyzer, HeapAnalyzer,
    HeapDescriptor, MemoryLessor,
};
use crate::pipeline::FramePipeline;
use crate::tasks::{ExecutionStrategy, Fence, TaskGraph, ThreadPool};
use crate::types::{MemoryProperties, MemoryRequirements};

/// Top-level configuration (`gpu.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GpuConfig {
    /// Heaps to create at startup.
    #[serde(default, rename = "heap")]
    pub heaps: Vec<HeapConfig>,
    /// Task graph execution settings.
    #[serde(default)]
    pub graph: GraphConfig,
}

/// One `[[heap]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HeapConfig {
    pub id: String,
    pub size: u64,
    /// Memory property flag names, e.g. `"device_local"`.
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Required when `strategy = "resource_sized"`.
    #[serde(default)]
    pub requirements: Option<RequirementsConfig>,
    #[serde(default = "default_fragmentation_threshold")]
    pub fragmentation_threshold: f32,
    #[serde(default = "default_min_free_regions")]
    pub min_free_regions: usize,
    /// Compact automatically when the threshold analyzer asks for it.
    #[serde(default = "default_true")]
    pub auto_defragment: bool,
}

/// How a heap's backing memory is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Generic,
    ResourceSized,
}

/// Resource memory requirements for `resource_sized` heaps.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RequirementsConfig {
    pub size: u64,
    #[serde(default = "default_alignment")]
    pub alignment: u64,
    #[serde(default = "default_memory_type_bits")]
    pub memory_type_bits: u32,
}

/// The `[graph]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub strategy: GraphStrategyKind,
    /// Sequential mode only: skip remaining tasks after the first failure.
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    /// Stack size of parallel workers, in bytes.
    #[serde(default)]
    pub worker_stack_size: Option<usize>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            strategy: GraphStrategyKind::default(),
            stop_on_failure: true,
            frames_in_flight: default_frames_in_flight(),
            worker_stack_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStrategyKind {
    #[default]
    Sequential,
    Parallel,
}

fn default_fragmentation_threshold() -> f32 {
    FragmentationThresholdAnalyzer::DEFAULT_THRESHOLD
}

fn default_min_free_regions() -> usize {
    FragmentationThresholdAnalyzer::DEFAULT_MIN_FREE_REGIONS
}

fn default_true() -> bool {
    true
}

fn default_alignment() -> u64 {
    1
}

fn default_memory_type_bits() -> u32 {
    u32::MAX
}

fn default_frames_in_flight() -> usize {
    2
}

impl GpuConfig {
    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, GpuError> {
        let config: Self =
            toml::from_str(content).map_err(|e| GpuError::Config(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, GpuError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GpuError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            GpuError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        log::info!(
            "Loaded GPU config from {} ({} heaps)",
            path.display(),
            config.heaps.len()
        );
        Ok(config)
    }

    /// Check values serde cannot.
    ///
    /// Duplicate heap ids are left to [`MemoryLessor::new`].
    pub fn validate(&self) -> Result<(), GpuError> {
        for heap in &self.heaps {
            heap.validate()?;
        }
        if self.graph.frames_in_flight == 0 {
            return Err(GpuError::Config(
                "graph.frames_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Build heap descriptors, all backed by `allocator`.
    pub fn heap_descriptors(
        &self,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<Vec<HeapDescriptor>, GpuError> {
        self.heaps
            .iter()
            .map(|heap| heap.descriptor(allocator))
            .collect()
    }

    /// Create every configured heap.
    pub fn build_lessor(&self, allocator: Arc<dyn DeviceAllocator>) -> Result<MemoryLessor, GpuError> {
        let descriptors = self.heap_descriptors(&allocator)?;
        Ok(MemoryLessor::new(descriptors)?)
    }

    /// Execution strategy for task graphs.
    pub fn execution_strategy(&self) -> ExecutionStrategy {
        match self.graph.strategy {
            GraphStrategyKind::Sequential => ExecutionStrategy::Sequential {
                stop_on_failure: self.graph.stop_on_failure,
            },
            GraphStrategyKind::Parallel => ExecutionStrategy::Parallel,
        }
    }

    /// Thread pool for parallel execution.
    pub fn thread_pool(&self) -> ThreadPool {
        match self.graph.worker_stack_size {
            Some(bytes) => ThreadPool::with_stack_size(bytes),
            None => ThreadPool::new(),
        }
    }

    /// Build a frame pipeline with `frames_in_flight` slots.
    ///
    /// `build` is called once per slot index and returns the slot's graph and
    /// frame fence. Each graph gets its own [`thread_pool`](Self::thread_pool)
    /// and runs with the configured [`execution_strategy`](Self::execution_strategy).
    pub fn frame_pipeline<F>(&self, mut build: F) -> Result<FramePipeline, GpuError>
    where
        F: FnMut(usize) -> (TaskGraph, Fence),
    {
        let slots = (0..self.graph.frames_in_flight)
            .map(|slot| {
                let (graph, fence) = build(slot);
                (graph.with_thread_pool(self.thread_pool()), fence)
            })
            .collect();
        Ok(FramePipeline::new(slots, self.execution_strategy())?)
    }
}

impl HeapConfig {
    fn validate(&self) -> Result<(), GpuError> {
        if self.id.is_empty() {
            return Err(GpuError::Config("heap id must not be empty".to_string()));
        }
        if self.size == 0 {
            return Err(GpuError::Config(format!(
                "heap '{}' must have a non-zero size",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.fragmentation_threshold) {
            return Err(GpuError::Config(format!(
                "heap '{}': fragmentation_threshold {} is outside [0, 1]",
                self.id, self.fragmentation_threshold
            )));
        }
        self.memory_properties()?;
        match (self.strategy, &self.requirements) {
            (StrategyKind::ResourceSized, None) => Err(GpuError::Config(format!(
                "heap '{}' is resource_sized but has no requirements",
                self.id
            ))),
            (_, Some(req)) if !req.alignment.is_power_of_two() => Err(GpuError::Config(format!(
                "heap '{}': alignment {} is not a power of two",
                self.id, req.alignment
            ))),
            _ => Ok(()),
        }
    }

    /// Combined memory property flags.
    pub fn memory_properties(&self) -> Result<MemoryProperties, GpuError> {
        if self.properties.is_empty() {
            return Ok(MemoryProperties::default());
        }
        self.properties
            .iter()
            .try_fold(MemoryProperties::empty(), |acc, name| {
                MemoryProperties::parse_flag(name)
                    .map(|flag| acc | flag)
                    .ok_or_else(|| {
                        GpuError::Config(format!(
                            "heap '{}': unknown memory property '{name}'",
                            self.id
                        ))
                    })
            })
    }

    fn descriptor(&self, allocator: &Arc<dyn DeviceAllocator>) -> Result<HeapDescriptor, GpuError> {
        self.validate()?;
        let allocator = Arc::clone(allocator);
        let strategy = match (self.strategy, self.requirements) {
            (StrategyKind::ResourceSized, Some(req)) => AllocationStrategy::resource_sized(
                allocator,
                MemoryRequirements::new(req.size, req.alignment)
                    .with_memory_type_bits(req.memory_type_bits),
            ),
            _ => AllocationStrategy::generic(allocator),
        };

        let descriptor =
            HeapDescriptor::new(self.id.clone(), self.size, self.memory_properties()?, strategy);
        let analyzers: Vec<Box<dyn HeapAnalyzer>> = if self.auto_defragment {
            vec![Box::new(FragmentationThresholdAnalyzer::new(
                self.fragmentation_threshold,
                self.min_free_regions,
            ))]
        } else {
            Vec::new()
        };
        Ok(descriptor.with_analyzers(analyzers))
    }
}
