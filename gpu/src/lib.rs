//! # RedLilium GPU
//!
//! Device memory leasing and task graph execution for RedLilium.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`MemoryLessor`] - Fixed set of device heaps handing out relocatable [`Lease`]s
//! - [`TaskGraph`] - Dependency graph of device tasks, baked once and executed every frame
//! - [`FramePipeline`] - Rotates baked graphs across frames in flight
//! - [`LeasedBuffer`] - Buffer that follows its lease through heap compaction
//! - [`GpuConfig`] - TOML configuration for heaps and execution
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use redlilium_gpu::{ExecutionStrategy, GpuConfig, Semaphore, Task, TaskGraph};
//! use redlilium_gpu::memory::DummyDeviceAllocator;
//!
//! let config = GpuConfig::from_toml_str(
//!     r#"
//!     [[heap]]
//!     id = "staging"
//!     size = 65536
//!     properties = ["host_visible"]
//!     "#,
//! )
//! .unwrap();
//! let lessor = config.build_lessor(Arc::new(DummyDeviceAllocator::new())).unwrap();
//! let staging = lessor.lease("staging", 1024, 256).unwrap();
//!
//! let mut graph = TaskGraph::new("upload");
//! let copy = graph.add_task(Task::new("copy", |_| Ok(())).with_signal(Semaphore::new()));
//! let draw = graph.add_task(Task::new("draw", |_| Ok(())));
//! graph.add_dependency(draw, copy).unwrap();
//! graph.bake().unwrap();
//! graph.execute(ExecutionStrategy::Parallel).unwrap();
//!
//! staging.dispose();
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod resources;
pub mod tasks;
pub mod types;

// Re-export main types for convenience
pub use config::GpuConfig;
pub use error::GpuError;
pub use memory::{HeapDescriptor, Lease, MemoryError, MemoryHeap, MemoryLessor, MemoryRegion};
pub use pipeline::FramePipeline;
pub use resources::{DependencyTracker, LeasedBuffer, ResourceHandle};
pub use tasks::{
    CompositeTaskGraph, ExecutionStrategy, Fence, GraphError, Semaphore, Task, TaskGraph,
    TaskHandle,
};
pub use types::{BufferDescriptor, BufferUsage, MemoryProperties, PipelineStages};

/// GPU library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the GPU subsystem.
///
/// This should be called before using any GPU functionality.
pub fn init() {
    log::info!("RedLilium GPU v{} initialized", VERSION);
}
