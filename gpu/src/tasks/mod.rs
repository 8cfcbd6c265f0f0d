//! Dependency-ordered GPU task execution.
//!
//! A [`TaskGraph`] owns [`Task`]s and the edges between them. Baking sorts
//! the tasks and wires cross-task synchronization once; executing reuses the
//! plan every frame.
//!
//! # Architecture
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Pipeline | [`FramePipeline`](crate::pipeline::FramePipeline) | Multiple frames in flight |
//! | Composite | [`CompositeTaskGraph`] | Switch between prebaked graphs |
//! | **Graph** | [`TaskGraph`] | Task order and wait-lists (this module) |
//! | Task | [`Task`] | One unit of host or device work |
//!
//! # Synchronization Model
//!
//! | Level | Primitive | Purpose |
//! |-------|-----------|---------|
//! | Task → Task | [`Semaphore`] | Timeline value reserved per execution |
//! | Task → Host | [`Fence`] | Completion of a single task |
//! | Frame → Frame | [`Fence`] | Bounds frames in flight |

mod composite;
mod graph;
mod sync;
mod task;
mod thread_pool;

pub use composite::CompositeTaskGraph;
pub use graph::{
    ExecutionReport, ExecutionStrategy, GraphError, TaskFailure, TaskGraph, TaskHandle,
};
pub use sync::{Fence, FenceStatus, Semaphore};
pub use task::{CompletionSignal, Task, TaskContext, TaskError, TaskFn};
pub use thread_pool::{Scope, ThreadPool};
