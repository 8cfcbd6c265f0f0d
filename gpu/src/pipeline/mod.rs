//! Frame pipeline for running task graphs with multiple frames in flight.
//!
//! [`FramePipeline`] owns one baked [`TaskGraph`] per frame slot and the fence
//! that marks the end of that slot's frame. While the device works on frame
//! N, the host can already run frame N+1 in the next slot; it only blocks
//! when it comes back around to a slot whose previous frame is still in
//! flight.
//!
//! ```text
//! frames_in_flight = 2
//!
//! Slot 0: [Frame 0] ──► [Frame 2] ──► [Frame 4] ──►
//! Slot 1: [Frame 1] ──► [Frame 3] ──► [Frame 5] ──►
//! ```
//!
//! The slot fence is usually the completion fence of the graph's final task,
//! so it is reset when that task starts and signaled when its work finishes.

use std::time::{Duration, Instant};

use crate::tasks::{
    CompositeTaskGraph, ExecutionReport, ExecutionStrategy, Fence, GraphError, TaskGraph,
};

/// Runs one task graph per frame, rotating through frame slots.
///
/// # Thread Safety
///
/// `FramePipeline` is **not thread-safe**. It should be owned by a single
/// thread (typically the main/render thread).
///
/// # Example
///
/// ```
/// use redlilium_gpu::pipeline::FramePipeline;
/// use redlilium_gpu::tasks::{ExecutionStrategy, Fence, Task, TaskGraph};
///
/// let slots = (0..2)
///     .map(|i| {
///         let fence = Fence::new_unsignaled();
///         let mut graph = TaskGraph::new(format!("frame {i}"));
///         graph.add_task(Task::new("present", |_| Ok(())).with_completion(fence.clone()));
///         (graph, fence)
///     })
///     .collect();
///
/// let mut pipeline = FramePipeline::new(slots, ExecutionStrategy::Parallel).unwrap();
/// for _ in 0..4 {
///     pipeline.run_frame().unwrap();
/// }
/// pipeline.wait_idle();
/// assert_eq!(pipeline.frame_count(), 4);
/// ```
#[derive(Debug)]
pub struct FramePipeline {
    /// One baked graph per frame slot; the active member is the current slot.
    graphs: CompositeTaskGraph,

    /// Fence marking the end of each slot's frame.
    frame_fences: Vec<Fence>,

    /// Whether each slot has run a frame yet.
    used: Vec<bool>,

    /// How graphs are executed.
    strategy: ExecutionStrategy,

    /// Total frames started.
    frame_count: u64,
}

impl FramePipeline {
    /// Create a pipeline with one slot per `(graph, frame fence)` pair and bake
    /// every graph.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is empty.
    pub fn new(
        slots: Vec<(TaskGraph, Fence)>,
        strategy: ExecutionStrategy,
    ) -> Result<Self, GraphError> {
        assert!(!slots.is_empty(), "frames_in_flight must be at least 1");

        let (graphs, frame_fences): (Vec<_>, Vec<_>) = slots.into_iter().unzip();
        let used = vec![false; graphs.len()];
        let mut graphs = CompositeTaskGraph::from_graphs(graphs);
        graphs.bake_all()?;

        log::debug!("Frame pipeline ready with {} slots", frame_fences.len());
        Ok(Self {
            graphs,
            frame_fences,
            used,
            strategy,
            frame_count: 0,
        })
    }

    /// Run the next frame.
    ///
    /// Waits until the current slot's previous frame has finished, executes
    /// the slot's graph and advances to the next slot. The slot advances even
    /// if tasks fail, so one bad frame does not stall the rotation.
    pub fn run_frame(&mut self) -> Result<ExecutionReport, GraphError> {
        redlilium_core::profile_scope!("gpu: run frame");

        let slot = self.graphs.active();
        if self.used[slot] {
            self.frame_fences[slot].wait();
        }
        self.execute_slot(slot)
    }

    /// Like [`run_frame`](Self::run_frame), but returns `Ok(None)` without
    /// running anything if the slot is still busy after `timeout`.
    pub fn run_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ExecutionReport>, GraphError> {
        let slot = self.graphs.active();
        if self.used[slot] && !self.frame_fences[slot].wait_timeout(timeout) {
            log::warn!("Frame slot {slot} still busy after {timeout:?}");
            return Ok(None);
        }
        self.execute_slot(slot).map(Some)
    }

    fn execute_slot(&mut self, slot: usize) -> Result<ExecutionReport, GraphError> {
        self.frame_count += 1;
        log::trace!("Begin frame {} (slot {})", self.frame_count, slot);

        let result = self.graphs.execute(self.strategy);
        self.used[slot] = true;
        self.graphs.advance();

        log::trace!("End frame {} (slot {})", self.frame_count, slot);
        redlilium_core::frame_mark!();
        result
    }

    /// Wait until every slot that has run a frame has finished it.
    pub fn wait_idle(&self) {
        log::trace!("Waiting for idle ({} slots)", self.frame_fences.len());
        for fence in self.used_fences() {
            fence.wait();
        }
    }

    /// Wait for idle with a timeout across all slots.
    ///
    /// Returns `true` if every used slot finished in time.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        for fence in self.used_fences() {
            let elapsed = start.elapsed();
            if elapsed >= timeout || !fence.wait_timeout(timeout - elapsed) {
                return false;
            }
        }
        true
    }

    fn used_fences(&self) -> impl Iterator<Item = &Fence> {
        self.frame_fences
            .iter()
            .zip(&self.used)
            .filter_map(|(fence, &used)| used.then_some(fence))
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frame_fences.len()
    }

    /// Slot the next frame will run in.
    pub fn current_slot(&self) -> usize {
        self.graphs.active()
    }

    /// Total frames started.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The graph of a slot.
    pub fn graph(&self, slot: usize) -> Option<&TaskGraph> {
        self.graphs.graph(slot)
    }

    /// Check if a slot can run a frame without blocking.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn is_slot_ready(&self, slot: usize) -> bool {
        assert!(slot < self.frame_fences.len(), "Invalid slot index");
        !self.used[slot] || self.frame_fences[slot].is_signaled()
    }

    /// Check if every slot is ready (non-blocking).
    pub fn is_idle(&self) -> bool {
        self.used_fences().all(Fence::is_signaled)
    }
}
