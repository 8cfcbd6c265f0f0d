//! Several independently baked graphs with one active member.

use super::graph::{ExecutionReport, ExecutionStrategy, GraphError, TaskGraph};

/// A set of task graphs of which exactly one is active.
///
/// Useful for alternating between prebaked configurations (per frame slot,
/// per render mode) without rebaking. Only the active member runs on
/// [`execute`](Self::execute).
#[derive(Debug, Default)]
pub struct CompositeTaskGraph {
    graphs: Vec<TaskGraph>,
    active: usize,
}

impl CompositeTaskGraph {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a composite from existing graphs. The first graph is active.
    pub fn from_graphs(graphs: Vec<TaskGraph>) -> Self {
        Self { graphs, active: 0 }
    }

    /// Add a graph and return its index.
    pub fn push(&mut self, graph: TaskGraph) -> usize {
        self.graphs.push(graph);
        self.graphs.len() - 1
    }

    /// Number of member graphs.
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    /// Whether there are no member graphs.
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Index of the active graph.
    pub fn active(&self) -> usize {
        self.active
    }

    /// The active graph, if any.
    pub fn active_graph(&self) -> Option<&TaskGraph> {
        self.graphs.get(self.active)
    }

    /// Get a member graph.
    pub fn graph(&self, index: usize) -> Option<&TaskGraph> {
        self.graphs.get(index)
    }

    /// Get a member graph mutably.
    pub fn graph_mut(&mut self, index: usize) -> Option<&mut TaskGraph> {
        self.graphs.get_mut(index)
    }

    /// Bake every member. Stops at the first error.
    pub fn bake_all(&mut self) -> Result<(), GraphError> {
        self.graphs.iter_mut().try_for_each(TaskGraph::bake)
    }

    /// Make the graph at `index` active.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn switch_to(&mut self, index: usize) {
        assert!(index < self.graphs.len(), "Invalid graph index");
        if index != self.active {
            log::trace!(
                "Composite graph: switching {} -> {}",
                self.active,
                index
            );
        }
        self.active = index;
    }

    /// Activate the next graph, wrapping around. Returns the new index.
    pub fn advance(&mut self) -> usize {
        if !self.graphs.is_empty() {
            self.active = (self.active + 1) % self.graphs.len();
        }
        self.active
    }

    /// Execute the active graph.
    ///
    /// An empty composite reports [`GraphError::NotBaked`].
    pub fn execute(&mut self, strategy: ExecutionStrategy) -> Result<ExecutionReport, GraphError> {
        self.graphs
            .get_mut(self.active)
            .ok_or(GraphError::NotBaked)?
            .execute(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Task;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(name: &str, counter: &Arc<AtomicUsize>) -> TaskGraph {
        let counter = Arc::clone(counter);
        let mut graph = TaskGraph::new(name);
        graph.add_task(Task::new("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        graph
    }

    #[test]
    fn test_executes_active_only() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut composite = CompositeTaskGraph::new();
        composite.push(counting("first", &first));
        composite.push(counting("second", &second));
        composite.bake_all().unwrap();

        composite.execute(ExecutionStrategy::default()).unwrap();
        composite.switch_to(1);
        composite.execute(ExecutionStrategy::default()).unwrap();
        composite.execute(ExecutionStrategy::default()).unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(composite.active_graph().unwrap().name(), "second");
    }

    #[test]
    fn test_advance_wraps() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut composite = CompositeTaskGraph::from_graphs(vec![
            counting("a", &counter),
            counting("b", &counter),
            counting("c", &counter),
        ]);
        assert_eq!(composite.advance(), 1);
        assert_eq!(composite.advance(), 2);
        assert_eq!(composite.advance(), 0);
    }

    #[test]
    fn test_members_need_baking() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut composite = CompositeTaskGraph::new();
        composite.push(counting("a", &counter));
        assert_eq!(
            composite.execute(ExecutionStrategy::Parallel),
            Err(GraphError::NotBaked)
        );
        assert_eq!(
            CompositeTaskGraph::new().execute(ExecutionStrategy::Parallel),
            Err(GraphError::NotBaked)
        );
    }

    #[test]
    #[should_panic(expected = "Invalid graph index")]
    fn test_switch_out_of_range() {
        CompositeTaskGraph::new().switch_to(0);
    }
}
