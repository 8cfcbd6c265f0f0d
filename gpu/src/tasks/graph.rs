//! Dependency-ordered task graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::sync::Semaphore;
use super::task::{SignalTargets, Task, TaskContext, TaskError, target};
use super::thread_pool::ThreadPool;
use crate::types::PipelineStages;

/// Handle to a task in a [`TaskGraph`].
///
/// `TaskHandle` is `Copy` and cheap to pass around. It is only valid within
/// the `TaskGraph` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Raw handle value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// How [`TaskGraph::execute`] runs the baked plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Run tasks one by one on the calling thread, in baked order.
    Sequential {
        /// Skip the remaining tasks after the first failure.
        stop_on_failure: bool,
    },
    /// Start every task at once on the graph's [`ThreadPool`]. Ordering comes
    /// from the baked wait-lists only.
    Parallel,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::Sequential {
            stop_on_failure: true,
        }
    }
}

/// One failed task of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Name of the task.
    pub task: String,
    /// Error returned by the task.
    pub error: TaskError,
}

/// Summary of a successful [`TaskGraph::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Cycle number of this execution, starting at 1.
    pub cycle: u64,
    /// Tasks that ran.
    pub executed: usize,
    /// Wall time spent in `execute`.
    pub duration: Duration,
}

/// Errors that can occur while building, baking or executing a task graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The graph contains a cycle through the named task.
    CyclicDependency {
        /// A task on the cycle.
        task: String,
    },
    /// The handle does not refer to a task of this graph.
    InvalidHandle(TaskHandle),
    /// Two tasks of the graph signal the same semaphore.
    SharedSignal {
        /// The second task signaling the semaphore, in baked order.
        task: String,
    },
    /// `execute` was called before `bake`.
    NotBaked,
    /// The graph changed since it was last baked.
    StalePlan,
    /// One or more tasks failed.
    TaskFailures {
        /// Every failure, in baked order.
        failures: Vec<TaskFailure>,
        /// Tasks that did not run because an earlier task failed.
        skipped: usize,
    },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CyclicDependency { task } => {
                write!(f, "task graph contains cyclic dependency through '{task}'")
            }
            Self::InvalidHandle(handle) => write!(f, "invalid task handle {}", handle.0),
            Self::SharedSignal { task } => {
                write!(f, "task '{task}' signals a semaphore already signaled in this graph")
            }
            Self::NotBaked => write!(f, "task graph has not been baked"),
            Self::StalePlan => write!(f, "task graph changed since it was baked"),
            Self::TaskFailures { failures, skipped } => {
                write!(f, "{} task(s) failed", failures.len())?;
                if *skipped > 0 {
                    write!(f, ", {skipped} skipped")?;
                }
                for failure in failures {
                    write!(f, "; {}: {}", failure.task, failure.error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for GraphError {}

#[derive(Debug)]
struct Node {
    task: Task,
    dependencies: BTreeSet<TaskHandle>,
}

/// A task in baked order with its precomputed synchronization.
#[derive(Debug)]
struct Token {
    handle: TaskHandle,
    waits: Vec<Semaphore>,
    wait_stages: PipelineStages,
}

#[derive(Debug)]
struct BakedPlan {
    tokens: Vec<Token>,
    version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// One execution: its number and the semaphore values it signals.
#[derive(Debug)]
struct Cycle {
    number: u64,
    targets: SignalTargets,
}

#[derive(Debug, Default)]
struct Outcome {
    executed: usize,
    failures: Vec<TaskFailure>,
    skipped: usize,
}

/// A set of tasks and their dependencies, baked once and executed many times.
///
/// # Construction
///
/// ```
/// use redlilium_gpu::tasks::{ExecutionStrategy, Semaphore, Task, TaskGraph};
///
/// let mut graph = TaskGraph::new("frame");
/// let shadows = graph.add_task(Task::new("shadows", |_| Ok(())).with_signal(Semaphore::new()));
/// let lighting = graph.add_task(Task::new("lighting", |_| Ok(())));
/// graph.add_dependency(lighting, shadows).unwrap();
///
/// graph.bake().unwrap();
/// assert_eq!(graph.baked_order(), Some(vec![shadows, lighting]));
///
/// let report = graph.execute(ExecutionStrategy::Parallel).unwrap();
/// assert_eq!(report.executed, 2);
/// ```
///
/// # Baking
///
/// [`bake`](Self::bake) sorts the tasks topologically and precomputes, for
/// every task, the semaphores it waits on and the union of its upstream wait
/// stages. Any structural change makes the plan stale until the next bake.
///
/// # Execution
///
/// Every execution reserves the next timeline value of each signal
/// semaphore, so semaphores shared with other graphs never satisfy a wait
/// early. Each task waits for its upstream semaphores to reach their
/// reserved values, resets its completion fence, runs, and then signals its
/// semaphore and fence, unless the task deferred completion through
/// [`TaskContext::defer_completion`]. Failed tasks are still signaled so
/// their dependants are not blocked, and so are tasks skipped after a
/// failure.
#[derive(Debug)]
pub struct TaskGraph {
    name: String,
    nodes: BTreeMap<TaskHandle, Node>,
    next_handle: u64,
    version: u64,
    plan: Option<BakedPlan>,
    cycle: u64,
    pool: ThreadPool,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            next_handle: 0,
            version: 0,
            plan: None,
            cycle: 0,
            pool: ThreadPool::new(),
        }
    }

    /// Use `pool` for parallel execution.
    pub fn with_thread_pool(mut self, pool: ThreadPool) -> Self {
        self.pool = pool;
        self
    }

    /// Graph name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a task. Marks the plan stale.
    pub fn add_task(&mut self, task: Task) -> TaskHandle {
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        self.nodes.insert(
            handle,
            Node {
                task,
                dependencies: BTreeSet::new(),
            },
        );
        self.version += 1;
        handle
    }

    /// Remove a task and every edge that points at it. Marks the plan stale.
    pub fn remove_task(&mut self, handle: TaskHandle) -> Option<Task> {
        let node = self.nodes.remove(&handle)?;
        for other in self.nodes.values_mut() {
            other.dependencies.remove(&handle);
        }
        self.version += 1;
        Some(node.task)
    }

    /// Make `dependent` run after `dependency`. Marks the plan stale.
    ///
    /// Adding an existing edge is a no-op. Cycles longer than one edge are
    /// only detected by [`bake`](Self::bake).
    ///
    /// # Errors
    ///
    /// - [`GraphError::InvalidHandle`] if either handle is unknown.
    /// - [`GraphError::CyclicDependency`] if a task would depend on itself.
    pub fn add_dependency(
        &mut self,
        dependent: TaskHandle,
        dependency: TaskHandle,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&dependency) {
            return Err(GraphError::InvalidHandle(dependency));
        }
        let node = self
            .nodes
            .get_mut(&dependent)
            .ok_or(GraphError::InvalidHandle(dependent))?;
        if dependent == dependency {
            return Err(GraphError::CyclicDependency {
                task: node.task.name().to_string(),
            });
        }
        if node.dependencies.insert(dependency) {
            self.version += 1;
        }
        Ok(())
    }

    /// Remove an edge. Returns `false` if it did not exist.
    pub fn remove_dependency(&mut self, dependent: TaskHandle, dependency: TaskHandle) -> bool {
        let removed = self
            .nodes
            .get_mut(&dependent)
            .is_some_and(|node| node.dependencies.remove(&dependency));
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Get a task.
    pub fn task(&self, handle: TaskHandle) -> Option<&Task> {
        self.nodes.get(&handle).map(|node| &node.task)
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, handle: TaskHandle) -> impl Iterator<Item = TaskHandle> + '_ {
        self.nodes
            .get(&handle)
            .into_iter()
            .flat_map(|node| node.dependencies.iter().copied())
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the graph has a plan matching its current structure.
    pub fn is_baked(&self) -> bool {
        self.plan
            .as_ref()
            .is_some_and(|plan| plan.version == self.version)
    }

    /// Number of completed `execute` calls that reached the tasks.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Compute the execution order and synchronization wiring.
    ///
    /// On error the graph is left unbaked.
    ///
    /// # Errors
    ///
    /// - [`GraphError::CyclicDependency`] if the dependencies form a cycle.
    /// - [`GraphError::SharedSignal`] if two tasks signal the same semaphore.
    pub fn bake(&mut self) -> Result<(), GraphError> {
        redlilium_core::profile_scope!("gpu: bake task graph");

        self.plan = None;
        let order = self.topological_order()?;

        let mut tokens: Vec<Token> = Vec::with_capacity(order.len());
        let mut position: HashMap<TaskHandle, usize> = HashMap::with_capacity(order.len());
        let mut signals: BTreeSet<u64> = BTreeSet::new();
        for handle in order {
            let node = &self.nodes[&handle];
            if let Some(semaphore) = node.task.signal() {
                if !signals.insert(semaphore.id()) {
                    return Err(GraphError::SharedSignal {
                        task: node.task.name().to_string(),
                    });
                }
            }
            let mut waits: Vec<Semaphore> = Vec::new();
            let mut wait_stages = PipelineStages::empty();

            for dependency in &node.dependencies {
                let upstream = &self.nodes[dependency].task;
                wait_stages |= upstream.wait_stages();
                match upstream.signal() {
                    Some(semaphore) => push_unique(&mut waits, semaphore),
                    None => {
                        // Host-only intermediary: inherit its own waits.
                        let token = &tokens[position[dependency]];
                        for semaphore in &token.waits {
                            push_unique(&mut waits, semaphore);
                        }
                        wait_stages |= token.wait_stages;
                    }
                }
            }

            position.insert(handle, tokens.len());
            tokens.push(Token {
                handle,
                waits,
                wait_stages,
            });
        }

        log::debug!(
            "Baked task graph '{}': {} tasks, {} waits",
            self.name,
            tokens.len(),
            tokens.iter().map(|t| t.waits.len()).sum::<usize>()
        );
        self.plan = Some(BakedPlan {
            tokens,
            version: self.version,
        });
        Ok(())
    }

    fn topological_order(&self) -> Result<Vec<TaskHandle>, GraphError> {
        let mut marks = HashMap::with_capacity(self.nodes.len());
        let mut order = Vec::with_capacity(self.nodes.len());
        for &handle in self.nodes.keys() {
            self.visit(handle, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        handle: TaskHandle,
        marks: &mut HashMap<TaskHandle, Mark>,
        order: &mut Vec<TaskHandle>,
    ) -> Result<(), GraphError> {
        match marks.get(&handle) {
            Some(Mark::Visited) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(GraphError::CyclicDependency {
                    task: self.nodes[&handle].task.name().to_string(),
                });
            }
            None => {}
        }

        marks.insert(handle, Mark::Visiting);
        for &dependency in &self.nodes[&handle].dependencies {
            self.visit(dependency, marks, order)?;
        }
        marks.insert(handle, Mark::Visited);
        order.push(handle);
        Ok(())
    }

    /// Baked execution order, or `None` if the graph is not baked.
    pub fn baked_order(&self) -> Option<Vec<TaskHandle>> {
        self.current_plan()
            .map(|plan| plan.tokens.iter().map(|t| t.handle).collect())
    }

    /// Semaphores a task waits on, or `None` if the graph is not baked or
    /// the handle is unknown.
    pub fn wait_list(&self, handle: TaskHandle) -> Option<&[Semaphore]> {
        self.token(handle).map(|t| t.waits.as_slice())
    }

    /// Union of a task's upstream wait stages.
    pub fn upstream_stages(&self, handle: TaskHandle) -> Option<PipelineStages> {
        self.token(handle).map(|t| t.wait_stages)
    }

    fn token(&self, handle: TaskHandle) -> Option<&Token> {
        self.current_plan()?
            .tokens
            .iter()
            .find(|t| t.handle == handle)
    }

    fn current_plan(&self) -> Option<&BakedPlan> {
        self.plan
            .as_ref()
            .filter(|plan| plan.version == self.version)
    }

    /// Run every task of the baked plan.
    ///
    /// # Errors
    ///
    /// - [`GraphError::NotBaked`] / [`GraphError::StalePlan`] if the plan is
    ///   missing or out of date. No task runs and the cycle is unchanged.
    /// - [`GraphError::TaskFailures`] if any task failed.
    pub fn execute(&mut self, strategy: ExecutionStrategy) -> Result<ExecutionReport, GraphError> {
        redlilium_core::profile_scope!("gpu: execute task graph");

        let plan = match &self.plan {
            None => return Err(GraphError::NotBaked),
            Some(plan) if plan.version != self.version => return Err(GraphError::StalePlan),
            Some(plan) => plan,
        };

        self.cycle += 1;
        let cycle = Cycle {
            number: self.cycle,
            targets: plan
                .tokens
                .iter()
                .filter_map(|token| self.nodes[&token.handle].task.signal())
                .map(|semaphore| (semaphore.id(), semaphore.reserve()))
                .collect(),
        };
        let start = Instant::now();
        let outcome = match strategy {
            ExecutionStrategy::Sequential { stop_on_failure } => {
                run_sequential(&self.nodes, plan, &cycle, stop_on_failure)
            }
            ExecutionStrategy::Parallel => run_parallel(&self.pool, &self.nodes, plan, &cycle),
        };
        let cycle = cycle.number;
        let duration = start.elapsed();

        log::trace!(
            "Task graph '{}' cycle {}: {} run, {} failed, {} skipped in {:?}",
            self.name,
            cycle,
            outcome.executed,
            outcome.failures.len(),
            outcome.skipped,
            duration
        );

        if outcome.failures.is_empty() {
            Ok(ExecutionReport {
                cycle,
                executed: outcome.executed,
                duration,
            })
        } else {
            Err(GraphError::TaskFailures {
                failures: outcome.failures,
                skipped: outcome.skipped,
            })
        }
    }
}

fn push_unique(waits: &mut Vec<Semaphore>, semaphore: &Semaphore) {
    if !waits.iter().any(|s| s.id() == semaphore.id()) {
        waits.push(semaphore.clone());
    }
}

fn run_token(task: &Task, token: &Token, cycle: &Cycle) -> Result<(), TaskError> {
    redlilium_core::profile_scope_dynamic!(task.name());

    for semaphore in &token.waits {
        semaphore.wait(target(&cycle.targets, semaphore));
    }
    if let Some(fence) = task.completion() {
        fence.reset();
    }

    let ctx = TaskContext::new(
        task,
        cycle.number,
        &token.waits,
        &cycle.targets,
        token.wait_stages,
    );
    let result = task.run(&ctx);
    if let Err(err) = &result {
        log::warn!(
            "Task '{}' failed in cycle {}: {}",
            task.name(),
            cycle.number,
            err
        );
    }
    if !ctx.is_deferred() {
        ctx.completion_signal().signal();
    }
    result
}

/// Signal a task that will not run this cycle so nothing waits on it forever.
fn release(task: &Task, cycle: &Cycle) {
    if let Some(semaphore) = task.signal() {
        semaphore.signal(target(&cycle.targets, semaphore));
    }
    if let Some(fence) = task.completion() {
        fence.signal();
    }
}

fn run_sequential(
    nodes: &BTreeMap<TaskHandle, Node>,
    plan: &BakedPlan,
    cycle: &Cycle,
    stop_on_failure: bool,
) -> Outcome {
    let mut outcome = Outcome::default();
    for (index, token) in plan.tokens.iter().enumerate() {
        let task = &nodes[&token.handle].task;
        outcome.executed += 1;
        if let Err(error) = run_token(task, token, cycle) {
            outcome.failures.push(TaskFailure {
                task: task.name().to_string(),
                error,
            });
            if stop_on_failure {
                let skipped = &plan.tokens[index + 1..];
                for token in skipped {
                    release(&nodes[&token.handle].task, cycle);
                }
                outcome.skipped = skipped.len();
                break;
            }
        }
    }
    outcome
}

fn run_parallel(
    pool: &ThreadPool,
    nodes: &BTreeMap<TaskHandle, Node>,
    plan: &BakedPlan,
    cycle: &Cycle,
) -> Outcome {
    let executed = AtomicUsize::new(0);
    let failures: Mutex<Vec<(usize, TaskFailure)>> = Mutex::new(Vec::new());

    pool.scope(|s| {
        for (index, token) in plan.tokens.iter().enumerate() {
            let task = &nodes[&token.handle].task;
            let executed = &executed;
            let failures = &failures;

            let spawned = s.spawn(task.name(), move || {
                executed.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = run_token(task, token, cycle) {
                    failures.lock().push((
                        index,
                        TaskFailure {
                            task: task.name().to_string(),
                            error,
                        },
                    ));
                }
            });

            if let Err(err) = spawned {
                log::error!("Failed to spawn worker for task '{}': {}", task.name(), err);
                release(task, cycle);
                failures.lock().push((
                    index,
                    TaskFailure {
                        task: task.name().to_string(),
                        error: TaskError::new(format!("failed to spawn worker: {err}")),
                    },
                ));
            }
        }
    });

    let mut failures = failures.into_inner();
    failures.sort_by_key(|(index, _)| *index);
    Outcome {
        executed: executed.into_inner(),
        failures: failures.into_iter().map(|(_, failure)| failure).collect(),
        skipped: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Fence;
    use std::sync::Arc;

    fn noop(name: &str) -> Task {
        Task::new(name, |_| Ok(()))
    }

    fn recording(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Task {
        let log = Arc::clone(log);
        Task::new(name, move |_| {
            log.lock().push(name);
            Ok(())
        })
    }

    #[test]
    fn test_add_dependency() {
        let mut graph = TaskGraph::new("test");
        let geometry = graph.add_task(noop("geometry"));
        let lighting = graph.add_task(noop("lighting"));

        graph.add_dependency(lighting, geometry).unwrap();
        graph.add_dependency(lighting, geometry).unwrap();

        assert_eq!(graph.dependencies(lighting).collect::<Vec<_>>(), vec![geometry]);
        assert_eq!(graph.dependencies(geometry).count(), 0);
    }

    #[test]
    fn test_invalid_and_self_dependency() {
        let mut graph = TaskGraph::new("test");
        let a = graph.add_task(noop("a"));
        let mut other = TaskGraph::new("other");
        other.add_task(noop("x"));
        let foreign = other.add_task(noop("y"));

        assert_eq!(
            graph.add_dependency(a, foreign),
            Err(GraphError::InvalidHandle(foreign))
        );
        assert_eq!(
            graph.add_dependency(a, a),
            Err(GraphError::CyclicDependency { task: "a".into() })
        );
    }

    #[test]
    fn test_execute_requires_bake() {
        let mut graph = TaskGraph::new("test");
        graph.add_task(noop("a"));
        assert_eq!(
            graph.execute(ExecutionStrategy::default()),
            Err(GraphError::NotBaked)
        );

        graph.bake().unwrap();
        assert!(graph.is_baked());
        graph.add_task(noop("b"));
        assert!(!graph.is_baked());
        assert_eq!(
            graph.execute(ExecutionStrategy::default()),
            Err(GraphError::StalePlan)
        );
        assert_eq!(graph.cycle(), 0);
        assert!(graph.baked_order().is_none());
    }

    #[test]
    fn test_bake_orders_dependencies_first() {
        let mut graph = TaskGraph::new("test");
        let post = graph.add_task(noop("post"));
        let scene = graph.add_task(noop("scene"));
        let shadows = graph.add_task(noop("shadows"));
        graph.add_dependency(post, scene).unwrap();
        graph.add_dependency(scene, shadows).unwrap();

        graph.bake().unwrap();
        assert_eq!(graph.baked_order(), Some(vec![shadows, scene, post]));
    }

    #[test]
    fn test_cycle_leaves_graph_unbaked() {
        let mut graph = TaskGraph::new("test");
        let a = graph.add_task(noop("a"));
        let b = graph.add_task(noop("b"));
        let c = graph.add_task(noop("c"));
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, c).unwrap();
        graph.add_dependency(c, a).unwrap();

        assert!(matches!(
            graph.bake(),
            Err(GraphError::CyclicDependency { .. })
        ));
        assert!(!graph.is_baked());

        assert!(graph.remove_dependency(c, a));
        graph.bake().unwrap();
        assert_eq!(graph.baked_order(), Some(vec![c, b, a]));
    }

    #[test]
    fn test_remove_task_strips_edges() {
        let mut graph = TaskGraph::new("test");
        let a = graph.add_task(noop("a"));
        let b = graph.add_task(noop("b"));
        graph.add_dependency(b, a).unwrap();

        let removed = graph.remove_task(a).unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(graph.dependencies(b).count(), 0);
        assert!(graph.remove_task(a).is_none());

        graph.bake().unwrap();
        assert_eq!(graph.baked_order(), Some(vec![b]));
    }

    #[test]
    fn test_wait_list_forwards_through_unsignaled_task() {
        let upload_done = Semaphore::new();
        let mut graph = TaskGraph::new("test");
        let upload = graph.add_task(
            noop("upload")
                .with_signal(upload_done.clone())
                .with_wait_stages(PipelineStages::VERTEX_INPUT),
        );
        let cull = graph.add_task(noop("cull").with_wait_stages(PipelineStages::HOST));
        let draw = graph.add_task(noop("draw"));
        graph.add_dependency(cull, upload).unwrap();
        graph.add_dependency(draw, cull).unwrap();
        graph.add_dependency(draw, upload).unwrap();

        graph.bake().unwrap();
        let waits = graph.wait_list(draw).unwrap();
        assert_eq!(waits.len(), 1);
        assert_eq!(waits[0], upload_done);
        assert_eq!(
            graph.upstream_stages(draw),
            Some(PipelineStages::VERTEX_INPUT | PipelineStages::HOST)
        );
        assert!(graph.wait_list(upload).unwrap().is_empty());
    }

    #[test]
    fn test_sequential_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new("test");
        let c = graph.add_task(recording("c", &log));
        let b = graph.add_task(recording("b", &log));
        let a = graph.add_task(recording("a", &log));
        graph.add_dependency(c, b).unwrap();
        graph.add_dependency(b, a).unwrap();
        graph.bake().unwrap();

        let report = graph.execute(ExecutionStrategy::default()).unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.executed, 3);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_signals_follow_cycle() {
        let semaphore = Semaphore::new();
        let fence = Fence::new_unsignaled();
        let mut graph = TaskGraph::new("test");
        graph.add_task(
            noop("a")
                .with_signal(semaphore.clone())
                .with_completion(fence.clone()),
        );
        graph.bake().unwrap();

        for cycle in 1..=3 {
            graph.execute(ExecutionStrategy::Parallel).unwrap();
            assert_eq!(semaphore.value(), cycle);
            assert!(fence.is_signaled());
        }
    }

    #[test]
    fn test_completion_fence_reset_before_run() {
        let fence = Fence::new_signaled();
        let observed = Arc::new(Mutex::new(None));
        let task = {
            let observed = Arc::clone(&observed);
            Task::new("observer", move |ctx| {
                *observed.lock() = ctx.completion().map(Fence::is_signaled);
                Ok(())
            })
            .with_completion(fence.clone())
        };
        let mut graph = TaskGraph::new("test");
        graph.add_task(task);
        graph.bake().unwrap();
        graph.execute(ExecutionStrategy::default()).unwrap();

        assert_eq!(*observed.lock(), Some(false));
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_parallel_collects_failures() {
        let mut graph = TaskGraph::new("test");
        let a = graph.add_task(Task::new("a", |_| Err(TaskError::new("boom"))));
        let b = graph.add_task(noop("b").with_signal(Semaphore::new()));
        let c = graph.add_task(Task::new("c", |_| Err(TaskError::new("bang"))));
        graph.add_dependency(c, b).unwrap();
        graph.add_dependency(b, a).unwrap();
        graph.bake().unwrap();

        match graph.execute(ExecutionStrategy::Parallel) {
            Err(GraphError::TaskFailures { failures, skipped }) => {
                assert_eq!(skipped, 0);
                let names: Vec<_> = failures.iter().map(|f| f.task.as_str()).collect();
                assert_eq!(names, vec!["a", "c"]);
            }
            other => panic!("expected task failures, got {other:?}"),
        }
    }

    #[test]
    fn test_skipped_tasks_are_released() {
        let semaphore = Semaphore::new();
        let fence = Fence::new_unsignaled();
        let ran = Arc::new(Mutex::new(false));
        let mut graph = TaskGraph::new("test");
        let a = graph.add_task(Task::new("a", |_| Err(TaskError::new("boom"))));
        let b = graph.add_task({
            let ran = Arc::clone(&ran);
            Task::new("b", move |_| {
                *ran.lock() = true;
                Ok(())
            })
            .with_signal(semaphore.clone())
            .with_completion(fence.clone())
        });
        graph.add_dependency(b, a).unwrap();
        graph.bake().unwrap();

        for cycle in 1..=2 {
            assert!(matches!(
                graph.execute(ExecutionStrategy::default()),
                Err(GraphError::TaskFailures { skipped: 1, .. })
            ));
            assert!(!*ran.lock());
            assert!(fence.is_signaled());
            assert_eq!(semaphore.value(), cycle);
        }
    }

    #[test]
    fn test_shared_signal_rejected() {
        let semaphore = Semaphore::new();
        let mut graph = TaskGraph::new("test");
        let a = graph.add_task(noop("a").with_signal(semaphore.clone()));
        let b = graph.add_task(noop("b").with_signal(semaphore));
        graph.add_dependency(b, a).unwrap();

        assert_eq!(
            graph.bake(),
            Err(GraphError::SharedSignal { task: "b".into() })
        );
        assert!(!graph.is_baked());
    }

    #[test]
    fn test_semaphore_shared_between_graphs() {
        let semaphore = Semaphore::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let build = |name: &str| {
            let mut graph = TaskGraph::new(name);
            let upload = graph.add_task({
                let log = Arc::clone(&log);
                Task::new("upload", move |_| {
                    std::thread::sleep(Duration::from_millis(20));
                    log.lock().push("upload");
                    Ok(())
                })
                .with_signal(semaphore.clone())
            });
            let draw = graph.add_task(recording("draw", &log));
            graph.add_dependency(draw, upload).unwrap();
            graph.bake().unwrap();
            graph
        };
        let mut first = build("first");
        let mut second = build("second");

        first.execute(ExecutionStrategy::Parallel).unwrap();
        assert_eq!(semaphore.value(), 1);
        log.lock().clear();

        // Both graphs are on cycle 1; the draw of the second must still
        // wait for its own upload.
        second.execute(ExecutionStrategy::Parallel).unwrap();
        assert_eq!(*log.lock(), vec!["upload", "draw"]);
        assert_eq!(semaphore.value(), 2);
    }

    #[test]
    fn test_error_display() {
        let err = GraphError::TaskFailures {
            failures: vec![TaskFailure {
                task: "blit".into(),
                error: TaskError::new("lost"),
            }],
            skipped: 2,
        };
        assert_eq!(err.to_string(), "1 task(s) failed, 2 skipped; blit: lost");
        assert_eq!(
            GraphError::CyclicDependency { task: "a".into() }.to_string(),
            "task graph contains cyclic dependency through 'a'"
        );
        assert_eq!(
            GraphError::SharedSignal { task: "b".into() }.to_string(),
            "task 'b' signals a semaphore already signaled in this graph"
        );
    }
}
