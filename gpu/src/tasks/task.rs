//! Tasks: units of host or device work inside a [`TaskGraph`](super::TaskGraph).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::sync::{Fence, Semaphore};
use crate::types::PipelineStages;

/// Failure returned by a task's work closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    message: String,
}

impl TaskError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TaskError {}

/// Work closure of a task.
pub type TaskFn = Arc<dyn Fn(&TaskContext<'_>) -> Result<(), TaskError> + Send + Sync>;

/// A unit of work in a task graph.
///
/// A task may carry a signal [`Semaphore`] that dependants wait on, and a
/// completion [`Fence`] the host can wait on. Both handles are owned by the
/// caller; the graph only clones them.
///
/// # Example
///
/// ```
/// use redlilium_gpu::tasks::{Semaphore, Task};
/// use redlilium_gpu::types::PipelineStages;
///
/// let task = Task::new("shadow", |_ctx| Ok(()))
///     .with_wait_stages(PipelineStages::FRAGMENT_SHADER)
///     .with_signal(Semaphore::new());
/// assert_eq!(task.name(), "shadow");
/// ```
#[derive(Clone)]
pub struct Task {
    name: String,
    wait_stages: PipelineStages,
    work: TaskFn,
    signal: Option<Semaphore>,
    completion: Option<Fence>,
}

impl Task {
    /// Create a task that runs `work`.
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            wait_stages: PipelineStages::empty(),
            work: Arc::new(work),
            signal: None,
            completion: None,
        }
    }

    /// Set the pipeline stages at which this task's dependants wait for it.
    pub fn with_wait_stages(mut self, stages: PipelineStages) -> Self {
        self.wait_stages = stages;
        self
    }

    /// Attach a semaphore signaled when this task completes.
    pub fn with_signal(mut self, semaphore: Semaphore) -> Self {
        self.signal = Some(semaphore);
        self
    }

    /// Attach a fence reset before each run and signaled on completion.
    pub fn with_completion(mut self, fence: Fence) -> Self {
        self.completion = Some(fence);
        self
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipeline stages at which dependants wait.
    pub fn wait_stages(&self) -> PipelineStages {
        self.wait_stages
    }

    /// Signal semaphore, if any.
    pub fn signal(&self) -> Option<&Semaphore> {
        self.signal.as_ref()
    }

    /// Completion fence, if any.
    pub fn completion(&self) -> Option<&Fence> {
        self.completion.as_ref()
    }

    pub(super) fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        (self.work)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("wait_stages", &self.wait_stages)
            .field("signal", &self.signal.as_ref().map(Semaphore::id))
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

/// Signals a task's completion handles, possibly from another thread.
///
/// Obtained from [`TaskContext::defer_completion`] by tasks whose work
/// finishes after the closure returns (device submissions, worker jobs).
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    semaphore: Option<Semaphore>,
    fence: Option<Fence>,
    value: u64,
}

impl CompletionSignal {
    /// Signal the semaphore at its reserved value and the completion fence.
    pub fn signal(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.signal(self.value);
        }
        if let Some(fence) = &self.fence {
            fence.signal();
        }
    }

    /// Semaphore value this signal targets.
    pub fn value(&self) -> u64 {
        self.value
    }
}

/// Semaphore id to the value reserved for it by the current execution.
pub(super) type SignalTargets = HashMap<u64, u64>;

/// Execution context handed to a task's work closure.
///
/// Upstream waits have already been satisfied when the closure runs. The
/// wait-list is exposed for work that forwards it to a device queue.
pub struct TaskContext<'a> {
    task: &'a Task,
    cycle: u64,
    waits: &'a [Semaphore],
    targets: &'a SignalTargets,
    wait_stages: PipelineStages,
    deferred: AtomicBool,
}

impl<'a> TaskContext<'a> {
    pub(super) fn new(
        task: &'a Task,
        cycle: u64,
        waits: &'a [Semaphore],
        targets: &'a SignalTargets,
        wait_stages: PipelineStages,
    ) -> Self {
        Self {
            task,
            cycle,
            waits,
            targets,
            wait_stages,
            deferred: AtomicBool::new(false),
        }
    }

    /// Name of the running task.
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Execution cycle, starting at 1 for a graph's first `execute`.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Upstream semaphores and the value each is waited on.
    pub fn waits(&self) -> impl Iterator<Item = (&'a Semaphore, u64)> + '_ {
        self.waits
            .iter()
            .map(move |semaphore| (semaphore, target(self.targets, semaphore)))
    }

    /// Union of the wait stages of every upstream task.
    pub fn wait_stages(&self) -> PipelineStages {
        self.wait_stages
    }

    /// This task's signal semaphore, if any.
    pub fn signal(&self) -> Option<&'a Semaphore> {
        self.task.signal()
    }

    /// This task's completion fence, if any.
    pub fn completion(&self) -> Option<&'a Fence> {
        self.task.completion()
    }

    /// Take over signaling this task's completion.
    ///
    /// The graph then does not signal the task's semaphore or fence when the
    /// closure returns; the returned handle must be signaled instead, or
    /// dependants wait forever.
    pub fn defer_completion(&self) -> CompletionSignal {
        self.deferred.store(true, Ordering::Release);
        self.completion_signal()
    }

    pub(super) fn completion_signal(&self) -> CompletionSignal {
        CompletionSignal {
            semaphore: self.task.signal().cloned(),
            fence: self.task.completion().cloned(),
            value: self
                .task
                .signal()
                .map_or(0, |semaphore| target(self.targets, semaphore)),
        }
    }

    pub(super) fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }
}

/// Value reserved for `semaphore` this execution; 0 (always reached) if none.
pub(super) fn target(targets: &SignalTargets, semaphore: &Semaphore) -> u64 {
    targets.get(&semaphore.id()).copied().unwrap_or_default()
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task.name)
            .field("cycle", &self.cycle)
            .field("waits", &self.waits.len())
            .field("wait_stages", &self.wait_stages)
            .finish()
    }
}

static_assertions::assert_impl_all!(Task: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let fence = Fence::new_unsignaled();
        let task = Task::new("lighting", |_| Ok(()))
            .with_wait_stages(PipelineStages::FRAGMENT_SHADER | PipelineStages::COMPUTE_SHADER)
            .with_completion(fence.clone());

        assert_eq!(task.name(), "lighting");
        assert!(task.wait_stages().contains(PipelineStages::COMPUTE_SHADER));
        assert!(task.signal().is_none());
        assert!(task.completion().is_some_and(|f| f.ptr_eq(&fence)));
    }

    #[test]
    fn test_context_waits_target_reserved_values() {
        let upstream = [Semaphore::new(), Semaphore::new()];
        let targets = SignalTargets::from([(upstream[0].id(), 5), (upstream[1].id(), 7)]);
        let task = Task::new("post", |_| Ok(()));
        let ctx = TaskContext::new(&task, 2, &upstream, &targets, PipelineStages::TRANSFER);

        let waits: Vec<_> = ctx.waits().map(|(s, v)| (s.id(), v)).collect();
        assert_eq!(waits, vec![(upstream[0].id(), 5), (upstream[1].id(), 7)]);
        assert_eq!(ctx.cycle(), 2);
        assert_eq!(ctx.wait_stages(), PipelineStages::TRANSFER);
    }

    #[test]
    fn test_deferred_completion_signals_later() {
        let semaphore = Semaphore::new();
        let fence = Fence::new_unsignaled();
        let task = Task::new("upload", |_| Ok(()))
            .with_signal(semaphore.clone())
            .with_completion(fence.clone());
        let targets = SignalTargets::from([(semaphore.id(), 3)]);
        let ctx = TaskContext::new(&task, 1, &[], &targets, PipelineStages::empty());

        let signal = ctx.defer_completion();
        assert!(ctx.is_deferred());
        assert_eq!(signal.value(), 3);

        std::thread::spawn(move || signal.signal()).join().unwrap();
        assert_eq!(semaphore.value(), 3);
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_error_display() {
        let err = TaskError::new("device lost");
        assert_eq!(err.to_string(), "device lost");
        assert_eq!(err.message(), "device lost");
    }
}
