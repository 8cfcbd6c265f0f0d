//! Task synchronization primitives.
//!
//! Tasks order their work through two kinds of handles:
//!
//! | Primitive | Waited by | Purpose |
//! |-----------|-----------|---------|
//! | [`Semaphore`] | other tasks | Task → task ordering within a graph |
//! | [`Fence`] | the host | Completion of one task, or of a whole frame |
//!
//! Both are cheap to clone; clones share state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
struct Timeline {
    state: Mutex<TimelineState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct TimelineState {
    value: u64,
    /// Highest value handed out by [`Semaphore::reserve`].
    reserved: u64,
}

/// Timeline semaphore ordering one task after another.
///
/// The value only grows. Each execution of a task graph reserves the next
/// value of every signal semaphore it uses; the signaling task raises the
/// semaphore to that value and dependants wait for it. Graphs sharing a
/// semaphore therefore never satisfy each other's waits, and one semaphore
/// serves every execution without resets.
#[derive(Debug, Clone)]
pub struct Semaphore {
    id: u64,
    timeline: Arc<Timeline>,
}

impl Semaphore {
    /// Create a semaphore at value 0.
    pub fn new() -> Self {
        Self {
            id: NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed),
            timeline: Arc::new(Timeline::default()),
        }
    }

    /// Unique identifier. Clones share the id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.timeline.state.lock().value
    }

    /// Claim the next unused value, above both the current value and every
    /// earlier reservation.
    pub fn reserve(&self) -> u64 {
        let mut state = self.timeline.state.lock();
        state.reserved = state.reserved.max(state.value) + 1;
        state.reserved
    }

    /// Raise the value to `value` and wake waiters. Lower values are ignored.
    pub fn signal(&self, value: u64) {
        let mut state = self.timeline.state.lock();
        if value > state.value {
            state.value = value;
            self.timeline.changed.notify_all();
        }
    }

    /// Block until the value reaches `value`.
    pub fn wait(&self, value: u64) {
        let mut state = self.timeline.state.lock();
        while state.value < value {
            self.timeline.changed.wait(&mut state);
        }
    }

    /// Block until the value reaches `value` or `timeout` elapses.
    ///
    /// Returns `true` if the value was reached.
    pub fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.timeline.state.lock();
        while state.value < value {
            if self
                .timeline
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.value >= value;
            }
        }
        true
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Semaphore {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Semaphore {}

/// Status of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence has not yet been signaled.
    Unsignaled,
    /// The fence has been signaled (work complete).
    Signaled,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: Mutex<bool>,
    changed: Condvar,
}

/// Host-visible completion handle.
///
/// A task's completion fence is reset right before the task runs and
/// signaled when its work completes. Frame fences bound how many frames
/// may be in flight.
///
/// # Example
///
/// ```
/// use redlilium_gpu::tasks::Fence;
///
/// let fence = Fence::new_unsignaled();
/// let remote = fence.clone();
/// std::thread::spawn(move || remote.signal());
///
/// fence.wait();
/// assert!(fence.is_signaled());
/// ```
#[derive(Debug, Clone)]
pub struct Fence {
    state: Arc<FenceState>,
}

impl Fence {
    /// Create a new fence in the unsignaled state.
    pub fn new_unsignaled() -> Self {
        Self {
            state: Arc::new(FenceState::default()),
        }
    }

    /// Create a new fence in the signaled state.
    pub fn new_signaled() -> Self {
        let fence = Self::new_unsignaled();
        fence.signal();
        fence
    }

    /// Check the current status of the fence.
    pub fn status(&self) -> FenceStatus {
        if *self.state.signaled.lock() {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        }
    }

    /// Check if the fence is signaled (non-blocking).
    pub fn is_signaled(&self) -> bool {
        self.status() == FenceStatus::Signaled
    }

    /// Wait for the fence to be signaled (blocking).
    ///
    /// Returns immediately if already signaled.
    pub fn wait(&self) {
        let mut signaled = self.state.signaled.lock();
        while !*signaled {
            self.state.changed.wait(&mut signaled);
        }
    }

    /// Wait for the fence with a timeout.
    ///
    /// Returns `true` if the fence was signaled, `false` if timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.state.signaled.lock();
        while !*signaled {
            if self
                .state
                .changed
                .wait_until(&mut signaled, deadline)
                .timed_out()
            {
                return *signaled;
            }
        }
        true
    }

    /// Reset the fence to unsignaled state.
    ///
    /// Must only be called when no work is pending on this fence.
    pub fn reset(&self) {
        *self.state.signaled.lock() = false;
    }

    /// Signal the fence and wake every waiter.
    pub fn signal(&self) {
        *self.state.signaled.lock() = true;
        self.state.changed.notify_all();
    }

    /// Whether two handles refer to the same fence.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new_unsignaled()
    }
}

static_assertions::assert_impl_all!(Semaphore: Send, Sync);
static_assertions::assert_impl_all!(Fence: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_ids_unique() {
        let a = Semaphore::new();
        let b = Semaphore::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_semaphore_value_is_monotonic() {
        let sem = Semaphore::new();
        sem.signal(3);
        sem.signal(1);
        assert_eq!(sem.value(), 3);
    }

    #[test]
    fn test_semaphore_wait_across_threads() {
        let sem = Semaphore::new();
        let remote = sem.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.signal(2);
        });

        sem.wait(2);
        assert_eq!(sem.value(), 2);
    }

    #[test]
    fn test_semaphore_reserve_stays_ahead() {
        let sem = Semaphore::new();
        assert_eq!(sem.reserve(), 1);
        assert_eq!(sem.reserve(), 2);
        // An external signal past the reservations moves the next one up.
        sem.signal(10);
        assert_eq!(sem.reserve(), 11);
        assert_eq!(sem.value(), 10);
    }

    #[test]
    fn test_semaphore_wait_timeout() {
        let sem = Semaphore::new();
        sem.signal(1);
        assert!(sem.wait_timeout(1, Duration::from_millis(1)));
        assert!(!sem.wait_timeout(2, Duration::from_millis(10)));
    }

    #[test]
    fn test_fence_unsignaled() {
        let fence = Fence::new_unsignaled();
        assert_eq!(fence.status(), FenceStatus::Unsignaled);
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_fence_signaled() {
        let fence = Fence::new_signaled();
        assert_eq!(fence.status(), FenceStatus::Signaled);
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_fence_signal_and_wait() {
        let fence = Fence::new_unsignaled();

        let fence_clone = fence.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            fence_clone.signal();
        });

        fence.wait();
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_fence_wait_timeout() {
        let fence = Fence::new_unsignaled();
        assert!(!fence.wait_timeout(Duration::from_millis(10)));
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_fence_reset() {
        let fence = Fence::new_signaled();
        fence.reset();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_fence_clone_shares_state() {
        let fence1 = Fence::new_unsignaled();
        let fence2 = fence1.clone();
        assert!(fence1.ptr_eq(&fence2));

        fence1.signal();
        assert!(fence2.is_signaled());
        assert!(!fence1.ptr_eq(&Fence::new_unsignaled()));
    }
}
