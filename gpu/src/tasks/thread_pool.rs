//! Scoped fan-out for parallel task execution.

use std::io;

/// Scoped thread fan-out used by the parallel execution strategy.
///
/// Every spawn gets its own thread: tasks may block on semaphores or fences
/// for arbitrarily long, so a fixed number of workers could deadlock waiting
/// on work that never gets a thread.
///
/// On WASM, spawned closures run immediately on the calling thread.
///
/// # Example
///
/// ```
/// use redlilium_gpu::tasks::ThreadPool;
///
/// let pool = ThreadPool::new();
///
/// let mut results = vec![0u32; 4];
/// pool.scope(|s| {
///     for (i, slot) in results.iter_mut().enumerate() {
///         s.spawn(format!("worker {i}"), move || {
///             *slot = (i as u32) * 10;
///         })
///         .unwrap();
///     }
/// });
/// assert_eq!(results, vec![0, 10, 20, 30]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPool {
    stack_size: Option<usize>,
}

impl ThreadPool {
    /// Create a pool using the platform's default thread stack size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool whose threads get `bytes` of stack.
    pub fn with_stack_size(bytes: usize) -> Self {
        Self {
            stack_size: Some(bytes),
        }
    }

    /// Stack size override, if any.
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    /// Run `f` with a scope whose spawned closures all finish before this
    /// method returns. Closures may borrow from the caller's stack.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn scope<'env, F>(&self, f: F)
    where
        F: for<'scope> FnOnce(&Scope<'scope, 'env>),
    {
        let stack_size = self.stack_size;
        std::thread::scope(|s| {
            let scope = Scope {
                inner: s,
                stack_size,
            };
            f(&scope);
        });
    }

    /// Run `f` with a scope (WASM: sequential).
    #[cfg(target_arch = "wasm32")]
    pub fn scope<'env, F>(&self, f: F)
    where
        F: for<'scope> FnOnce(&Scope<'scope, 'env>),
    {
        let scope = Scope {
            _marker: std::marker::PhantomData,
        };
        f(&scope);
    }
}

/// Spawning handle passed to [`ThreadPool::scope`].
#[cfg(not(target_arch = "wasm32"))]
pub struct Scope<'scope, 'env: 'scope> {
    inner: &'scope std::thread::Scope<'scope, 'env>,
    stack_size: Option<usize>,
}

#[cfg(not(target_arch = "wasm32"))]
impl<'scope, 'env> Scope<'scope, 'env> {
    /// Run `f` on a new thread called `name`.
    ///
    /// Fails only if the OS refuses to create the thread.
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'scope,
    {
        let mut builder = std::thread::Builder::new().name(name.into());
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder.spawn_scoped(self.inner, f)?;
        Ok(())
    }
}

/// Spawning handle (WASM: sequential execution).
#[cfg(target_arch = "wasm32")]
pub struct Scope<'scope, 'env: 'scope> {
    _marker: std::marker::PhantomData<(&'scope (), &'env ())>,
}

#[cfg(target_arch = "wasm32")]
impl<'scope, 'env> Scope<'scope, 'env> {
    /// Run `f` immediately on the calling thread.
    pub fn spawn<F>(&self, _name: impl Into<String>, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'scope,
    {
        f();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_scope_runs_every_spawn() {
        let pool = ThreadPool::new();
        let counter = AtomicU32::new(0);
        pool.scope(|s| {
            for i in 0..10 {
                s.spawn(format!("count {i}"), || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_spawned_threads_are_named() {
        let pool = ThreadPool::with_stack_size(256 * 1024);
        assert_eq!(pool.stack_size(), Some(256 * 1024));

        let mut name = None;
        pool.scope(|s| {
            s.spawn("shadow pass", || {
                name = std::thread::current().name().map(str::to_string);
            })
            .unwrap();
        });
        assert_eq!(name.as_deref(), Some("shadow pass"));
    }

    #[test]
    fn test_spawns_may_block_on_each_other() {
        let pool = ThreadPool::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut received = 0;
        let out = &mut received;
        pool.scope(|s| {
            // Receiver is spawned first and blocks until the sender runs.
            s.spawn("receiver", move || {
                *out = rx.recv().unwrap();
            })
            .unwrap();
            s.spawn("sender", move || {
                tx.send(7).unwrap();
            })
            .unwrap();
        });
        assert_eq!(received, 7);
    }
}
