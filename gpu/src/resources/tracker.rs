//! Dependency tracking between device resources.
//!
//! Resources that reference each other (a view over an image, a bind group
//! over buffers) must be torn down dependants-first. [`DependencyTracker`]
//! records those edges over generational handles and refuses to release a
//! resource that something alive still depends on.

use std::collections::BTreeSet;
use std::fmt;

/// Handle to a resource registered with a [`DependencyTracker`].
///
/// Handles are invalidated when their resource is released; a slot that is
/// reused gets a new generation, so stale handles are always detected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    index: u32,
    generation: u32,
}

impl ResourceHandle {
    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({}@{})", self.index, self.generation)
    }
}

/// Errors reported by [`DependencyTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The handle refers to a released resource.
    StaleHandle(ResourceHandle),
    /// The resource still has live dependants.
    DependantsAlive {
        /// Label of the resource being released.
        resource: String,
        /// Labels of the live dependants.
        dependants: Vec<String>,
    },
    /// A resource cannot depend on itself.
    SelfDependency(ResourceHandle),
    /// The edge would close a dependency cycle.
    CyclicDependency {
        /// Label of the dependant.
        dependant: String,
        /// Label of the dependency.
        dependency: String,
    },
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleHandle(handle) => write!(f, "stale resource handle {handle:?}"),
            Self::DependantsAlive {
                resource,
                dependants,
            } => write!(
                f,
                "cannot release '{resource}': still used by {}",
                dependants.join(", ")
            ),
            Self::SelfDependency(handle) => {
                write!(f, "resource {handle:?} cannot depend on itself")
            }
            Self::CyclicDependency {
                dependant,
                dependency,
            } => write!(
                f,
                "'{dependant}' depending on '{dependency}' would form a cycle"
            ),
        }
    }
}

impl std::error::Error for TrackerError {}

#[derive(Debug, Default)]
struct Entry {
    label: String,
    dependencies: BTreeSet<u32>,
    dependants: BTreeSet<u32>,
}

/// Arena of resource handles plus depends-on edges.
///
/// # Example
///
/// ```
/// use redlilium_gpu::resources::{DependencyTracker, TrackerError};
///
/// let mut tracker = DependencyTracker::new();
/// let image = tracker.register("albedo");
/// let view = tracker.register("albedo view");
/// tracker.add_dependency(view, image).unwrap();
///
/// assert!(matches!(tracker.release(image), Err(TrackerError::DependantsAlive { .. })));
/// assert_eq!(tracker.teardown_order(), vec![view, image]);
///
/// tracker.release(view).unwrap();
/// tracker.release(image).unwrap();
/// assert!(tracker.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct DependencyTracker {
    /// Generation of each slot. Index = handle index.
    generations: Vec<u32>,
    /// Live resource per slot.
    entries: Vec<Option<Entry>>,
    /// Recyclable slot indices (LIFO stack).
    free_list: Vec<u32>,
    /// Number of live resources.
    count: usize,
}

impl DependencyTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource, reusing a released slot if available.
    pub fn register(&mut self, label: impl Into<String>) -> ResourceHandle {
        let entry = Entry {
            label: label.into(),
            ..Entry::default()
        };
        self.count += 1;

        if let Some(index) = self.free_list.pop() {
            self.entries[index as usize] = Some(entry);
            ResourceHandle {
                index,
                generation: self.generations[index as usize],
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Some(entry));
            self.generations.push(0);
            ResourceHandle {
                index,
                generation: 0,
            }
        }
    }

    /// Record that `dependant` uses `dependency`.
    ///
    /// Adding an existing edge is a no-op.
    pub fn add_dependency(
        &mut self,
        dependant: ResourceHandle,
        dependency: ResourceHandle,
    ) -> Result<(), TrackerError> {
        self.entry(dependant)?;
        self.entry(dependency)?;
        if dependant == dependency {
            return Err(TrackerError::SelfDependency(dependant));
        }
        if self.reaches(dependency.index, dependant.index) {
            return Err(TrackerError::CyclicDependency {
                dependant: self.label_of(dependant.index),
                dependency: self.label_of(dependency.index),
            });
        }

        if let Some(entry) = self.entries[dependant.index as usize].as_mut() {
            entry.dependencies.insert(dependency.index);
        }
        if let Some(entry) = self.entries[dependency.index as usize].as_mut() {
            entry.dependants.insert(dependant.index);
        }
        Ok(())
    }

    /// Release a resource. Returns its label.
    ///
    /// # Errors
    ///
    /// - [`TrackerError::StaleHandle`] if the handle was already released.
    /// - [`TrackerError::DependantsAlive`] if a live resource depends on it.
    pub fn release(&mut self, handle: ResourceHandle) -> Result<String, TrackerError> {
        let entry = self.entry(handle)?;
        if !entry.dependants.is_empty() {
            let dependants = entry
                .dependants
                .iter()
                .map(|&index| self.label_of(index))
                .collect();
            log::warn!(
                "Refusing to release '{}' with live dependants",
                entry.label
            );
            return Err(TrackerError::DependantsAlive {
                resource: entry.label.clone(),
                dependants,
            });
        }

        let idx = handle.index as usize;
        let Some(entry) = self.entries[idx].take() else {
            return Err(TrackerError::StaleHandle(handle));
        };
        for dependency in &entry.dependencies {
            if let Some(upstream) = self.entries[*dependency as usize].as_mut() {
                upstream.dependants.remove(&handle.index);
            }
        }
        // Bump the generation so old handles are invalidated on reuse
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_list.push(handle.index);
        self.count -= 1;
        Ok(entry.label)
    }

    /// Whether the handle refers to a live resource.
    pub fn is_alive(&self, handle: ResourceHandle) -> bool {
        self.entry(handle).is_ok()
    }

    /// Label of a live resource.
    pub fn label(&self, handle: ResourceHandle) -> Option<&str> {
        self.entry(handle).ok().map(|entry| entry.label.as_str())
    }

    /// Live resources that depend on `handle`.
    pub fn dependants(&self, handle: ResourceHandle) -> Vec<ResourceHandle> {
        self.entry(handle)
            .map(|entry| entry.dependants.iter().map(|&i| self.handle_of(i)).collect())
            .unwrap_or_default()
    }

    /// Resources `handle` depends on.
    pub fn dependencies(&self, handle: ResourceHandle) -> Vec<ResourceHandle> {
        self.entry(handle)
            .map(|entry| entry.dependencies.iter().map(|&i| self.handle_of(i)).collect())
            .unwrap_or_default()
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no resource is live.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Every live resource, ordered so each comes before all of its
    /// dependencies. Releasing in this order never fails.
    pub fn teardown_order(&self) -> Vec<ResourceHandle> {
        let mut remaining: Vec<usize> = self
            .entries
            .iter()
            .map(|entry| entry.as_ref().map_or(0, |e| e.dependants.len()))
            .collect();
        let mut ready: BTreeSet<u32> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                entry
                    .as_ref()
                    .filter(|e| e.dependants.is_empty())
                    .map(|_| i as u32)
            })
            .collect();

        let mut order = Vec::with_capacity(self.count);
        while let Some(index) = ready.pop_first() {
            order.push(self.handle_of(index));
            let Some(entry) = &self.entries[index as usize] else {
                continue;
            };
            for &dependency in &entry.dependencies {
                let left = &mut remaining[dependency as usize];
                *left -= 1;
                if *left == 0 {
                    ready.insert(dependency);
                }
            }
        }
        order
    }

    fn entry(&self, handle: ResourceHandle) -> Result<&Entry, TrackerError> {
        let idx = handle.index as usize;
        match (self.generations.get(idx), self.entries.get(idx)) {
            (Some(&generation), Some(Some(entry))) if generation == handle.generation => Ok(entry),
            _ => Err(TrackerError::StaleHandle(handle)),
        }
    }

    fn handle_of(&self, index: u32) -> ResourceHandle {
        ResourceHandle {
            index,
            generation: self.generations[index as usize],
        }
    }

    fn label_of(&self, index: u32) -> String {
        self.entries[index as usize]
            .as_ref()
            .map(|entry| entry.label.clone())
            .unwrap_or_default()
    }

    /// Whether `target` is reachable from `from` along depends-on edges.
    fn reaches(&self, from: u32, target: u32) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(index) = stack.pop() {
            if index == target {
                return true;
            }
            if !seen.insert(index) {
                continue;
            }
            if let Some(entry) = &self.entries[index as usize] {
                stack.extend(entry.dependencies.iter().copied());
            }
        }
        false
    }
}
