//! Device resources built on leased memory.
//!
//! - [`LeasedBuffer`] - Buffer bound to a [`Lease`], rebound when compaction moves it
//! - [`DependencyTracker`] - Depends-on edges between resources, with teardown ordering
//!
//! Resources own their lease by composition; there is no shared base type.
//!
//! [`Lease`]: crate::memory::Lease

mod buffer;
mod tracker;

pub use buffer::{BufferBinding, LeasedBuffer};
pub use tracker::{DependencyTracker, ResourceHandle, TrackerError};
