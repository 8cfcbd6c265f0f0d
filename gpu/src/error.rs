//! Crate-level error type.

use std::fmt;

use crate::memory::MemoryError;
use crate::resources::TrackerError;
use crate::tasks::GraphError;

/// Errors that can occur anywhere in the GPU subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuError {
    /// Memory leasing failed.
    Memory(MemoryError),
    /// Task graph construction or execution failed.
    Graph(GraphError),
    /// Resource dependency tracking failed.
    Tracker(TrackerError),
    /// Configuration could not be read, parsed or applied.
    Config(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(err) => write!(f, "memory error: {err}"),
            Self::Graph(err) => write!(f, "task graph error: {err}"),
            Self::Tracker(err) => write!(f, "resource tracking error: {err}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Memory(err) => Some(err),
            Self::Graph(err) => Some(err),
            Self::Tracker(err) => Some(err),
            Self::Config(_) => None,
        }
    }
}

impl From<MemoryError> for GpuError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

impl From<GraphError> for GpuError {
    fn from(err: GraphError) -> Self {
        Self::Graph(err)
    }
}

impl From<TrackerError> for GpuError {
    fn from(err: TrackerError) -> Self {
        Self::Tracker(err)
    }
}
