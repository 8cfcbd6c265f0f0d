//! Plain descriptor and flag types shared across the crate.

mod buffer;
mod memory;
mod stage;

pub use buffer::{BufferDescriptor, BufferUsage};
pub use memory::{MemoryProperties, MemoryRequirements, align_up};
pub use stage::PipelineStages;
