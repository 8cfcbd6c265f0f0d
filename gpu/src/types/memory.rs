//! Device memory classification.

use bitflags::bitflags;

bitflags! {
    /// Properties of a device memory type.
    ///
    /// The heap never interprets these beyond the host-visibility check for
    /// mapping; they are forwarded to the device allocator as-is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        /// Memory local to the device, fastest for GPU access.
        const DEVICE_LOCAL = 1 << 0;
        /// Memory the host can map.
        const HOST_VISIBLE = 1 << 1;
        /// Host writes become visible without explicit flushes.
        const HOST_COHERENT = 1 << 2;
        /// Host reads are cached.
        const HOST_CACHED = 1 << 3;
        /// Backing may be committed lazily by the driver.
        const LAZILY_ALLOCATED = 1 << 4;
    }
}

impl Default for MemoryProperties {
    fn default() -> Self {
        Self::DEVICE_LOCAL
    }
}

impl MemoryProperties {
    /// Whether leases from memory with these properties can be mapped.
    pub fn is_host_visible(self) -> bool {
        self.contains(Self::HOST_VISIBLE)
    }

    /// Parse a single flag name, case-insensitively (`"host_visible"`).
    pub fn parse_flag(name: &str) -> Option<Self> {
        Self::from_name(&name.to_ascii_uppercase())
    }
}

/// Memory requirements reported by a device resource.
///
/// Used to size a heap for one specific resource instead of a generic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRequirements {
    /// Minimum allocation size in bytes.
    pub size: u64,
    /// Required alignment of the allocation (power of two).
    pub alignment: u64,
    /// Bitmask of acceptable device memory type indices.
    pub memory_type_bits: u32,
}

impl MemoryRequirements {
    /// Create memory requirements accepting any memory type.
    pub fn new(size: u64, alignment: u64) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits: u32::MAX,
        }
    }

    /// Restrict the acceptable memory types.
    pub fn with_memory_type_bits(mut self, bits: u32) -> Self {
        self.memory_type_bits = bits;
        self
    }
}

/// Round `value` up to the next multiple of `alignment` (power of two).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two(), "alignment must be power of 2");
    (value + alignment - 1) & !(alignment - 1)
}
