//! # Allocation Descriptions
//!
//! Kinds, pools and flags that describe allocations handed out by the
//! allocation registry.

use crate::types::*;

// =============================================================================
// ALLOCATION KIND
// =============================================================================

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Linear buffer memory object
    Buffer,
    /// Image memory object
    Image,
    /// Transient wrapper around caller host memory
    ExternalHostPtr,
    /// Command buffer segment
    CommandBuffer,
    /// Completion tag storage
    TagBuffer,
    /// Timestamp packet storage
    TimestampPacket,
    /// Clear-color storage for compressed surfaces
    ClearColor,
    /// Global fence storage
    GlobalFence,
}

/// Physical placement of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// System memory, 4 KiB pages
    System4K,
    /// System memory, 64 KiB pages
    System64K,
    /// Device local memory
    LocalMemory,
}

impl MemoryPool {
    /// Page size of the pool
    pub const fn page_size(self) -> u64 {
        match self {
            Self::System4K => ByteSize::KIB_4.as_bytes(),
            Self::System64K | Self::LocalMemory => ByteSize::KIB_64.as_bytes(),
        }
    }

    /// Pool is backed by system memory
    pub const fn is_system(self) -> bool {
        matches!(self, Self::System4K | Self::System64K)
    }
}

bitflags::bitflags! {
    /// Allocation properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// CPU keeps a mapping of the allocation
        const CPU_VISIBLE = 1 << 0;
        /// Surface uses lossless compression
        const COMPRESSED = 1 << 1;
        /// Allocation may be recycled through the reusable list
        const REUSABLE = 1 << 2;
    }
}

/// How a stored allocation is recycled once its task count completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationUsage {
    /// Freed when complete
    Temporary,
    /// Kept for reuse when complete
    Reusable,
}

// =============================================================================
// ALLOCATION DESCRIPTOR
// =============================================================================

/// Request for a new allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocDesc {
    /// Requested size
    pub size: ByteSize,
    /// Required GPU address alignment
    pub alignment: u64,
    /// Allocation kind
    pub kind: AllocationKind,
    /// Preferred pool
    pub pool: MemoryPool,
    /// Property flags
    pub flags: AllocFlags,
    /// Host address for `ExternalHostPtr` allocations
    pub host_address: Option<u64>,
}

impl AllocDesc {
    /// Describe an allocation with default placement for its kind
    pub fn new(kind: AllocationKind, size: ByteSize) -> Self {
        let (pool, flags) = match kind {
            AllocationKind::CommandBuffer => (
                MemoryPool::System64K,
                AllocFlags::CPU_VISIBLE | AllocFlags::REUSABLE,
            ),
            AllocationKind::TagBuffer
            | AllocationKind::TimestampPacket
            | AllocationKind::GlobalFence => (MemoryPool::System4K, AllocFlags::CPU_VISIBLE),
            AllocationKind::ExternalHostPtr => (MemoryPool::System4K, AllocFlags::CPU_VISIBLE),
            AllocationKind::Buffer | AllocationKind::Image | AllocationKind::ClearColor => {
                (MemoryPool::LocalMemory, AllocFlags::empty())
            }
        };

        Self {
            size,
            alignment: pool.page_size(),
            kind,
            pool,
            flags,
            host_address: None,
        }
    }

    /// Describe a transient allocation wrapping host memory
    pub fn host_ptr(host_address: u64, size: ByteSize) -> Self {
        Self {
            host_address: Some(host_address),
            ..Self::new(AllocationKind::ExternalHostPtr, size)
        }
    }

    /// Add flags
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// Registry view of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// GPU virtual address of the first byte
    pub gpu_addr: GpuAddr,
    /// Size
    pub size: ByteSize,
    /// Physical placement
    pub pool: MemoryPool,
    /// Allocation kind
    pub kind: AllocationKind,
    /// Property flags
    pub flags: AllocFlags,
}

impl AllocationInfo {
    /// Surface uses lossless compression
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(AllocFlags::COMPRESSED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_buffer_defaults() {
        let desc = AllocDesc::new(AllocationKind::CommandBuffer, ByteSize::KIB_64);
        assert_eq!(desc.pool, MemoryPool::System64K);
        assert!(desc.flags.contains(AllocFlags::REUSABLE));
        assert_eq!(desc.alignment, 64 * 1024);
    }

    #[test]
    fn test_host_ptr_desc() {
        let desc = AllocDesc::host_ptr(0x7000_1010, ByteSize::from_bytes(100));
        assert_eq!(desc.kind, AllocationKind::ExternalHostPtr);
        assert_eq!(desc.host_address, Some(0x7000_1010));
        assert!(desc.pool.is_system());
    }
}
