//! # Synchronization Primitives
//!
//! Completion tags, timestamp packets and wait results.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::types::*;

// =============================================================================
// WAIT STATUS
// =============================================================================

/// Result of waiting for a task count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WaitStatus {
    /// Target reached
    Ready,
    /// Target not reached yet (timeout or nothing submitted)
    NotReady,
    /// Device stopped responding
    GpuHang,
}

impl WaitStatus {
    /// Target reached
    #[inline]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Advisory scheduling class forwarded to the transport while waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueThrottle {
    /// Background work
    Low,
    /// Default
    #[default]
    Medium,
    /// Latency sensitive
    High,
}

// =============================================================================
// COMPLETION TAG
// =============================================================================

/// CPU view of the hardware completion tag
///
/// The engine writes the task count of each finished batch to `gpu_addr`;
/// the host observes it through this shared value. Cloning shares the tag.
#[derive(Debug, Clone)]
pub struct CompletionTag {
    /// GPU address the engine writes to
    gpu_addr: GpuAddr,
    /// Last value written by the engine
    value: Arc<AtomicU32>,
}

impl CompletionTag {
    /// Create a tag with no completed work
    pub fn new(gpu_addr: GpuAddr) -> Self {
        Self {
            gpu_addr,
            value: Arc::new(AtomicU32::new(0)),
        }
    }

    /// GPU address of the tag
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Current completed task count
    pub fn current(&self) -> TaskCount {
        self.value.load(Ordering::Acquire)
    }

    /// Record a completed task count; the tag never moves backwards
    pub fn signal(&self, value: TaskCount) {
        self.value.fetch_max(value, Ordering::AcqRel);
    }

    /// Check if a task count has completed
    pub fn is_reached(&self, target: TaskCount) -> bool {
        self.current() >= target
    }
}

// =============================================================================
// TIMESTAMP PACKET
// =============================================================================

/// GPU slots written when a copy is profiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPacket {
    /// Allocation holding the packet
    pub allocation: AllocationHandle,
    /// Packet base address
    pub gpu_addr: GpuAddr,
}

impl TimestampPacket {
    /// Offset of the start timestamp
    pub const START_OFFSET: u64 = 0;
    /// Offset of the end timestamp
    pub const END_OFFSET: u64 = 8;
    /// Offset of the completion value
    pub const COMPLETION_OFFSET: u64 = 16;
    /// Packet size
    pub const SIZE: u64 = 32;

    /// Start timestamp slot
    pub fn start(&self) -> GpuAddr {
        self.gpu_addr + Self::START_OFFSET
    }

    /// End timestamp slot
    pub fn end(&self) -> GpuAddr {
        self.gpu_addr + Self::END_OFFSET
    }

    /// Completion value slot
    pub fn completion(&self) -> GpuAddr {
        self.gpu_addr + Self::COMPLETION_OFFSET
    }
}

/// Per-operation fence location signalled after its copies
///
/// Distinct from the queue completion tag, which only the batch end writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSlot {
    /// Allocation holding the slot
    pub allocation: AllocationHandle,
    /// Slot address
    pub gpu_addr: GpuAddr,
}

impl FenceSlot {
    /// Dependency a later operation uses to wait for `value` in this slot
    pub fn dependency(&self, value: u32) -> FenceDependency {
        FenceDependency {
            allocation: Some(self.allocation),
            gpu_addr: self.gpu_addr,
            value,
        }
    }
}

/// Producer fence the engine must observe before a descriptor runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceDependency {
    /// Allocation backing the fence, kept resident for the batch
    pub allocation: Option<AllocationHandle>,
    /// Fence address polled by the engine
    pub gpu_addr: GpuAddr,
    /// Value the fence must reach
    pub value: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_is_monotonic() {
        let tag = CompletionTag::new(GpuAddr::new(0x1000));
        let shared = tag.clone();
        shared.signal(5);
        shared.signal(3);
        assert_eq!(tag.current(), 5);
        assert!(tag.is_reached(5));
        assert!(!tag.is_reached(6));
    }

    #[test]
    fn test_timestamp_slots() {
        let packet = TimestampPacket {
            allocation: AllocationHandle::new(1),
            gpu_addr: GpuAddr::new(0x2000),
        };
        assert_eq!(packet.end().raw(), 0x2008);
        assert_eq!(packet.completion().raw(), 0x2010);
    }

    #[test]
    fn test_fence_slot_dependency() {
        let slot = FenceSlot {
            allocation: AllocationHandle::new(4),
            gpu_addr: GpuAddr::new(0x3000),
        };
        let dependency = slot.dependency(7);
        assert_eq!(dependency.allocation, Some(slot.allocation));
        assert_eq!(dependency.gpu_addr, slot.gpu_addr);
        assert_eq!(dependency.value, 7);
    }
}
