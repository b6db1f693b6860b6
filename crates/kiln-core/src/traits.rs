//! # KILN Core Traits
//!
//! The allocation registry interface consumed by the dispatch pipeline.
//!
//! ```text
//! kiln-cmd (builder, encoder, tracker)
//!    │  handles only
//!    ▼
//! AllocationRegistry ── owns memory, residency and lifetime
//! ```

use crate::error::Result;
use crate::memory::*;
use crate::types::*;

// =============================================================================
// ALLOCATION REGISTRY
// =============================================================================

/// Owner of every allocation referenced by a command stream
///
/// The registry guards its state with its own lock; callers may hold the
/// submission lock while calling in.
pub trait AllocationRegistry: Send + Sync {
    /// Create an allocation
    fn allocate(&self, desc: &AllocDesc) -> Result<AllocationHandle>;

    /// Look up address, size and pool
    fn resolve(&self, handle: AllocationHandle) -> Result<AllocationInfo>;

    /// Keep the allocation GPU-accessible on `context`
    fn make_resident(&self, handle: AllocationHandle, context: ContextId) -> Result<()>;

    /// Drop residency taken with `make_resident`
    fn make_non_resident(&self, handle: AllocationHandle, context: ContextId) -> Result<()>;

    /// Task count of the last submission on `context` that used the allocation
    fn completion_stamp(&self, handle: AllocationHandle, context: ContextId) -> Result<TaskCount>;

    /// Record that the allocation is used by submission `task_count`
    fn update_task_count(
        &self,
        handle: AllocationHandle,
        context: ContextId,
        task_count: TaskCount,
    ) -> Result<()>;

    /// Block reclaim until the transfer finishes; returns the new count
    fn add_pending_transfer(&self, handle: AllocationHandle) -> Result<u32>;

    /// Hand the allocation to the registry until `task_count` completes
    fn store_allocation(
        &self,
        handle: AllocationHandle,
        context: ContextId,
        usage: AllocationUsage,
        task_count: TaskCount,
    ) -> Result<()>;

    /// Take back a completed reusable allocation of `kind`
    fn obtain_reusable(
        &self,
        min_size: ByteSize,
        kind: AllocationKind,
        context: ContextId,
        completed: TaskCount,
    ) -> Option<AllocationHandle>;

    /// Free completed temporary allocations (or retire completed reusable
    /// ones); returns how many were released
    fn clean_allocation_list(
        &self,
        context: ContextId,
        completed: TaskCount,
        usage: AllocationUsage,
    ) -> usize;
}
