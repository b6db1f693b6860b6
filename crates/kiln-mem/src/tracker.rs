//! # Allocation Tracker
//!
//! Track allocations, their residency and their lifetime against the GPU
//! timeline. This is the in-process [`AllocationRegistry`].
//!
//! An allocation is only destroyed once every context that used it has
//! completed the task count recorded for it, and no transfer is pending.

use alloc::vec::Vec;

use hashbrown::HashMap;
use kiln_core::{
    AllocDesc, AllocationHandle, AllocationInfo, AllocationKind, AllocationRegistry,
    AllocationUsage, ByteSize, ContextId, Error, GpuAddr, Result, TaskCount,
};
use spin::Mutex;

use crate::address_space::{AddressSpace, VaRange, DRIVER_RANGE};

// =============================================================================
// TRACKED ALLOCATION
// =============================================================================

/// Per-context use of an allocation
#[derive(Debug, Clone, Copy, Default)]
struct ContextUsage {
    /// Outstanding `make_resident` calls
    resident: u32,
    /// Last submission that referenced the allocation
    task_count: TaskCount,
}

#[derive(Debug)]
struct TrackedAllocation {
    info: AllocationInfo,
    /// `None` for host pointer allocations, which reuse the host address
    va: Option<VaRange>,
    usage: HashMap<ContextId, ContextUsage>,
    pending_transfers: u32,
}

impl TrackedAllocation {
    fn is_busy(&self, completed: &HashMap<ContextId, TaskCount>) -> bool {
        self.pending_transfers > 0
            || self.usage.iter().any(|(ctx, entry)| {
                entry.resident > 0 || entry.task_count > completed.get(ctx).copied().unwrap_or(0)
            })
    }
}

/// An allocation handed back to the tracker until its task count completes
#[derive(Debug, Clone, Copy)]
struct StoredAllocation {
    handle: AllocationHandle,
    context: ContextId,
    usage: AllocationUsage,
    task_count: TaskCount,
}

/// Tracker statistics
#[derive(Debug, Clone, Default)]
pub struct TrackerStats {
    /// Total allocations created
    pub total_created: u64,
    /// Total allocations destroyed
    pub total_destroyed: u64,
    /// Current live allocations
    pub active_allocations: u64,
    /// Current deferred frees
    pub pending_frees: u64,
    /// Reusable allocations handed back out
    pub reuse_hits: u64,
    /// Total bytes in use
    pub memory_in_use: u64,
}

// =============================================================================
// ALLOCATION TRACKER
// =============================================================================

#[derive(Debug)]
struct TrackerInner {
    space: AddressSpace,
    allocations: HashMap<AllocationHandle, TrackedAllocation>,
    stored: Vec<StoredAllocation>,
    pending_frees: Vec<AllocationHandle>,
    completed: HashMap<ContextId, TaskCount>,
    next_id: u64,
    budget: u64,
    stats: TrackerStats,
}

/// Tracks allocations and their lifecycle
#[derive(Debug)]
pub struct AllocationTracker {
    inner: Mutex<TrackerInner>,
}

impl AllocationTracker {
    /// Create a tracker over the default driver address range
    pub fn new() -> Self {
        Self::with_budget(DRIVER_RANGE, ByteSize::from_bytes(u64::MAX))
    }

    /// Create a tracker over `range` that refuses to hold more than `budget`
    pub fn with_budget(range: VaRange, budget: ByteSize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                space: AddressSpace::new(range),
                allocations: HashMap::new(),
                stored: Vec::new(),
                pending_frees: Vec::new(),
                completed: HashMap::new(),
                next_id: 1,
                budget: budget.as_bytes(),
                stats: TrackerStats::default(),
            }),
        }
    }

    /// Release the caller's ownership of an allocation
    ///
    /// Returns `true` if it was destroyed now, `false` if the free was
    /// deferred until the GPU is done with it.
    pub fn release(&self, handle: AllocationHandle) -> Result<bool> {
        let mut inner = self.inner.lock();
        let tracked = inner.allocations.get(&handle).ok_or(Error::NotFound)?;

        if tracked.is_busy(&inner.completed) {
            if !inner.pending_frees.contains(&handle) {
                inner.pending_frees.push(handle);
                inner.stats.pending_frees += 1;
            }
            log::debug!("allocation {:?} busy, free deferred", handle);
            return Ok(false);
        }

        inner.destroy(handle)?;
        Ok(true)
    }

    /// Outstanding transfers on an allocation
    pub fn pending_transfers(&self, handle: AllocationHandle) -> Result<u32> {
        let inner = self.inner.lock();
        let tracked = inner.allocations.get(&handle).ok_or(Error::NotFound)?;
        Ok(tracked.pending_transfers)
    }

    /// Check residency on a context
    pub fn is_resident(&self, handle: AllocationHandle, context: ContextId) -> bool {
        let inner = self.inner.lock();
        inner
            .allocations
            .get(&handle)
            .and_then(|t| t.usage.get(&context))
            .is_some_and(|u| u.resident > 0)
    }

    /// Check whether a handle is still alive
    pub fn contains(&self, handle: AllocationHandle) -> bool {
        self.inner.lock().allocations.contains_key(&handle)
    }

    /// Number of allocations waiting in the stored lists
    pub fn stored_count(&self, usage: AllocationUsage) -> usize {
        self.inner
            .lock()
            .stored
            .iter()
            .filter(|s| s.usage == usage)
            .count()
    }

    /// Get statistics
    pub fn stats(&self) -> TrackerStats {
        self.inner.lock().stats.clone()
    }
}

impl Default for AllocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerInner {
    fn get_mut(&mut self, handle: AllocationHandle) -> Result<&mut TrackedAllocation> {
        self.allocations.get_mut(&handle).ok_or(Error::NotFound)
    }

    fn destroy(&mut self, handle: AllocationHandle) -> Result<()> {
        let tracked = self.allocations.remove(&handle).ok_or(Error::NotFound)?;
        if let Some(va) = tracked.va {
            self.space.free(va)?;
        }

        self.stats.total_destroyed += 1;
        self.stats.active_allocations -= 1;
        self.stats.memory_in_use -= tracked.info.size.as_bytes();
        log::debug!(
            "destroyed {:?} ({:?}, {})",
            handle,
            tracked.info.kind,
            tracked.info.size
        );
        Ok(())
    }

    fn retry_pending_frees(&mut self) {
        let mut i = 0;
        while i < self.pending_frees.len() {
            let handle = self.pending_frees[i];
            let busy = self
                .allocations
                .get(&handle)
                .is_some_and(|t| t.is_busy(&self.completed));
            if busy {
                i += 1;
                continue;
            }
            self.pending_frees.swap_remove(i);
            self.stats.pending_frees -= 1;
            if self.destroy(handle).is_err() {
                log::warn!("deferred free of unknown allocation {:?}", handle);
            }
        }
    }
}

// =============================================================================
// REGISTRY IMPLEMENTATION
// =============================================================================

impl AllocationRegistry for AllocationTracker {
    fn allocate(&self, desc: &AllocDesc) -> Result<AllocationHandle> {
        let mut inner = self.inner.lock();
        let size = desc.size.as_bytes();
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        if inner.stats.memory_in_use.saturating_add(size) > inner.budget {
            log::warn!("allocation of {} exceeds budget", desc.size);
            return Err(Error::AllocationFailed);
        }

        let (gpu_addr, va) = match desc.kind {
            AllocationKind::ExternalHostPtr => {
                let host = desc.host_address.ok_or(Error::InvalidParameter)?;
                (GpuAddr::new(host), None)
            }
            _ => {
                let va = inner
                    .space
                    .allocate(desc.size.align_up(desc.pool.page_size()), desc.alignment)
                    .map_err(|_| Error::AllocationFailed)?;
                (va.start, Some(va))
            }
        };

        let handle = AllocationHandle::new(inner.next_id);
        inner.next_id += 1;

        inner.allocations.insert(handle, TrackedAllocation {
            info: AllocationInfo {
                gpu_addr,
                size: desc.size,
                pool: desc.pool,
                kind: desc.kind,
                flags: desc.flags,
            },
            va,
            usage: HashMap::new(),
            pending_transfers: 0,
        });

        inner.stats.total_created += 1;
        inner.stats.active_allocations += 1;
        inner.stats.memory_in_use += size;
        log::debug!(
            "allocated {:?} ({:?}, {}) at {}",
            handle,
            desc.kind,
            desc.size,
            gpu_addr
        );

        Ok(handle)
    }

    fn resolve(&self, handle: AllocationHandle) -> Result<AllocationInfo> {
        let inner = self.inner.lock();
        inner
            .allocations
            .get(&handle)
            .map(|t| t.info)
            .ok_or(Error::NotFound)
    }

    fn make_resident(&self, handle: AllocationHandle, context: ContextId) -> Result<()> {
        let mut inner = self.inner.lock();
        let tracked = inner.get_mut(handle)?;
        tracked.usage.entry(context).or_default().resident += 1;
        log::trace!("{:?} resident on {}", handle, context);
        Ok(())
    }

    fn make_non_resident(&self, handle: AllocationHandle, context: ContextId) -> Result<()> {
        let mut inner = self.inner.lock();
        let tracked = inner.get_mut(handle)?;
        let entry = tracked.usage.get_mut(&context).ok_or(Error::InvalidState)?;
        if entry.resident == 0 {
            return Err(Error::InvalidState);
        }
        entry.resident -= 1;
        Ok(())
    }

    fn completion_stamp(&self, handle: AllocationHandle, context: ContextId) -> Result<TaskCount> {
        let inner = self.inner.lock();
        let tracked = inner.allocations.get(&handle).ok_or(Error::NotFound)?;
        Ok(tracked.usage.get(&context).map_or(0, |u| u.task_count))
    }

    fn update_task_count(
        &self,
        handle: AllocationHandle,
        context: ContextId,
        task_count: TaskCount,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(handle)?.usage.entry(context).or_default();
        entry.task_count = entry.task_count.max(task_count);
        Ok(())
    }

    fn add_pending_transfer(&self, handle: AllocationHandle) -> Result<u32> {
        let mut inner = self.inner.lock();
        let tracked = inner.get_mut(handle)?;
        tracked.pending_transfers += 1;
        Ok(tracked.pending_transfers)
    }

    fn store_allocation(
        &self,
        handle: AllocationHandle,
        context: ContextId,
        usage: AllocationUsage,
        task_count: TaskCount,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.allocations.contains_key(&handle) {
            return Err(Error::NotFound);
        }
        inner.stored.push(StoredAllocation {
            handle,
            context,
            usage,
            task_count,
        });
        Ok(())
    }

    fn obtain_reusable(
        &self,
        min_size: ByteSize,
        kind: AllocationKind,
        context: ContextId,
        completed: TaskCount,
    ) -> Option<AllocationHandle> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let allocations = &inner.allocations;

        let index = inner.stored.iter().position(|s| {
            s.usage == AllocationUsage::Reusable
                && s.context == context
                && s.task_count <= completed
                && allocations
                    .get(&s.handle)
                    .is_some_and(|t| t.info.kind == kind && t.info.size >= min_size)
        })?;

        let stored = inner.stored.swap_remove(index);
        inner.stats.reuse_hits += 1;
        log::debug!("reusing {:?} for {:?}", stored.handle, kind);
        Some(stored.handle)
    }

    fn clean_allocation_list(
        &self,
        context: ContextId,
        completed: TaskCount,
        usage: AllocationUsage,
    ) -> usize {
        let mut inner = self.inner.lock();
        let level = inner.completed.entry(context).or_insert(0);
        *level = (*level).max(completed);

        let mut released = 0;
        let mut i = 0;
        while i < inner.stored.len() {
            let stored = inner.stored[i];
            if stored.context != context || stored.usage != usage || stored.task_count > completed
            {
                i += 1;
                continue;
            }
            inner.stored.swap_remove(i);

            if let Some(tracked) = inner.allocations.get_mut(&stored.handle) {
                if tracked.info.kind == AllocationKind::ExternalHostPtr {
                    tracked.pending_transfers = tracked.pending_transfers.saturating_sub(1);
                }
            }
            if !inner.pending_frees.contains(&stored.handle) {
                inner.pending_frees.push(stored.handle);
                inner.stats.pending_frees += 1;
            }
            released += 1;
        }

        inner.retry_pending_frees();
        released
    }
}
