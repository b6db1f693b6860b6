//! # Submission Tracker
//!
//! Per-queue owner of the command buffer, the task counter and the wait
//! logic.
//!
//! ```text
//!            dispatch(defer)        flush             wait
//!   Idle ───────────────► Batched ───────► Flushed ───────► Waiting
//!                            ▲                │                │
//!                            └── dispatch ────┘      tag >= target ──► Completed
//!                                                    hang ───────────► Hung (sticky)
//! ```
//!
//! Capacity checks, segment switches, encoding and counter updates all
//! happen under one lock. The registry keeps its own lock; waiting polls the
//! completion tag without holding either.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use kiln_core::{
    AllocDesc, AllocationHandle, AllocationKind, AllocationRegistry, AllocationUsage, ByteSize,
    CompletionTag, ContextId, Error, FlushStamp, QueueThrottle, Result, SubmitError, TaskCount,
    WaitStatus,
};
use spin::Mutex;

use crate::config::{DispatchConfig, QueueConfig};
use crate::descriptor::FillDescriptor;
use crate::encoder::{BlitEncoder, BlitOperation, Residency};
use crate::family::CopyEngineFamily;
use crate::stream::CommandStream;
use crate::transport::{BatchBuffer, SubmissionTransport};

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing recorded
    Idle,
    /// Encoded work waiting for a flush
    Batched,
    /// Work handed to the transport
    Flushed,
    /// A caller is waiting for completion
    Waiting,
    /// The last wait observed its target
    Completed,
    /// The device stopped responding; terminal
    Hung,
}

/// Submission counters of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmissionState {
    /// Task count of the last flush
    pub task_count: TaskCount,
    /// Ordering level raised by barriers
    pub task_level: u32,
    /// Stamp of the last submission
    pub flush_stamp: FlushStamp,
    /// Task count of the last batch handed to the transport
    pub latest_flushed_task_count: TaskCount,
}

/// Outcome of a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FlushResult {
    /// Submitted, or nothing was pending; carries the latest stamp
    Flushed(FlushStamp),
    /// The device hung
    GpuHang,
}

/// Outcome of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum DispatchStatus {
    /// Encoded and flushed
    Submitted {
        /// Task count published by the flush
        task_count: TaskCount,
        /// Stamp of the flush
        flush_stamp: FlushStamp,
    },
    /// Encoded and left pending
    Deferred {
        /// Task count the pending batch will publish
        task_count: TaskCount,
    },
    /// The queue is hung; nothing was encoded or submitted
    GpuHang,
}

#[derive(Debug)]
struct TrackerInner {
    queue: QueueState,
    counters: SubmissionState,
    stream: CommandStream,
    /// Start of the pending batch in `stream`
    batch_start: usize,
    /// Allocations made resident for the pending batch
    residency: Vec<AllocationHandle>,
    /// Host pointer wrappers to retire when the pending batch is flushed
    transients: Vec<AllocationHandle>,
}

impl TrackerInner {
    fn has_pending(&self) -> bool {
        self.stream.used() > self.batch_start
    }
}

// =============================================================================
// SUBMISSION TRACKER
// =============================================================================

/// Dispatches blit work on one copy-engine queue and tracks its completion
pub struct SubmissionTracker<F, R, T>
where
    F: CopyEngineFamily,
    R: AllocationRegistry + ?Sized,
    T: SubmissionTransport + ?Sized,
{
    family: F,
    registry: Arc<R>,
    transport: Arc<T>,
    config: QueueConfig,
    tag: CompletionTag,
    tag_allocation: AllocationHandle,
    global_fence: Option<AllocationHandle>,
    inner: Mutex<TrackerInner>,
    clients: AtomicU32,
}

impl<F, R, T> SubmissionTracker<F, R, T>
where
    F: CopyEngineFamily,
    R: AllocationRegistry + ?Sized,
    T: SubmissionTransport + ?Sized,
{
    /// Create a queue: allocates the completion tag, the global fence when
    /// configured, and the first command buffer segment
    pub fn new(family: F, registry: Arc<R>, transport: Arc<T>, config: QueueConfig) -> Result<Self> {
        let tag_allocation =
            registry.allocate(&AllocDesc::new(AllocationKind::TagBuffer, ByteSize::KIB_4))?;
        let tag = CompletionTag::new(registry.resolve(tag_allocation)?.gpu_addr);

        let global_fence = if config.global_sequencer_flush {
            Some(registry.allocate(&AllocDesc::new(AllocationKind::GlobalFence, ByteSize::KIB_4))?)
        } else {
            None
        };

        let segment = registry.allocate(&AllocDesc::new(
            AllocationKind::CommandBuffer,
            config.segment_size(),
        ))?;
        let info = registry.resolve(segment)?;
        let stream = CommandStream::new(segment, info.gpu_addr, info.size.as_bytes() as usize);

        log::info!(
            "{} queue on {}: {} command buffer, tag at {}",
            family.name(),
            config.context,
            info.size,
            tag.gpu_addr()
        );

        Ok(Self {
            family,
            registry,
            transport,
            config,
            tag,
            tag_allocation,
            global_fence,
            inner: Mutex::new(TrackerInner {
                queue: QueueState::Idle,
                counters: SubmissionState::default(),
                stream,
                batch_start: 0,
                residency: Vec::new(),
                transients: Vec::new(),
            }),
            clients: AtomicU32::new(0),
        })
    }

    /// Encode `ops` and, unless `defer_flush`, submit them
    pub fn dispatch<O: BlitOperation>(
        &self,
        ops: &[O],
        defer_flush: bool,
        config: &DispatchConfig,
    ) -> Result<DispatchStatus> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let encoder = BlitEncoder::new(&self.family, config);

        let fence_value = match self.record(inner, &encoder, ops) {
            Ok(Some(fence_value)) => fence_value,
            outcome => {
                // Wrappers of ops that never joined a batch are retired now.
                let task_count = inner.counters.task_count;
                self.retire_transients(
                    task_count,
                    ops.iter().filter_map(BlitOperation::transient_allocation),
                );
                return outcome.map(|_| DispatchStatus::GpuHang);
            }
        };

        inner
            .transients
            .extend(ops.iter().filter_map(BlitOperation::transient_allocation));
        if inner.has_pending() {
            inner.queue = QueueState::Batched;
        }
        log::debug!(
            "encoded {} ops ({} bytes pending) for task count {}",
            ops.len(),
            inner.stream.used() - inner.batch_start,
            fence_value
        );

        if defer_flush {
            return Ok(DispatchStatus::Deferred {
                task_count: fence_value,
            });
        }

        Ok(match self.flush_locked(inner, &encoder)? {
            FlushResult::Flushed(flush_stamp) => DispatchStatus::Submitted {
                task_count: inner.counters.task_count,
                flush_stamp,
            },
            FlushResult::GpuHang => DispatchStatus::GpuHang,
        })
    }

    /// Encode and submit fills
    pub fn dispatch_fill(
        &self,
        fills: &[FillDescriptor],
        defer_flush: bool,
        config: &DispatchConfig,
    ) -> Result<DispatchStatus> {
        self.dispatch(fills, defer_flush, config)
    }

    /// Submit the pending batch, if any
    pub fn flush(&self) -> Result<FlushResult> {
        let config = DispatchConfig::default();
        let encoder = BlitEncoder::new(&self.family, &config);
        let mut guard = self.inner.lock();
        self.flush_locked(&mut guard, &encoder)
    }

    /// Block until the completion tag reaches `target`
    ///
    /// Pending work is flushed first. Returns `NotReady` when no flushed or
    /// pending batch can reach `target`.
    pub fn wait_for_task_count(
        &self,
        target: TaskCount,
        flush_stamp: FlushStamp,
        quick_sleep: bool,
        throttle: QueueThrottle,
    ) -> Result<WaitStatus> {
        let stamp = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.queue == QueueState::Hung {
                return Ok(WaitStatus::GpuHang);
            }

            let mut stamp = flush_stamp;
            if inner.counters.latest_flushed_task_count < target {
                let config = DispatchConfig::default();
                let encoder = BlitEncoder::new(&self.family, &config);
                match self.flush_locked(inner, &encoder)? {
                    FlushResult::Flushed(s) => stamp = s,
                    FlushResult::GpuHang => return Ok(WaitStatus::GpuHang),
                }
                if inner.counters.latest_flushed_task_count < target {
                    log::warn!(
                        "task count {} never submitted (latest {})",
                        target,
                        inner.counters.latest_flushed_task_count
                    );
                    return Ok(WaitStatus::NotReady);
                }
            }
            inner.queue = QueueState::Waiting;
            stamp
        };

        let status = self.wait_completion(target, stamp, quick_sleep, throttle);

        let mut inner = self.inner.lock();
        match status {
            WaitStatus::Ready => {
                if inner.queue == QueueState::Waiting {
                    inner.queue = QueueState::Completed;
                }
                let completed = self.tag.current();
                let freed = self.registry.clean_allocation_list(
                    self.config.context,
                    completed,
                    AllocationUsage::Temporary,
                );
                log::trace!("task count {} done, {} temporaries freed", completed, freed);
            }
            WaitStatus::GpuHang => {
                log::error!("gpu hang while waiting for task count {}", target);
                inner.queue = QueueState::Hung;
            }
            WaitStatus::NotReady => {
                if inner.queue == QueueState::Waiting {
                    inner.queue = QueueState::Flushed;
                }
            }
        }
        Ok(status)
    }

    /// Raise the task level for a CPU-visible ordering point
    pub fn enqueue_barrier(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.counters.task_level += 1;
        inner.counters.task_level
    }

    /// Record a flush stamp reported by the transport
    pub fn on_flushed(&self, flush_stamp: FlushStamp) {
        let mut inner = self.inner.lock();
        inner.counters.flush_stamp = inner.counters.flush_stamp.max(flush_stamp);
    }

    /// Encoded bytes not yet submitted
    pub fn pending_command_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner.stream.used() - inner.batch_start
    }

    /// Current command buffer segment
    pub fn command_buffer_handle(&self) -> AllocationHandle {
        self.inner.lock().stream.allocation()
    }

    /// Add a user of the queue; returns the new count
    pub fn register_client(&self) -> u32 {
        self.clients.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Remove a user of the queue; returns the new count
    pub fn unregister_client(&self) -> u32 {
        let previous = self
            .clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Current users of the queue
    pub fn active_clients(&self) -> u32 {
        self.clients.load(Ordering::Acquire)
    }

    /// Snapshot of the counters
    pub fn state(&self) -> SubmissionState {
        self.inner.lock().counters
    }

    /// Lifecycle state
    pub fn queue_state(&self) -> QueueState {
        self.inner.lock().queue
    }

    /// Completion tag written by the engine
    pub fn completion_tag(&self) -> &CompletionTag {
        &self.tag
    }

    /// Copy-engine family in use
    pub fn family(&self) -> &F {
        &self.family
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Encode `ops` into the pending batch; returns the fence value they
    /// were encoded with, or `None` if the queue is hung
    fn record<O: BlitOperation>(
        &self,
        inner: &mut TrackerInner,
        encoder: &BlitEncoder<'_, F>,
        ops: &[O],
    ) -> Result<Option<TaskCount>> {
        if inner.queue == QueueState::Hung {
            return Ok(None);
        }

        let estimates: Vec<usize> = ops.iter().map(|op| encoder.estimate(op)).collect();
        let needed = estimates.iter().sum::<usize>()
            + encoder
                .estimator()
                .max_batch_end_bytes(self.config.global_sequencer_flush);

        if !self.ensure_capacity(inner, encoder, needed)? {
            return Ok(None);
        }

        let fence_value = inner.counters.task_count + 1;
        let rewind_to = inner.stream.used();
        let resident_before = inner.residency.len();

        if let Err(e) = self.encode_ops(inner, encoder, ops, &estimates, fence_value) {
            inner.stream.rewind(rewind_to);
            Residency::new(&*self.registry, self.config.context, &mut inner.residency)
                .truncate(resident_before);
            if e == Error::EncodingSizeMismatch && cfg!(debug_assertions) {
                panic!("{} encoder disagrees with its size estimate", self.family.name());
            }
            return Err(e);
        }
        Ok(Some(fence_value))
    }

    /// Hand host pointer wrappers back as temporaries completing at `task_count`
    fn retire_transients(
        &self,
        task_count: TaskCount,
        handles: impl IntoIterator<Item = AllocationHandle>,
    ) {
        for handle in handles {
            if let Err(e) = self.registry.store_allocation(
                handle,
                self.config.context,
                AllocationUsage::Temporary,
                task_count,
            ) {
                log::warn!("cannot retire host pointer {:?}: {}", handle, e);
            }
        }
    }

    fn encode_ops<O: BlitOperation>(
        &self,
        inner: &mut TrackerInner,
        encoder: &BlitEncoder<'_, F>,
        ops: &[O],
        estimates: &[usize],
        fence_value: TaskCount,
    ) -> Result<()> {
        for (op, &estimate) in ops.iter().zip(estimates) {
            let mut residency =
                Residency::new(&*self.registry, self.config.context, &mut inner.residency);
            op.register_residency(&mut residency)?;

            let mut window = inner.stream.reserve(estimate)?;
            encoder.encode_op(op, fence_value, &mut window)?;
            window.finish()?;
        }
        Ok(())
    }

    /// Make room for `needed` bytes; returns `false` if the queue hung
    /// while draining pending work
    fn ensure_capacity(
        &self,
        inner: &mut TrackerInner,
        encoder: &BlitEncoder<'_, F>,
        needed: usize,
    ) -> Result<bool> {
        if inner.stream.available() >= needed {
            return Ok(true);
        }

        if inner.has_pending() {
            if let FlushResult::GpuHang = self.flush_locked(inner, encoder)? {
                return Ok(false);
            }
        }

        let size = self
            .config
            .segment_size()
            .as_bytes()
            .max((needed as u64).next_multiple_of(QueueConfig::COMMAND_BUFFER_ALIGNMENT));
        let size = ByteSize::from_bytes(size);
        let context = self.config.context;

        let segment = match self.registry.obtain_reusable(
            size,
            AllocationKind::CommandBuffer,
            context,
            self.tag.current(),
        ) {
            Some(handle) => handle,
            None => self
                .registry
                .allocate(&AllocDesc::new(AllocationKind::CommandBuffer, size))?,
        };
        let info = self.registry.resolve(segment)?;

        let old = inner
            .stream
            .replace(segment, info.gpu_addr, info.size.as_bytes() as usize);
        inner.batch_start = 0;
        self.registry.store_allocation(
            old,
            context,
            AllocationUsage::Reusable,
            inner.counters.task_count,
        )?;

        log::debug!("switched command buffer {:?} -> {:?}", old, segment);
        Ok(true)
    }

    fn flush_locked(
        &self,
        inner: &mut TrackerInner,
        encoder: &BlitEncoder<'_, F>,
    ) -> Result<FlushResult> {
        if inner.queue == QueueState::Hung {
            return Ok(FlushResult::GpuHang);
        }
        if !inner.has_pending() {
            return Ok(FlushResult::Flushed(inner.counters.flush_stamp));
        }

        let context = self.config.context;
        let task_count = inner.counters.task_count + 1;
        let end_start = inner.stream.used();
        let global_sequencer_flush = self.config.global_sequencer_flush;

        let end_len = encoder
            .estimator()
            .batch_end_bytes(end_start, global_sequencer_flush);
        let mut window = inner.stream.reserve(end_len)?;
        encoder.encode_batch_end(self.tag.gpu_addr(), task_count, global_sequencer_flush, &mut window)?;
        window.finish()?;

        let surfaces = inner.residency.len();
        if let Err(e) = self.stamp_residency(inner, task_count) {
            // Leave the batch open so later dispatches can still append.
            Residency::new(&*self.registry, context, &mut inner.residency).truncate(surfaces);
            inner.stream.rewind(end_start);
            return Err(e);
        }

        let start = inner.batch_start;
        let batch = BatchBuffer {
            command_buffer: inner.stream.allocation(),
            gpu_address: inner.stream.gpu_base() + start as u64,
            start_offset: start,
            commands: inner.stream.bytes(start..inner.stream.used()),
            task_count,
            residency: &inner.residency,
            context,
        };
        let submitted = self.transport.submit(&batch);

        // A rejected batch stays pending with its surfaces still resident.
        let keep = match submitted {
            Err(SubmitError::Rejected) => surfaces,
            _ => 0,
        };
        Residency::new(&*self.registry, context, &mut inner.residency).truncate(keep);

        match submitted {
            Ok(stamp) => {
                let transients = core::mem::take(&mut inner.transients);
                self.retire_transients(task_count, transients);
                inner.counters.task_count = task_count;
                inner.counters.latest_flushed_task_count = task_count;
                inner.counters.flush_stamp = inner.counters.flush_stamp.max(stamp);
                inner.batch_start = inner.stream.used();
                inner.queue = QueueState::Flushed;
                log::debug!("flushed task count {} as stamp {}", task_count, stamp);
                Ok(FlushResult::Flushed(stamp))
            }
            Err(SubmitError::GpuHang) => {
                log::error!("gpu hang submitting task count {}", task_count);
                inner.queue = QueueState::Hung;
                let transients = core::mem::take(&mut inner.transients);
                self.retire_transients(inner.counters.task_count, transients);
                Ok(FlushResult::GpuHang)
            }
            Err(e @ SubmitError::Rejected) => {
                log::warn!("transport rejected task count {}: {}", task_count, e);
                inner.stream.rewind(end_start);
                Err(e.into())
            }
        }
    }

    /// Add the queue's own allocations to the batch residency and stamp
    /// every entry with `task_count`
    fn stamp_residency(&self, inner: &mut TrackerInner, task_count: TaskCount) -> Result<()> {
        let context = self.config.context;
        let command_buffer = inner.stream.allocation();
        let mut residency = Residency::new(&*self.registry, context, &mut inner.residency);
        residency.add(self.tag_allocation)?;
        if let Some(fence) = self.global_fence {
            residency.add(fence)?;
        }
        residency.add(command_buffer)?;

        for &handle in inner.residency.iter() {
            self.registry.update_task_count(handle, context, task_count)?;
        }
        Ok(())
    }

    fn wait_completion(
        &self,
        target: TaskCount,
        stamp: FlushStamp,
        quick_sleep: bool,
        throttle: QueueThrottle,
    ) -> WaitStatus {
        let params = self
            .config
            .kmd_notify
            .timeout_params(quick_sleep, self.tag.current(), target);
        let timeout = params.enable_timeout.then_some(params.timeout_us);

        match self.poll(target, timeout) {
            WaitStatus::NotReady => {}
            done => return done,
        }

        if let WaitStatus::GpuHang = self.transport.wait_for_flush_stamp(stamp, throttle) {
            return WaitStatus::GpuHang;
        }
        self.poll(target, None)
    }

    /// Spin on the tag; `NotReady` means the timeout expired
    fn poll(&self, target: TaskCount, timeout_us: Option<u64>) -> WaitStatus {
        let start = self.transport.monotonic_time_us();
        let mut last_hang_check = start;

        loop {
            if self.tag.is_reached(target) {
                return WaitStatus::Ready;
            }

            let now = self.transport.monotonic_time_us();
            if !self.config.disable_gpu_hang_detection
                && now.saturating_sub(last_hang_check) >= self.config.gpu_hang_check_period_us
            {
                last_hang_check = now;
                if self.transport.is_gpu_hang_detected() {
                    return WaitStatus::GpuHang;
                }
            }

            if timeout_us.is_some_and(|t| now.saturating_sub(start) >= t) {
                return WaitStatus::NotReady;
            }
            core::hint::spin_loop();
        }
    }
}

impl<F, R, T> Drop for SubmissionTracker<F, R, T>
where
    F: CopyEngineFamily,
    R: AllocationRegistry + ?Sized,
    T: SubmissionTransport + ?Sized,
{
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let context = self.config.context;
        let task_count = inner.counters.task_count;

        let owned = [Some(inner.stream.allocation()), Some(self.tag_allocation), self.global_fence];
        for handle in owned.into_iter().flatten().chain(inner.transients.drain(..)) {
            if let Err(e) = self.registry.store_allocation(
                handle,
                context,
                AllocationUsage::Temporary,
                task_count,
            ) {
                log::warn!("leaking {:?} on queue teardown: {}", handle, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU64};

    use kiln_core::{AllocationInfo, FenceSlot, GpuAddr, Vec3};
    use kiln_mem::AllocationTracker;

    use crate::descriptor::{
        BlitDirection, BufferSurface, CopyDescriptor, CopyEndpoint, CopyRequest,
        DescriptorBuilder, HostPtr, SurfaceLayout, SyncMode,
    };
    use crate::family::Gen12Family;
    use crate::instruction::{Instruction, InstructionBytes, InstructionKind};

    #[derive(Debug, Clone, Copy)]
    struct RecordedBatch {
        task_count: TaskCount,
        gpu_address: GpuAddr,
        len: usize,
        residency: usize,
    }

    #[derive(Default)]
    struct FakeTransport {
        tag: Mutex<Option<CompletionTag>>,
        batches: Mutex<Vec<RecordedBatch>>,
        clock: AtomicU64,
        next_stamp: AtomicU64,
        hang: AtomicBool,
        reject: AtomicBool,
        complete_on_submit: AtomicBool,
    }

    impl FakeTransport {
        fn attach(&self, tag: &CompletionTag) {
            *self.tag.lock() = Some(tag.clone());
        }

        fn signal(&self, value: TaskCount) {
            if let Some(tag) = self.tag.lock().as_ref() {
                tag.signal(value);
            }
        }

        fn batches(&self) -> Vec<RecordedBatch> {
            self.batches.lock().clone()
        }
    }

    impl SubmissionTransport for FakeTransport {
        fn submit(&self, batch: &BatchBuffer<'_>) -> core::result::Result<FlushStamp, SubmitError> {
            if self.reject.load(Ordering::Acquire) {
                return Err(SubmitError::Rejected);
            }
            if self.hang.load(Ordering::Acquire) {
                return Err(SubmitError::GpuHang);
            }
            self.batches.lock().push(RecordedBatch {
                task_count: batch.task_count,
                gpu_address: batch.gpu_address,
                len: batch.commands.len(),
                residency: batch.residency.len(),
            });
            if self.complete_on_submit.load(Ordering::Acquire) {
                self.signal(batch.task_count);
            }
            Ok(self.next_stamp.fetch_add(1, Ordering::AcqRel) + 1)
        }

        fn wait_for_flush_stamp(&self, _stamp: FlushStamp, _throttle: QueueThrottle) -> WaitStatus {
            if self.hang.load(Ordering::Acquire) {
                return WaitStatus::GpuHang;
            }
            let last = self.batches.lock().iter().map(|b| b.task_count).max().unwrap_or(0);
            self.signal(last);
            WaitStatus::Ready
        }

        fn is_gpu_hang_detected(&self) -> bool {
            self.hang.load(Ordering::Acquire)
        }

        fn monotonic_time_us(&self) -> u64 {
            self.clock.fetch_add(50, Ordering::AcqRel)
        }
    }

    type Queue = SubmissionTracker<Gen12Family, AllocationTracker, FakeTransport>;

    fn queue_for<F: CopyEngineFamily>(
        family: F,
        config: QueueConfig,
    ) -> (
        Arc<AllocationTracker>,
        Arc<FakeTransport>,
        SubmissionTracker<F, AllocationTracker, FakeTransport>,
    ) {
        let registry = Arc::new(AllocationTracker::new());
        let transport = Arc::new(FakeTransport::default());
        let queue =
            SubmissionTracker::new(family, registry.clone(), transport.clone(), config).unwrap();
        transport.attach(queue.completion_tag());
        (registry, transport, queue)
    }

    fn queue_with(config: QueueConfig) -> (Arc<AllocationTracker>, Arc<FakeTransport>, Queue) {
        queue_for(Gen12Family::new(), config)
    }

    fn queue() -> (Arc<AllocationTracker>, Arc<FakeTransport>, Queue) {
        queue_with(QueueConfig {
            gpu_hang_check_period_us: 100,
            ..Default::default()
        })
    }

    fn buffer(registry: &AllocationTracker, size: u64) -> (AllocationHandle, AllocationInfo) {
        let handle = registry
            .allocate(&AllocDesc::new(AllocationKind::Buffer, ByteSize::from_bytes(size)))
            .unwrap();
        (handle, registry.resolve(handle).unwrap())
    }

    fn copy(registry: &AllocationTracker, size: u64) -> CopyDescriptor {
        let (src, src_info) = buffer(registry, size);
        let (dst, dst_info) = buffer(registry, size);
        CopyDescriptor::linear(src, src_info.gpu_addr, dst, dst_info.gpu_addr, size)
    }

    #[test]
    fn test_dispatch_increments_task_count() {
        let (registry, transport, queue) = queue();
        let config = DispatchConfig::default();

        for expected in 1..=3 {
            let status = queue.dispatch(&[copy(&registry, 256)], false, &config).unwrap();
            assert!(matches!(
                status,
                DispatchStatus::Submitted { task_count, .. } if task_count == expected
            ));
            let state = queue.state();
            assert_eq!(state.task_count, expected);
            assert_eq!(state.latest_flushed_task_count, state.task_count);
        }

        let batches = transport.batches();
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert_eq!(batch.len % 64, 0);
            assert!(batch.gpu_address.is_aligned(64));
            // tag, command buffer, source, destination
            assert_eq!(batch.residency, 4);
        }
        assert_eq!(queue.queue_state(), QueueState::Flushed);
        assert_eq!(queue.pending_command_bytes(), 0);
    }

    #[test]
    fn test_deferred_dispatches_share_task_count() {
        let (registry, transport, queue) = queue();
        let config = DispatchConfig::default();

        let first = queue.dispatch(&[copy(&registry, 64)], true, &config).unwrap();
        let second = queue.dispatch(&[copy(&registry, 64)], true, &config).unwrap();
        assert_eq!(first, DispatchStatus::Deferred { task_count: 1 });
        assert_eq!(second, DispatchStatus::Deferred { task_count: 1 });
        assert_eq!(queue.queue_state(), QueueState::Batched);
        assert!(queue.pending_command_bytes() > 0);
        assert!(transport.batches().is_empty());

        assert_eq!(queue.flush().unwrap(), FlushResult::Flushed(1));
        assert_eq!(queue.state().task_count, 1);
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(transport.batches()[0].residency, 6);

        // Nothing pending: the last stamp comes back and no batch is sent.
        assert_eq!(queue.flush().unwrap(), FlushResult::Flushed(1));
        assert_eq!(transport.batches().len(), 1);
    }

    #[test]
    fn test_residency_released_and_stamped() {
        let (registry, _transport, queue) = queue();
        let desc = copy(&registry, 128);
        let context = ContextId(0);

        let _ = queue.dispatch(&[desc.clone()], true, &DispatchConfig::default()).unwrap();
        assert!(registry.is_resident(desc.src_allocation, context));

        assert!(matches!(queue.flush().unwrap(), FlushResult::Flushed(_)));
        assert!(!registry.is_resident(desc.src_allocation, context));
        assert!(!registry.is_resident(queue.command_buffer_handle(), context));
        assert_eq!(registry.completion_stamp(desc.dst_allocation, context), Ok(1));
    }

    #[test]
    fn test_gpu_hang_is_sticky() {
        let (registry, transport, queue) = queue();
        let status = queue
            .dispatch(&[copy(&registry, 64)], false, &DispatchConfig::default())
            .unwrap();
        let DispatchStatus::Submitted { task_count, flush_stamp } = status else {
            panic!("expected a submission, got {:?}", status);
        };

        transport.hang.store(true, Ordering::Release);
        let wait = |q: &Queue| {
            q.wait_for_task_count(task_count, flush_stamp, false, QueueThrottle::Medium)
                .unwrap()
        };
        assert_eq!(wait(&queue), WaitStatus::GpuHang);
        assert_eq!(queue.queue_state(), QueueState::Hung);

        // Terminal even if the device later looks healthy.
        transport.hang.store(false, Ordering::Release);
        assert_eq!(wait(&queue), WaitStatus::GpuHang);
        assert_eq!(
            queue.dispatch(&[copy(&registry, 64)], false, &DispatchConfig::default()),
            Ok(DispatchStatus::GpuHang)
        );
        assert_eq!(queue.state().task_count, task_count);
    }

    #[test]
    fn test_wait_falls_back_to_os_wait() {
        let (registry, transport, queue) = queue();
        let status = queue
            .dispatch(&[copy(&registry, 64)], false, &DispatchConfig::default())
            .unwrap();
        let DispatchStatus::Submitted { task_count, flush_stamp } = status else {
            panic!("expected a submission, got {:?}", status);
        };

        // Tag untouched until the transport's blocking wait signals it.
        assert_eq!(
            queue.wait_for_task_count(task_count, flush_stamp, true, QueueThrottle::High),
            Ok(WaitStatus::Ready)
        );
        assert_eq!(queue.queue_state(), QueueState::Completed);
        assert!(transport.clock.load(Ordering::Acquire) > 0);
    }

    #[test]
    fn test_wait_flushes_batched_work() {
        let (registry, transport, queue) = queue();
        transport.complete_on_submit.store(true, Ordering::Release);

        let status = queue
            .dispatch(&[copy(&registry, 64)], true, &DispatchConfig::default())
            .unwrap();
        assert_eq!(status, DispatchStatus::Deferred { task_count: 1 });

        assert_eq!(
            queue.wait_for_task_count(1, 0, false, QueueThrottle::Medium),
            Ok(WaitStatus::Ready)
        );
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(queue.state().latest_flushed_task_count, 1);
    }

    #[test]
    fn test_wait_for_unsubmitted_task_count() {
        let (_registry, _transport, queue) = queue();
        assert_eq!(
            queue.wait_for_task_count(5, 0, false, QueueThrottle::Low),
            Ok(WaitStatus::NotReady)
        );
    }

    #[test]
    fn test_host_pointer_retired_after_completion() {
        let (registry, transport, queue) = queue();
        transport.complete_on_submit.store(true, Ordering::Release);
        let (dst, _) = buffer(&registry, 4096);

        let request = CopyRequest::new(
            BlitDirection::HostToBuffer,
            CopyEndpoint::Host(HostPtr { address: 0x7f00_1000 }),
            CopyEndpoint::Buffer(BufferSurface { allocation: dst, offset: 0 }),
            Vec3::new(512, 1, 1),
        );
        let desc = DescriptorBuilder::new(&*registry).build(&request).unwrap();
        let host = desc.transient_allocation.unwrap();

        let status = queue.dispatch(&[desc], false, &DispatchConfig::default()).unwrap();
        assert!(matches!(status, DispatchStatus::Submitted { task_count: 1, .. }));
        assert!(registry.contains(host));
        assert_eq!(registry.stored_count(AllocationUsage::Temporary), 1);

        assert_eq!(
            queue.wait_for_task_count(1, 1, false, QueueThrottle::Medium),
            Ok(WaitStatus::Ready)
        );
        assert!(!registry.contains(host));
    }

    #[test]
    fn test_invalid_direction_writes_nothing() {
        let (registry, transport, queue) = queue();
        let (src, _) = buffer(&registry, 4096);
        let (dst, _) = buffer(&registry, 4096);
        let mut request = CopyRequest::new(
            BlitDirection::BufferToBuffer,
            CopyEndpoint::Buffer(BufferSurface { allocation: src, offset: 0 }),
            CopyEndpoint::Buffer(BufferSurface { allocation: dst, offset: 0 }),
            Vec3::new(64, 1, 1),
        );
        request.direction = 99;

        let built = DescriptorBuilder::new(&*registry).build(&request);
        assert_eq!(built, Err(Error::InvalidDirection));
        assert_eq!(queue.pending_command_bytes(), 0);
        assert!(!registry.is_resident(src, ContextId(0)));
        assert!(!registry.is_resident(dst, ContextId(0)));
        assert!(transport.batches().is_empty());
    }

    #[test]
    fn test_segment_rollover_and_reuse() {
        let (registry, transport, queue) = queue();
        transport.complete_on_submit.store(true, Ordering::Release);
        // One-pixel tiles: 1000 copies of 40 bytes per op.
        let config = DispatchConfig {
            limit_max_width: Some(1),
            ..Default::default()
        };
        let first_segment = queue.command_buffer_handle();

        let _ = queue.dispatch(&[copy(&registry, 1000)], true, &config).unwrap();
        let status = queue.dispatch(&[copy(&registry, 1000)], true, &config).unwrap();
        assert_eq!(status, DispatchStatus::Deferred { task_count: 2 });
        assert_eq!(transport.batches().len(), 1);
        assert_ne!(queue.command_buffer_handle(), first_segment);
        assert_eq!(registry.stored_count(AllocationUsage::Reusable), 1);

        let _ = queue.dispatch(&[copy(&registry, 1000)], true, &config).unwrap();
        assert_eq!(transport.batches().len(), 2);
        assert_eq!(queue.command_buffer_handle(), first_segment);
        assert_eq!(registry.stats().reuse_hits, 1);
    }

    #[test]
    fn test_rejected_submission_keeps_batch() {
        let (registry, transport, queue) = queue();
        let _ = queue
            .dispatch(&[copy(&registry, 64)], true, &DispatchConfig::default())
            .unwrap();
        let pending = queue.pending_command_bytes();

        transport.reject.store(true, Ordering::Release);
        assert_eq!(queue.flush(), Err(Error::SubmissionFailed));
        assert_eq!(queue.state().task_count, 0);
        assert_eq!(queue.pending_command_bytes(), pending);

        transport.reject.store(false, Ordering::Release);
        assert_eq!(queue.flush(), Ok(FlushResult::Flushed(1)));
        assert_eq!(queue.state().task_count, 1);
    }

    #[test]
    fn test_dispatch_fill() {
        let (registry, transport, queue) = queue();
        let (dst, _) = buffer(&registry, 4096);
        let (fence, fence_info) = buffer(&registry, 64);
        let slot = FenceSlot {
            allocation: fence,
            gpu_addr: fence_info.gpu_addr,
        };
        let fill = DescriptorBuilder::new(&*registry)
            .build_fill(
                BufferSurface { allocation: dst, offset: 0 },
                4096,
                &[0xFF; 4],
                Vec::new(),
                SyncMode::TaskCountFence(slot),
            )
            .unwrap();

        let status = queue.dispatch_fill(&[fill], false, &DispatchConfig::default()).unwrap();
        assert!(matches!(status, DispatchStatus::Submitted { task_count: 1, .. }));
        // destination, fence slot, tag, command buffer
        assert_eq!(transport.batches()[0].residency, 4);
        assert_eq!(registry.completion_stamp(fence, ContextId(0)), Ok(1));
    }

    fn host_copy(registry: &AllocationTracker) -> CopyDescriptor {
        let (dst, _) = buffer(registry, 4096);
        let request = CopyRequest::new(
            BlitDirection::HostToBuffer,
            CopyEndpoint::Host(HostPtr { address: 0x7f00_2000 }),
            CopyEndpoint::Buffer(BufferSurface { allocation: dst, offset: 0 }),
            Vec3::new(256, 1, 1),
        );
        DescriptorBuilder::new(registry).build(&request).unwrap()
    }

    #[test]
    fn test_host_pointer_retired_when_submit_hangs() {
        let (registry, transport, queue) = queue();
        let desc = host_copy(&registry);
        let host = desc.transient_allocation.unwrap();

        transport.hang.store(true, Ordering::Release);
        assert_eq!(
            queue.dispatch(&[desc], false, &DispatchConfig::default()),
            Ok(DispatchStatus::GpuHang)
        );
        assert_eq!(queue.queue_state(), QueueState::Hung);
        assert_eq!(registry.stored_count(AllocationUsage::Temporary), 1);

        let cleaned =
            registry.clean_allocation_list(ContextId(0), TaskCount::MAX, AllocationUsage::Temporary);
        assert_eq!(cleaned, 1);
        assert!(!registry.contains(host));
    }

    #[test]
    fn test_host_pointer_retired_on_hung_queue() {
        let (registry, transport, queue) = queue();
        transport.hang.store(true, Ordering::Release);
        let status = queue.dispatch(&[copy(&registry, 64)], false, &DispatchConfig::default());
        assert_eq!(status, Ok(DispatchStatus::GpuHang));

        let desc = host_copy(&registry);
        let host = desc.transient_allocation.unwrap();
        assert_eq!(
            queue.dispatch(&[desc], true, &DispatchConfig::default()),
            Ok(DispatchStatus::GpuHang)
        );

        registry.clean_allocation_list(ContextId(0), TaskCount::MAX, AllocationUsage::Temporary);
        assert!(!registry.contains(host));
    }

    #[test]
    fn test_encode_error_restores_stream_and_residency() {
        let (registry, _transport, queue) = queue();
        let config = DispatchConfig::default();
        let context = ContextId(0);

        let earlier = copy(&registry, 128);
        let _ = queue.dispatch(&[earlier.clone()], true, &config).unwrap();
        let pending = queue.pending_command_bytes();

        // Layer 0x400 does not fit the fast copy's array index field.
        let mut desc = host_copy(&registry);
        desc.dst_layout = SurfaceLayout::Tiled;
        desc.dst_offset = Vec3::new(0, 0, 0x400);
        let host = desc.transient_allocation.unwrap();
        let dst = desc.dst_allocation;

        assert_eq!(queue.dispatch(&[desc], true, &config), Err(Error::NotSupported));
        assert_eq!(queue.pending_command_bytes(), pending);
        assert!(!registry.is_resident(host, context));
        assert!(!registry.is_resident(dst, context));
        assert!(registry.is_resident(earlier.src_allocation, context));

        assert_eq!(registry.clean_allocation_list(context, 0, AllocationUsage::Temporary), 1);
        assert!(!registry.contains(host));

        // The pending batch is still intact and submits normally.
        assert_eq!(queue.flush(), Ok(FlushResult::Flushed(1)));
    }

    /// Gen12 that under-reports the copy instruction size
    struct ShortCopyFamily(Gen12Family);

    impl CopyEngineFamily for ShortCopyFamily {
        fn name(&self) -> &'static str {
            "short_copy"
        }

        fn max_instruction_width(&self) -> u64 {
            self.0.max_instruction_width()
        }

        fn max_instruction_height(&self) -> u64 {
            self.0.max_instruction_height()
        }

        fn instruction_size(&self, kind: InstructionKind) -> usize {
            match kind {
                InstructionKind::Copy => self.0.instruction_size(kind) - 4,
                _ => self.0.instruction_size(kind),
            }
        }

        fn is_pre_copy_workaround_required(&self) -> bool {
            self.0.is_pre_copy_workaround_required()
        }

        fn is_post_copy_tlb_flush_required(&self) -> bool {
            self.0.is_post_copy_tlb_flush_required()
        }

        fn encode(&self, instruction: &Instruction) -> Result<InstructionBytes> {
            self.0.encode(instruction)
        }
    }

    #[test]
    #[should_panic(expected = "disagrees with its size estimate")]
    fn test_size_mismatch_panics_in_debug() {
        let (registry, _transport, queue) =
            queue_for(ShortCopyFamily(Gen12Family::new()), QueueConfig::default());
        let _ = queue.dispatch(&[copy(&registry, 64)], true, &DispatchConfig::default());
    }

    /// Registry whose task-count stamping can be made to fail
    struct FlakyRegistry {
        tracker: AllocationTracker,
        fail_stamp: AtomicBool,
    }

    impl AllocationRegistry for FlakyRegistry {
        fn allocate(&self, desc: &AllocDesc) -> Result<AllocationHandle> {
            self.tracker.allocate(desc)
        }

        fn resolve(&self, handle: AllocationHandle) -> Result<AllocationInfo> {
            self.tracker.resolve(handle)
        }

        fn make_resident(&self, handle: AllocationHandle, context: ContextId) -> Result<()> {
            self.tracker.make_resident(handle, context)
        }

        fn make_non_resident(&self, handle: AllocationHandle, context: ContextId) -> Result<()> {
            self.tracker.make_non_resident(handle, context)
        }

        fn completion_stamp(&self, handle: AllocationHandle, context: ContextId) -> Result<TaskCount> {
            self.tracker.completion_stamp(handle, context)
        }

        fn update_task_count(
            &self,
            handle: AllocationHandle,
            context: ContextId,
            task_count: TaskCount,
        ) -> Result<()> {
            if self.fail_stamp.load(Ordering::Acquire) {
                return Err(Error::InvalidState);
            }
            self.tracker.update_task_count(handle, context, task_count)
        }

        fn add_pending_transfer(&self, handle: AllocationHandle) -> Result<u32> {
            self.tracker.add_pending_transfer(handle)
        }

        fn store_allocation(
            &self,
            handle: AllocationHandle,
            context: ContextId,
            usage: AllocationUsage,
            task_count: TaskCount,
        ) -> Result<()> {
            self.tracker.store_allocation(handle, context, usage, task_count)
        }

        fn obtain_reusable(
            &self,
            min_size: ByteSize,
            kind: AllocationKind,
            context: ContextId,
            completed: TaskCount,
        ) -> Option<AllocationHandle> {
            self.tracker.obtain_reusable(min_size, kind, context, completed)
        }

        fn clean_allocation_list(
            &self,
            context: ContextId,
            completed: TaskCount,
            usage: AllocationUsage,
        ) -> usize {
            self.tracker.clean_allocation_list(context, completed, usage)
        }
    }

    #[test]
    fn test_failed_stamping_leaves_batch_open() {
        let registry = Arc::new(FlakyRegistry {
            tracker: AllocationTracker::new(),
            fail_stamp: AtomicBool::new(false),
        });
        let transport = Arc::new(FakeTransport::default());
        let queue = SubmissionTracker::new(
            Gen12Family::new(),
            registry.clone(),
            transport.clone(),
            QueueConfig::default(),
        )
        .unwrap();
        let config = DispatchConfig::default();
        let context = ContextId(0);

        let first = copy(&registry.tracker, 64);
        let _ = queue.dispatch(&[first.clone()], true, &config).unwrap();
        let pending = queue.pending_command_bytes();

        registry.fail_stamp.store(true, Ordering::Release);
        assert_eq!(queue.flush(), Err(Error::InvalidState));
        assert_eq!(queue.pending_command_bytes(), pending);
        assert!(registry.tracker.is_resident(first.src_allocation, context));
        assert!(!registry.tracker.is_resident(queue.command_buffer_handle(), context));
        assert!(transport.batches().is_empty());

        registry.fail_stamp.store(false, Ordering::Release);
        let _ = queue.dispatch(&[copy(&registry.tracker, 64)], true, &config).unwrap();
        let pending = queue.pending_command_bytes();
        assert_eq!(queue.flush(), Ok(FlushResult::Flushed(1)));

        // One batch end after both copies, none left between them.
        let family = Gen12Family::new();
        let end = BlitEncoder::new(&family, &config)
            .estimator()
            .batch_end_bytes(pending, false);
        assert_eq!(transport.batches()[0].len, pending + end);
    }

    #[test]
    fn test_global_sequencer_flush_keeps_fence_resident() {
        let (registry, transport, queue) = queue_with(QueueConfig {
            global_sequencer_flush: true,
            ..Default::default()
        });
        let _ = queue
            .dispatch(&[copy(&registry, 64)], false, &DispatchConfig::default())
            .unwrap();
        assert_eq!(transport.batches()[0].residency, 5);
    }

    #[test]
    fn test_barrier_stamps_and_clients() {
        let (_registry, _transport, queue) = queue();
        assert_eq!(queue.enqueue_barrier(), 1);
        assert_eq!(queue.enqueue_barrier(), 2);

        queue.on_flushed(9);
        queue.on_flushed(4);
        assert_eq!(queue.state().flush_stamp, 9);

        assert_eq!(queue.register_client(), 1);
        assert_eq!(queue.register_client(), 2);
        assert_eq!(queue.unregister_client(), 1);
        assert_eq!(queue.unregister_client(), 0);
        assert_eq!(queue.unregister_client(), 0);
        assert_eq!(queue.active_clients(), 0);
    }

    #[test]
    fn test_teardown_hands_back_allocations() {
        let (registry, _transport, queue) = queue();
        let active = registry.stats().active_allocations;
        drop(queue);
        assert_eq!(registry.stored_count(AllocationUsage::Temporary), 2);
        assert_eq!(registry.clean_allocation_list(ContextId(0), 0, AllocationUsage::Temporary), 2);
        assert_eq!(registry.stats().active_allocations, active - 2);
    }
}
