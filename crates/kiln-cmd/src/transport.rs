//! # Submission Transport
//!
//! The ring-buffer / kernel interface a submission tracker hands finished
//! batches to. Implemented outside this crate.

use kiln_core::{
    AllocationHandle, ContextId, FlushStamp, GpuAddr, QueueThrottle, SubmitError, TaskCount,
    WaitStatus,
};

/// One batch ready for execution
#[derive(Debug, Clone, Copy)]
pub struct BatchBuffer<'a> {
    /// Command buffer segment holding the batch
    pub command_buffer: AllocationHandle,
    /// GPU address of the first instruction
    pub gpu_address: GpuAddr,
    /// Offset of the first instruction within the segment
    pub start_offset: usize,
    /// Encoded instructions, ending with the batch end and padding
    pub commands: &'a [u8],
    /// Task count the batch publishes to the completion tag
    pub task_count: TaskCount,
    /// Allocations that must be resident while the batch runs
    pub residency: &'a [AllocationHandle],
    /// Hardware context
    pub context: ContextId,
}

/// Hands batches to hardware and waits on OS notifications
pub trait SubmissionTransport: Send + Sync {
    /// Submit a batch; returns the flush stamp identifying it
    fn submit(&self, batch: &BatchBuffer<'_>) -> core::result::Result<FlushStamp, SubmitError>;

    /// Block until the submission `stamp` signals, or the device hangs
    fn wait_for_flush_stamp(&self, stamp: FlushStamp, throttle: QueueThrottle) -> WaitStatus;

    /// Ask the device whether it stopped responding
    fn is_gpu_hang_detected(&self) -> bool;

    /// Monotonic clock in microseconds
    fn monotonic_time_us(&self) -> u64;
}
