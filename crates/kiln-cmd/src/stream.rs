//! # Command Stream
//!
//! CPU view of the current command buffer segment. Space is reserved up
//! front in exact byte counts and must be filled exactly.

use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use kiln_core::{AllocationHandle, Error, GpuAddr, Result};

// =============================================================================
// COMMAND STREAM
// =============================================================================

/// One command buffer segment and its write cursor
#[derive(Debug)]
pub struct CommandStream {
    /// Backing allocation
    allocation: AllocationHandle,
    /// GPU address of byte 0
    gpu_base: GpuAddr,
    /// Segment contents
    buffer: Vec<u8>,
    /// Bytes written
    used: usize,
}

impl CommandStream {
    /// Wrap a segment of `capacity` bytes
    pub fn new(allocation: AllocationHandle, gpu_base: GpuAddr, capacity: usize) -> Self {
        Self {
            allocation,
            gpu_base,
            buffer: vec![0; capacity],
            used: 0,
        }
    }

    /// Segment size
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes written
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still free
    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    /// Backing allocation
    pub fn allocation(&self) -> AllocationHandle {
        self.allocation
    }

    /// GPU address of byte 0
    pub fn gpu_base(&self) -> GpuAddr {
        self.gpu_base
    }

    /// Written bytes in `range`
    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        let end = range.end.min(self.used);
        &self.buffer[range.start.min(end)..end]
    }

    /// Drop everything written after `offset`
    pub fn rewind(&mut self, offset: usize) {
        if offset < self.used {
            self.buffer[offset..self.used].fill(0);
            self.used = offset;
        }
    }

    /// Switch to a new segment; returns the old allocation
    pub fn replace(
        &mut self,
        allocation: AllocationHandle,
        gpu_base: GpuAddr,
        capacity: usize,
    ) -> AllocationHandle {
        let old = core::mem::replace(self, Self::new(allocation, gpu_base, capacity));
        old.allocation
    }

    /// Reserve exactly `len` bytes at the cursor
    ///
    /// Nothing is committed until [`Reservation::finish`] succeeds.
    pub fn reserve(&mut self, len: usize) -> Result<Reservation<'_>> {
        if len > self.available() {
            return Err(Error::CommandBufferFull);
        }
        let start = self.used;
        Ok(Reservation {
            stream: self,
            start,
            len,
            written: 0,
        })
    }
}

// =============================================================================
// RESERVATION
// =============================================================================

/// Exactly-sized window of a command stream
#[derive(Debug)]
pub struct Reservation<'a> {
    stream: &'a mut CommandStream,
    start: usize,
    len: usize,
    written: usize,
}

impl Reservation<'_> {
    /// Offset of the window in the stream
    pub fn start(&self) -> usize {
        self.start
    }

    /// GPU address of the next byte
    pub fn gpu_cursor(&self) -> GpuAddr {
        self.stream.gpu_base + (self.start + self.written) as u64
    }

    /// Bytes left in the window
    pub fn remaining(&self) -> usize {
        self.len - self.written
    }

    /// Append encoded bytes
    ///
    /// Writing past the reserved window is an estimator/encoder mismatch.
    pub fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            log::error!(
                "encoder overran reservation: {} + {} > {}",
                self.written,
                bytes.len(),
                self.len
            );
            return Err(Error::EncodingSizeMismatch);
        }
        let at = self.start + self.written;
        self.stream.buffer[at..at + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
        Ok(())
    }

    /// Commit the window; it must be completely filled
    pub fn finish(self) -> Result<usize> {
        if self.written != self.len {
            log::error!(
                "encoder under-filled reservation: {} of {} bytes",
                self.written,
                self.len
            );
            self.stream.buffer[self.start..self.start + self.written].fill(0);
            return Err(Error::EncodingSizeMismatch);
        }
        self.stream.used = self.start + self.len;
        Ok(self.len)
    }
}
