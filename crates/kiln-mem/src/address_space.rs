//! # GPU Address Space
//!
//! First-fit virtual address allocation for registry-owned allocations.

use alloc::vec::Vec;

use kiln_core::{ByteSize, Error, GpuAddr, Result};

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: GpuAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: GpuAddr::new(start.raw() + size.as_bytes()),
        }
    }

    /// Get range size
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end - self.start)
    }

    /// Check if address is in range
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Default range for driver-owned allocations
pub const DRIVER_RANGE: VaRange = VaRange {
    start: GpuAddr::new(0x0000_8000_0000_0000),
    end: GpuAddr::new(0x0000_8010_0000_0000),
};

// =============================================================================
// ADDRESS SPACE
// =============================================================================

#[derive(Debug, Clone)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

/// GPU virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    /// Managed range
    range: VaRange,
    /// Blocks covering the range, sorted by address
    blocks: Vec<VaBlock>,
    /// Bytes currently handed out
    allocated: u64,
}

impl AddressSpace {
    /// Create a new address space
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: alloc::vec![VaBlock { range, free: true }],
            allocated: 0,
        }
    }

    /// Get managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Allocate virtual address range
    pub fn allocate(&mut self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        if size.as_bytes() == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        let size = size.as_bytes();
        let alignment = alignment.max(ByteSize::KIB_4.as_bytes());

        let fit = self.blocks.iter().enumerate().find_map(|(i, block)| {
            if !block.free {
                return None;
            }
            let start = block.range.start.align_up(alignment);
            let end = start.raw().checked_add(size)?;
            (end <= block.range.end.raw()).then_some((i, VaRange {
                start,
                end: GpuAddr::new(end),
            }))
        });

        let (index, alloc_range) = fit.ok_or(Error::OutOfMemory)?;
        self.split_block(index, alloc_range);
        self.allocated += size;

        Ok(alloc_range)
    }

    fn split_block(&mut self, index: usize, alloc: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if alloc.start > block.range.start {
            self.blocks.insert(at, VaBlock {
                range: VaRange {
                    start: block.range.start,
                    end: alloc.start,
                },
                free: true,
            });
            at += 1;
        }

        self.blocks.insert(at, VaBlock {
            range: alloc,
            free: false,
        });

        if alloc.end < block.range.end {
            self.blocks.insert(at + 1, VaBlock {
                range: VaRange {
                    start: alloc.end,
                    end: block.range.end,
                },
                free: true,
            });
        }
    }

    /// Free a virtual address range
    pub fn free(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
            .ok_or(Error::NotFound)?;

        self.blocks[index].free = true;
        self.allocated -= range.size().as_bytes();
        self.merge_free_blocks();

        Ok(())
    }

    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Bytes currently allocated
    pub fn allocated(&self) -> ByteSize {
        ByteSize::from_bytes(self.allocated)
    }

    /// Get free space
    pub fn free_space(&self) -> ByteSize {
        ByteSize::from_bytes(self.range.size().as_bytes() - self.allocated)
    }
}
