//! # Blit Encoder
//!
//! Turn descriptors into copy-engine instructions. Every operation is
//! written in a fixed order:
//!
//! ```text
//! waits ─► arb check / pre flush ─► [ts start] ─► tiles ─► post flush ─► sync tail
//! ```
//!
//! The byte count of each operation is known in advance from
//! [`SizeEstimator`]; the encoder writes into a window of exactly that size.

use alloc::vec::Vec;

use kiln_core::{
    AllocationHandle, AllocationRegistry, ContextId, Error, FenceDependency, GpuAddr, Result,
    TaskCount, TimestampPacket, Vec3,
};

use crate::config::{BlitLimits, DispatchConfig};
use crate::descriptor::{CopyDescriptor, FillDescriptor, SurfaceLayout, SyncMode};
use crate::family::CopyEngineFamily;
use crate::instruction::{
    CopyBlt, FillBlt, FlushFlags, Instruction, InstructionKind, ENGINE_TIMESTAMP_REGISTER,
    GLOBAL_SEQUENCER_FLUSH_REGISTER,
};
use crate::stream::Reservation;
use crate::tiler::{tile_copy, tile_count, fill_tile_count, FillTiles, SizeEstimator};

// =============================================================================
// INSTRUCTION SINK
// =============================================================================

/// Destination of encoded instructions
pub trait InstructionSink {
    /// Append one instruction and its encoding
    fn push(&mut self, instruction: &Instruction, bytes: &[u8]) -> Result<()>;
}

impl InstructionSink for Reservation<'_> {
    fn push(&mut self, _instruction: &Instruction, bytes: &[u8]) -> Result<()> {
        self.emit(bytes)
    }
}

// =============================================================================
// RESIDENCY
// =============================================================================

/// Residency list of the batch being built
///
/// Each allocation is made resident once, when first added.
pub struct Residency<'a, R: AllocationRegistry + ?Sized> {
    registry: &'a R,
    context: ContextId,
    list: &'a mut Vec<AllocationHandle>,
}

impl<'a, R: AllocationRegistry + ?Sized> Residency<'a, R> {
    /// Wrap a batch residency list
    pub fn new(registry: &'a R, context: ContextId, list: &'a mut Vec<AllocationHandle>) -> Self {
        Self {
            registry,
            context,
            list,
        }
    }

    /// Make an allocation resident for the batch
    pub fn add(&mut self, handle: AllocationHandle) -> Result<()> {
        if self.list.contains(&handle) {
            return Ok(());
        }
        self.registry.make_resident(handle, self.context)?;
        self.list.push(handle);
        Ok(())
    }

    /// Entries in the list
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Check whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Drop entries added after `len`, releasing their residency
    pub fn truncate(&mut self, len: usize) {
        for handle in self.list.drain(len..) {
            if let Err(e) = self.registry.make_non_resident(handle, self.context) {
                log::warn!("failed to drop residency of {:?}: {}", handle, e);
            }
        }
    }
}

// =============================================================================
// BLIT OPERATION
// =============================================================================

/// Something the copy engine executes as one unit of tiles
pub trait BlitOperation {
    /// Producer fences to wait for
    fn dependencies(&self) -> &[FenceDependency];

    /// Completion signal
    fn sync_mode(&self) -> &SyncMode;

    /// Size class of each tile instruction
    fn body_kind(&self) -> InstructionKind;

    /// Number of tile instructions under `limits`
    fn tile_count(&self, limits: BlitLimits) -> usize;

    /// Allocations the operation reads or writes, besides fences
    fn surfaces(&self) -> Vec<AllocationHandle>;

    /// Host pointer wrapper to retire after submission
    fn transient_allocation(&self) -> Option<AllocationHandle> {
        None
    }

    /// Write the tile instructions
    fn encode_body<F, S>(&self, encoder: &BlitEncoder<'_, F>, sink: &mut S) -> Result<()>
    where
        F: CopyEngineFamily + ?Sized,
        S: InstructionSink;

    /// Make every referenced allocation resident
    fn register_residency<R: AllocationRegistry + ?Sized>(
        &self,
        residency: &mut Residency<'_, R>,
    ) -> Result<()> {
        for handle in self.surfaces() {
            residency.add(handle)?;
        }
        for dependency in self.dependencies() {
            if let Some(handle) = dependency.allocation {
                residency.add(handle)?;
            }
        }
        match self.sync_mode() {
            SyncMode::None => {}
            SyncMode::TaskCountFence(slot) => residency.add(slot.allocation)?,
            SyncMode::Timestamp(packet) => residency.add(packet.allocation)?,
        }
        Ok(())
    }
}

/// Narrow a pitch or extent to an instruction field
fn field(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::NotSupported)
}

/// Address of a tile corner on one side of a copy
fn surface_address(
    base: GpuAddr,
    offset: Vec3,
    tile: Vec3,
    bytes_per_pixel: u32,
    row_pitch: u64,
    slice_pitch: u64,
    layout: SurfaceLayout,
) -> (GpuAddr, u32) {
    let x = (offset.x + tile.x) * bytes_per_pixel as u64;
    let y = (offset.y + tile.y) * row_pitch;
    let z = offset.z + tile.z;
    match layout {
        SurfaceLayout::Linear => (base + x + y + z * slice_pitch, 0),
        // Tiled surfaces select the slice through the array index.
        SurfaceLayout::Tiled => (base + x + y, z as u32),
    }
}

impl BlitOperation for CopyDescriptor {
    fn dependencies(&self) -> &[FenceDependency] {
        &self.dependencies
    }

    fn sync_mode(&self) -> &SyncMode {
        &self.sync_mode
    }

    fn body_kind(&self) -> InstructionKind {
        InstructionKind::Copy
    }

    fn tile_count(&self, limits: BlitLimits) -> usize {
        tile_count(self.copy_size, limits)
    }

    fn surfaces(&self) -> Vec<AllocationHandle> {
        let mut surfaces = alloc::vec![self.src_allocation, self.dst_allocation];
        surfaces.extend(self.clear_color_allocation);
        surfaces
    }

    fn transient_allocation(&self) -> Option<AllocationHandle> {
        self.transient_allocation
    }

    fn encode_body<F, S>(&self, encoder: &BlitEncoder<'_, F>, sink: &mut S) -> Result<()>
    where
        F: CopyEngineFamily + ?Sized,
        S: InstructionSink,
    {
        let clear_color = self.clear_color_allocation.map(|_| self.clear_color_address);
        let src_pitch = field(self.src_row_pitch)?;
        let dst_pitch = field(self.dst_row_pitch)?;

        for tile in tile_copy(self.copy_size, encoder.limits()) {
            let (src, src_array_index) = surface_address(
                self.src_gpu_address,
                self.src_offset,
                tile.origin,
                self.bytes_per_pixel,
                self.src_row_pitch,
                self.src_slice_pitch,
                self.src_layout,
            );
            let (dst, dst_array_index) = surface_address(
                self.dst_gpu_address,
                self.dst_offset,
                tile.origin,
                self.bytes_per_pixel,
                self.dst_row_pitch,
                self.dst_slice_pitch,
                self.dst_layout,
            );

            encoder.emit(
                &Instruction::Copy(CopyBlt {
                    src,
                    dst,
                    width: field(tile.width)?,
                    height: field(tile.height)?,
                    src_pitch,
                    dst_pitch,
                    bytes_per_pixel: self.bytes_per_pixel,
                    src_array_index,
                    dst_array_index,
                    src_tiled: self.src_layout == SurfaceLayout::Tiled,
                    dst_tiled: self.dst_layout == SurfaceLayout::Tiled,
                    plane: self.plane,
                    clear_color,
                    compression: self.compression,
                }),
                sink,
            )?;
        }
        Ok(())
    }
}

impl BlitOperation for FillDescriptor {
    fn dependencies(&self) -> &[FenceDependency] {
        &self.dependencies
    }

    fn sync_mode(&self) -> &SyncMode {
        &self.sync_mode
    }

    fn body_kind(&self) -> InstructionKind {
        InstructionKind::Fill
    }

    fn tile_count(&self, limits: BlitLimits) -> usize {
        fill_tile_count(self.size, self.pattern.len() as u64, limits)
    }

    fn surfaces(&self) -> Vec<AllocationHandle> {
        alloc::vec![self.dst_allocation]
    }

    fn encode_body<F, S>(&self, encoder: &BlitEncoder<'_, F>, sink: &mut S) -> Result<()>
    where
        F: CopyEngineFamily + ?Sized,
        S: InstructionSink,
    {
        let pattern_size = self.pattern.len();
        let mut pattern = [0u8; 16];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = self.pattern[i % pattern_size];
        }

        for tile in FillTiles::new(self.size, pattern_size as u64, encoder.limits()) {
            encoder.emit(
                &Instruction::Fill(FillBlt {
                    dst: self.dst_gpu_address + tile.offset,
                    width: field(tile.width)?,
                    height: field(tile.height)?,
                    pitch: field(tile.width * pattern_size as u64)?,
                    pattern,
                    pattern_size: pattern_size as u32,
                }),
                sink,
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// ENCODER
// =============================================================================

/// Encodes operations for one family under one dispatch configuration
pub struct BlitEncoder<'a, F: CopyEngineFamily + ?Sized> {
    estimator: SizeEstimator<'a, F>,
    limits: BlitLimits,
}

impl<'a, F: CopyEngineFamily + ?Sized> BlitEncoder<'a, F> {
    /// Create an encoder
    pub fn new(family: &'a F, config: &'a DispatchConfig) -> Self {
        Self {
            estimator: SizeEstimator::new(family, config),
            limits: config.effective_limits(family),
        }
    }

    /// Tile limits in effect
    pub fn limits(&self) -> BlitLimits {
        self.limits
    }

    /// Size estimator sharing this encoder's policy
    pub fn estimator(&self) -> &SizeEstimator<'a, F> {
        &self.estimator
    }

    /// Exact bytes `encode_op` writes for `op`
    pub fn estimate<O: BlitOperation + ?Sized>(&self, op: &O) -> usize {
        self.estimator.operation_bytes(
            op.tile_count(self.limits),
            op.body_kind(),
            op.dependencies().len(),
            op.sync_mode(),
        )
    }

    /// Encode and append one instruction
    pub fn emit<S: InstructionSink>(&self, instruction: &Instruction, sink: &mut S) -> Result<()> {
        let bytes = self.estimator.family().encode(instruction)?;
        sink.push(instruction, &bytes)
    }

    /// Encode one operation
    ///
    /// `fence_value` is the task count the enclosing flush publishes. It is
    /// written to the operation's own fence location, never to the queue
    /// completion tag.
    pub fn encode_op<O, S>(&self, op: &O, fence_value: TaskCount, sink: &mut S) -> Result<()>
    where
        O: BlitOperation + ?Sized,
        S: InstructionSink,
    {
        for dependency in op.dependencies() {
            self.emit(
                &Instruction::SemaphoreWait {
                    addr: dependency.gpu_addr,
                    value: dependency.value,
                },
                sink,
            )?;
        }

        if self.estimator.needs_arb_check() {
            self.emit(&Instruction::ArbCheck, sink)?;
        }
        if self.estimator.needs_pre_copy_flush() {
            self.emit(&Instruction::tlb_flush(), sink)?;
        }
        if let SyncMode::Timestamp(packet) = op.sync_mode() {
            self.emit(&snapshot(packet.start()), sink)?;
        }

        op.encode_body(self, sink)?;

        if self.estimator.needs_post_copy_flush() {
            self.emit(&Instruction::tlb_flush(), sink)?;
        }

        match op.sync_mode() {
            SyncMode::None => {}
            SyncMode::TaskCountFence(slot) => {
                self.emit(
                    &Instruction::fence_write(slot.gpu_addr, fence_value as u64, FlushFlags::empty()),
                    sink,
                )?;
            }
            SyncMode::Timestamp(packet) => self.encode_timestamp_end(packet, fence_value, sink)?,
        }
        Ok(())
    }

    fn encode_timestamp_end<S: InstructionSink>(
        &self,
        packet: &TimestampPacket,
        fence_value: TaskCount,
        sink: &mut S,
    ) -> Result<()> {
        // Drain the copies before sampling the clock.
        self.emit(
            &Instruction::FlushDw {
                addr: GpuAddr::null(),
                value: 0,
                flags: FlushFlags::empty(),
            },
            sink,
        )?;
        self.emit(&snapshot(packet.end()), sink)?;
        self.emit(
            &Instruction::fence_write(packet.completion(), fence_value as u64, FlushFlags::empty()),
            sink,
        )
    }

    /// Encode the batch end: optional sequencer drain, tag fence with
    /// notify, batch end, then `Noop`s until `sink` is full
    pub fn encode_batch_end(
        &self,
        tag: GpuAddr,
        task_count: TaskCount,
        global_sequencer_flush: bool,
        sink: &mut Reservation<'_>,
    ) -> Result<()> {
        if global_sequencer_flush {
            self.emit(
                &Instruction::LoadRegisterImm {
                    reg: GLOBAL_SEQUENCER_FLUSH_REGISTER,
                    value: 1,
                },
                sink,
            )?;
            self.emit(
                &Instruction::RegisterPoll {
                    reg: GLOBAL_SEQUENCER_FLUSH_REGISTER,
                    value: 0,
                },
                sink,
            )?;
        }

        self.emit(
            &Instruction::fence_write(tag, task_count as u64, FlushFlags::NOTIFY),
            sink,
        )?;
        self.emit(&Instruction::BatchBufferEnd, sink)?;

        let noop = self.estimator.family().instruction_size(InstructionKind::Noop);
        while sink.remaining() >= noop && noop > 0 {
            self.emit(&Instruction::Noop, sink)?;
        }
        Ok(())
    }
}

fn snapshot(addr: GpuAddr) -> Instruction {
    Instruction::StoreRegisterMem {
        reg: ENGINE_TIMESTAMP_REGISTER,
        addr,
    }
}
