//! # Region Tiler and Size Estimator
//!
//! Split a copy volume into hardware-sized tiles and compute, ahead of
//! encoding, the exact number of bytes the encoder will write.
//!
//! ```text
//!   per-row (y <= max_h)            region (y > max_h)
//!   ┌────┬────┬──┐                  ┌────┬────┬──┐
//!   ├────┼────┼──┤  one row each    │    │    │  │  max_w × max_h
//!   ├────┼────┼──┤                  ├────┼────┼──┤
//!   └────┴────┴──┘                  └────┴────┴──┘
//! ```
//!
//! The estimator and the encoder share the same policy queries, so a
//! descriptor's estimate always matches what gets written.

use alloc::vec::Vec;

use kiln_core::Vec3;

use crate::config::{BlitLimits, DispatchConfig};
use crate::descriptor::SyncMode;
use crate::family::CopyEngineFamily;
use crate::instruction::InstructionKind;

// =============================================================================
// COPY TILING
// =============================================================================

/// One hardware-sized piece of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Offset of the tile within the copy volume
    pub origin: Vec3,
    /// Width in pixels
    pub width: u64,
    /// Height in rows
    pub height: u64,
}

impl Tile {
    /// Slice (or array layer) the tile belongs to
    pub const fn depth_index(&self) -> u64 {
        self.origin.z
    }
}

/// How a copy volume is split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilingPolicy {
    /// One tile per row, split in x only
    PerRow,
    /// Rectangles of at most `max_width × max_height`
    Region,
}

impl TilingPolicy {
    /// Region tiling whenever the copy is taller than one instruction allows
    pub const fn select(size: Vec3, limits: BlitLimits) -> Self {
        if size.y > limits.max_height {
            Self::Region
        } else {
            Self::PerRow
        }
    }
}

/// Tiles exactly covering `size`
pub fn tile_copy(size: Vec3, limits: BlitLimits) -> Vec<Tile> {
    let policy = TilingPolicy::select(size, limits);
    let row_step = match policy {
        TilingPolicy::PerRow => 1,
        TilingPolicy::Region => limits.max_height,
    };

    let mut tiles = Vec::with_capacity(tile_count(size, limits));
    for z in 0..size.z {
        let mut y = 0;
        while y < size.y {
            let height = row_step.min(size.y - y);
            let mut x = 0;
            while x < size.x {
                let width = limits.max_width.min(size.x - x);
                tiles.push(Tile {
                    origin: Vec3::new(x, y, z),
                    width,
                    height,
                });
                x += width;
            }
            y += height;
        }
    }
    tiles
}

/// Number of tiles `tile_copy` produces
pub fn tile_count(size: Vec3, limits: BlitLimits) -> usize {
    let columns = size.x.div_ceil(limits.max_width);
    let rows = match TilingPolicy::select(size, limits) {
        TilingPolicy::PerRow => size.y,
        TilingPolicy::Region => size.y.div_ceil(limits.max_height),
    };
    (columns * rows * size.z) as usize
}

// =============================================================================
// FILL TILING
// =============================================================================

/// One rectangle of a fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTile {
    /// Byte offset from the fill start
    pub offset: u64,
    /// Width in pattern-sized pixels
    pub width: u64,
    /// Height in rows
    pub height: u64,
}

/// Iterator over the rectangles of a linear fill
#[derive(Debug, Clone)]
pub struct FillTiles {
    remaining: u64,
    offset: u64,
    pattern: u64,
    limits: BlitLimits,
}

impl FillTiles {
    /// Tiles for `size` bytes of a `pattern`-byte pattern
    pub fn new(size: u64, pattern: u64, limits: BlitLimits) -> Self {
        Self {
            remaining: size,
            offset: 0,
            pattern: pattern.max(1),
            limits,
        }
    }
}

impl Iterator for FillTiles {
    type Item = FillTile;

    fn next(&mut self) -> Option<FillTile> {
        let pixels = self.remaining / self.pattern;
        if pixels == 0 {
            return None;
        }

        let width = pixels.min(self.limits.max_width);
        let height = (pixels / width).min(self.limits.max_height);
        let tile = FillTile {
            offset: self.offset,
            width,
            height,
        };

        let bytes = width * height * self.pattern;
        self.offset += bytes;
        self.remaining -= bytes;
        Some(tile)
    }
}

/// Rectangles covering a fill
pub fn tile_fill(size: u64, pattern: u64, limits: BlitLimits) -> Vec<FillTile> {
    FillTiles::new(size, pattern, limits).collect()
}

/// Number of rectangles `tile_fill` produces
pub fn fill_tile_count(size: u64, pattern: u64, limits: BlitLimits) -> usize {
    FillTiles::new(size, pattern, limits).count()
}

// =============================================================================
// SIZE ESTIMATION
// =============================================================================

/// Byte-exact estimates for one dispatch
///
/// Also answers the policy questions the encoder asks, so both sides agree
/// on which optional instructions exist.
pub struct SizeEstimator<'a, F: CopyEngineFamily + ?Sized> {
    family: &'a F,
    config: &'a DispatchConfig,
}

impl<F: CopyEngineFamily + ?Sized> Clone for SizeEstimator<'_, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: CopyEngineFamily + ?Sized> Copy for SizeEstimator<'_, F> {}

impl<'a, F: CopyEngineFamily + ?Sized> SizeEstimator<'a, F> {
    /// Create an estimator
    pub fn new(family: &'a F, config: &'a DispatchConfig) -> Self {
        Self { family, config }
    }

    /// Family in use
    pub fn family(&self) -> &'a F {
        self.family
    }

    /// Arbitration checkpoint before the copies
    pub fn needs_arb_check(&self) -> bool {
        self.family.is_pre_copy_workaround_required() && !self.config.disable_pre_copy_workaround
    }

    /// TLB flush before the copies
    pub fn needs_pre_copy_flush(&self) -> bool {
        self.config.force_tlb_flush_before_copy
    }

    /// TLB flush after the copies
    pub fn needs_post_copy_flush(&self) -> bool {
        self.family.is_post_copy_tlb_flush_required() || self.config.force_tlb_flush_after_copy
    }

    fn size(&self, kind: InstructionKind) -> usize {
        self.family.instruction_size(kind)
    }

    /// Instructions ahead of the first tile
    pub fn prologue_bytes(&self, dependencies: usize, sync: &SyncMode) -> usize {
        let mut bytes = dependencies * self.size(InstructionKind::SemaphoreWait);
        if self.needs_arb_check() {
            bytes += self.size(InstructionKind::ArbCheck);
        }
        if self.needs_pre_copy_flush() {
            bytes += self.size(InstructionKind::FlushDw);
        }
        if matches!(sync, SyncMode::Timestamp(_)) {
            bytes += self.size(InstructionKind::StoreRegisterMem);
        }
        bytes
    }

    /// Instructions after the last tile
    pub fn tail_bytes(&self, sync: &SyncMode) -> usize {
        let mut bytes = 0;
        if self.needs_post_copy_flush() {
            bytes += self.size(InstructionKind::FlushDw);
        }
        bytes += match sync {
            SyncMode::None => 0,
            SyncMode::TaskCountFence(_) => self.size(InstructionKind::FlushDwPostSync),
            SyncMode::Timestamp(_) => {
                self.size(InstructionKind::FlushDw)
                    + self.size(InstructionKind::StoreRegisterMem)
                    + self.size(InstructionKind::FlushDwPostSync)
            }
        };
        bytes
    }

    /// Full size of one operation of `tiles` instructions of `kind`
    pub fn operation_bytes(
        &self,
        tiles: usize,
        kind: InstructionKind,
        dependencies: usize,
        sync: &SyncMode,
    ) -> usize {
        self.prologue_bytes(dependencies, sync)
            + tiles * self.size(kind)
            + self.tail_bytes(sync)
    }

    /// Batch end written at `stream_offset`, padded to the stream alignment
    pub fn batch_end_bytes(&self, stream_offset: usize, global_sequencer_flush: bool) -> usize {
        let unpadded = self.unpadded_batch_end(global_sequencer_flush);
        let end = stream_offset + unpadded;
        unpadded + end.next_multiple_of(self.family.stream_alignment()) - end
    }

    /// Upper bound on `batch_end_bytes` at any offset
    pub fn max_batch_end_bytes(&self, global_sequencer_flush: bool) -> usize {
        self.unpadded_batch_end(global_sequencer_flush) + self.family.stream_alignment()
    }

    fn unpadded_batch_end(&self, global_sequencer_flush: bool) -> usize {
        let mut bytes = 0;
        if global_sequencer_flush {
            bytes += self.size(InstructionKind::LoadRegisterImm)
                + self.size(InstructionKind::RegisterPoll);
        }
        bytes
            + self.size(InstructionKind::FlushDwPostSync)
            + self.size(InstructionKind::BatchBufferEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{Gen12Family, XeHpFamily};
    use kiln_core::{AllocationHandle, FenceSlot, GpuAddr};

    fn slot() -> FenceSlot {
        FenceSlot {
            allocation: AllocationHandle::new(1),
            gpu_addr: GpuAddr::new(0x8000),
        }
    }

    const LIMITS: BlitLimits = BlitLimits {
        max_width: 16,
        max_height: 8,
    };

    fn assert_exact_cover(size: Vec3, limits: BlitLimits) {
        let tiles = tile_copy(size, limits);
        assert_eq!(tiles.len(), tile_count(size, limits));

        let mut covered = alloc::vec![0u8; size.volume() as usize];
        for tile in &tiles {
            assert!(tile.width > 0 && tile.width <= limits.max_width);
            assert!(tile.height > 0 && tile.height <= limits.max_height);
            for y in tile.origin.y..tile.origin.y + tile.height {
                for x in tile.origin.x..tile.origin.x + tile.width {
                    let index = (tile.depth_index() * size.y + y) * size.x + x;
                    covered[index as usize] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1), "gap or overlap for {:?}", size);
    }

    #[test]
    fn test_tiles_cover_volume() {
        for size in [
            Vec3::new(1, 1, 1),
            Vec3::new(16, 8, 1),
            Vec3::new(17, 9, 2),
            Vec3::new(33, 3, 4),
            Vec3::new(5, 25, 3),
            Vec3::new(48, 17, 1),
        ] {
            assert_exact_cover(size, LIMITS);
        }
    }

    #[test]
    fn test_policy_boundary() {
        assert_eq!(TilingPolicy::select(Vec3::new(4, 8, 1), LIMITS), TilingPolicy::PerRow);
        assert_eq!(TilingPolicy::select(Vec3::new(4, 9, 1), LIMITS), TilingPolicy::Region);
        assert_eq!(tile_count(Vec3::new(4, 8, 1), LIMITS), 8);
        assert_eq!(tile_count(Vec3::new(4, 9, 1), LIMITS), 2);
    }

    #[test]
    fn test_wide_row_splits_in_three() {
        let tiles = tile_copy(Vec3::new(3 * 16, 1, 1), LIMITS);
        assert_eq!(tiles.len(), 3);
        assert!(tiles.iter().all(|t| t.width == 16 && t.height == 1));
        assert_eq!(tiles[2].origin, Vec3::new(32, 0, 0));
    }

    #[test]
    fn test_region_tiling_count() {
        let size = Vec3::new(2 * 16, 16, 3);
        let tiles = tile_copy(size, LIMITS);
        assert_eq!(tiles.len(), 12);
        assert_eq!(tile_count(size, LIMITS), 12);
        assert_eq!(tiles.iter().filter(|t| t.depth_index() == 2).count(), 4);
    }

    #[test]
    fn test_fill_tiles_cover_range() {
        let limits = BlitLimits {
            max_width: 100,
            max_height: 4,
        };
        let size = 4 * 1037;
        let tiles = tile_fill(size, 4, limits);
        assert_eq!(tiles.len(), fill_tile_count(size, 4, limits));

        let mut offset = 0;
        for tile in &tiles {
            assert_eq!(tile.offset, offset);
            assert!(tile.width <= limits.max_width && tile.height <= limits.max_height);
            offset += tile.width * tile.height * 4;
        }
        assert_eq!(offset, size);
    }

    #[test]
    fn test_per_row_estimate_is_tile_sized() {
        let family = Gen12Family::new();
        let config = DispatchConfig {
            disable_pre_copy_workaround: true,
            ..Default::default()
        };
        let estimator = SizeEstimator::new(&family, &config);
        let copy = family.instruction_size(InstructionKind::Copy);
        assert_eq!(
            estimator.operation_bytes(3, InstructionKind::Copy, 0, &SyncMode::None),
            3 * copy
        );
    }

    #[test]
    fn test_estimate_folds_overheads() {
        let family = XeHpFamily::new();
        let config = DispatchConfig {
            force_tlb_flush_before_copy: true,
            ..Default::default()
        };
        let estimator = SizeEstimator::new(&family, &config);
        let size = |k| family.instruction_size(k);

        let expected = 2 * size(InstructionKind::SemaphoreWait)
            + size(InstructionKind::FlushDw)
            + 4 * size(InstructionKind::Copy)
            + size(InstructionKind::FlushDw)
            + size(InstructionKind::FlushDwPostSync);
        let sync = SyncMode::TaskCountFence(slot());
        assert_eq!(
            estimator.operation_bytes(4, InstructionKind::Copy, 2, &sync),
            expected
        );
    }

    #[test]
    fn test_batch_end_padding() {
        let family = Gen12Family::new();
        let config = DispatchConfig::default();
        let estimator = SizeEstimator::new(&family, &config);
        let align = family.stream_alignment();

        for offset in [0, 4, 40, 60, 124] {
            let bytes = estimator.batch_end_bytes(offset, true);
            assert_eq!((offset + bytes) % align, 0);
            assert!(bytes <= estimator.max_batch_end_bytes(true));
        }
    }
}
