//! # Copy Engine Families
//!
//! Per-generation capability objects: instruction caps, sizes, workarounds
//! and binary encoding. One family is selected when the device is
//! initialized and injected into the submission tracker.

use alloc::boxed::Box;

use kiln_core::{Error, GpuGeneration, Result};

use crate::instruction::*;

// =============================================================================
// FAMILY TRAIT
// =============================================================================

/// Hardware generation capabilities of a copy engine
///
/// `instruction_size(kind)` must equal the length `encode` produces for every
/// instruction of that kind; size estimation depends on it.
pub trait CopyEngineFamily: Send + Sync {
    /// Family name
    fn name(&self) -> &'static str;

    /// Widest single copy, in pixels
    fn max_instruction_width(&self) -> u64;

    /// Tallest single copy, in rows
    fn max_instruction_height(&self) -> u64;

    /// Encoded size of an instruction kind
    fn instruction_size(&self, kind: InstructionKind) -> usize;

    /// An arbitration checkpoint must precede copies
    fn is_pre_copy_workaround_required(&self) -> bool;

    /// A TLB flush must follow copies
    fn is_post_copy_tlb_flush_required(&self) -> bool;

    /// Required alignment of each batch end
    fn stream_alignment(&self) -> usize {
        64
    }

    /// Serialize one instruction
    fn encode(&self, instruction: &Instruction) -> Result<InstructionBytes>;
}

impl<F: CopyEngineFamily + ?Sized> CopyEngineFamily for Box<F> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn max_instruction_width(&self) -> u64 {
        (**self).max_instruction_width()
    }

    fn max_instruction_height(&self) -> u64 {
        (**self).max_instruction_height()
    }

    fn instruction_size(&self, kind: InstructionKind) -> usize {
        (**self).instruction_size(kind)
    }

    fn is_pre_copy_workaround_required(&self) -> bool {
        (**self).is_pre_copy_workaround_required()
    }

    fn is_post_copy_tlb_flush_required(&self) -> bool {
        (**self).is_post_copy_tlb_flush_required()
    }

    fn stream_alignment(&self) -> usize {
        (**self).stream_alignment()
    }

    fn encode(&self, instruction: &Instruction) -> Result<InstructionBytes> {
        (**self).encode(instruction)
    }
}

/// Pick the family for a hardware generation
pub fn select_family(generation: GpuGeneration) -> Result<Box<dyn CopyEngineFamily>> {
    match generation {
        GpuGeneration::Gen12Lp => Ok(Box::new(Gen12Family::new())),
        GpuGeneration::XeHp | GpuGeneration::XeHpc => Ok(Box::new(XeHpFamily::new())),
        GpuGeneration::Unknown => Err(Error::NotSupported),
    }
}

/// Largest blit extent on every supported generation
const MAX_BLIT_EXTENT: u64 = 0x4000;

const fn fixed_size(kind: InstructionKind) -> usize {
    use core::mem::size_of;

    match kind {
        InstructionKind::SemaphoreWait | InstructionKind::RegisterPoll => {
            size_of::<SemaphoreWaitCmd>()
        }
        InstructionKind::ArbCheck | InstructionKind::BatchBufferEnd | InstructionKind::Noop => {
            size_of::<SingleDwordCmd>()
        }
        InstructionKind::FlushDw | InstructionKind::FlushDwPostSync => size_of::<FlushDwCmd>(),
        InstructionKind::LoadRegisterImm => size_of::<LoadRegisterImmCmd>(),
        InstructionKind::StoreRegisterMem => size_of::<StoreRegisterMemCmd>(),
        InstructionKind::Fill => size_of::<XyColorBltCmd>(),
        InstructionKind::Copy => size_of::<XyCopyBltCmd>(),
    }
}

fn copy_control(copy: &CopyBlt) -> Result<u32> {
    Ok(size_code(copy.bytes_per_pixel)?
        | (copy.src_tiled as u32) << 8
        | (copy.dst_tiled as u32) << 9)
}

// =============================================================================
// GEN12
// =============================================================================

/// Gen12 copy engine: fast copy, arbitration checkpoint before copies
#[derive(Debug, Clone, Copy)]
pub struct Gen12Family {
    _private: (),
}

impl Gen12Family {
    /// Array index field width of the fast copy
    const ARRAY_INDEX_MASK: u32 = 0x3FF;

    /// Create the family
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl CopyEngineFamily for Gen12Family {
    fn name(&self) -> &'static str {
        "gen12"
    }

    fn max_instruction_width(&self) -> u64 {
        MAX_BLIT_EXTENT
    }

    fn max_instruction_height(&self) -> u64 {
        MAX_BLIT_EXTENT
    }

    fn instruction_size(&self, kind: InstructionKind) -> usize {
        fixed_size(kind)
    }

    fn is_pre_copy_workaround_required(&self) -> bool {
        true
    }

    fn is_post_copy_tlb_flush_required(&self) -> bool {
        false
    }

    fn encode(&self, instruction: &Instruction) -> Result<InstructionBytes> {
        let mut out = InstructionBytes::new();
        if encode_common(instruction, &mut out)? {
            return Ok(out);
        }

        match *instruction {
            Instruction::FlushDw { addr, value, flags } => {
                push_packet(&mut out, &flush_packet(addr, value, flags))?;
            }
            Instruction::Copy(copy) => {
                if copy.src_array_index > Self::ARRAY_INDEX_MASK
                    || copy.dst_array_index > Self::ARRAY_INDEX_MASK
                {
                    return Err(Error::NotSupported);
                }
                let plane = copy.plane.map_or(0, |p| p as u32);
                let control = copy_control(&copy)?
                    | plane << 4
                    | copy.src_array_index << 10
                    | copy.dst_array_index << 20
                    | (copy.compression as u32) << 30;

                push_packet(&mut out, &XyCopyBltCmd {
                    header: header::<XyCopyBltCmd>(opcode::XY_COPY_BLT),
                    control,
                    width: copy.width,
                    height: copy.height,
                    dst_addr_lo: copy.dst.low(),
                    dst_addr_hi: copy.dst.high(),
                    dst_pitch: copy.dst_pitch,
                    src_addr_lo: copy.src.low(),
                    src_addr_hi: copy.src.high(),
                    src_pitch: copy.src_pitch,
                })?;
            }
            _ => return Err(Error::NotSupported),
        }
        Ok(out)
    }
}

// =============================================================================
// XE-HP
// =============================================================================

/// Xe-HP copy engine: block copy, TLB flush after copies, and a dummy
/// flush ahead of every post-sync write
#[derive(Debug, Clone, Copy)]
pub struct XeHpFamily {
    _private: (),
}

impl XeHpFamily {
    /// Create the family
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl CopyEngineFamily for XeHpFamily {
    fn name(&self) -> &'static str {
        "xe_hp"
    }

    fn max_instruction_width(&self) -> u64 {
        MAX_BLIT_EXTENT
    }

    fn max_instruction_height(&self) -> u64 {
        MAX_BLIT_EXTENT
    }

    fn instruction_size(&self, kind: InstructionKind) -> usize {
        match kind {
            InstructionKind::FlushDwPostSync => 2 * core::mem::size_of::<FlushDwCmd>(),
            InstructionKind::Copy => core::mem::size_of::<XyBlockCopyBltCmd>(),
            other => fixed_size(other),
        }
    }

    fn is_pre_copy_workaround_required(&self) -> bool {
        false
    }

    fn is_post_copy_tlb_flush_required(&self) -> bool {
        true
    }

    fn encode(&self, instruction: &Instruction) -> Result<InstructionBytes> {
        let mut out = InstructionBytes::new();
        if encode_common(instruction, &mut out)? {
            return Ok(out);
        }

        match *instruction {
            Instruction::FlushDw { addr, value, flags } => {
                if flags.contains(FlushFlags::POST_SYNC_WRITE) {
                    push_packet(&mut out, &flush_packet(
                        kiln_core::GpuAddr::null(),
                        0,
                        FlushFlags::empty(),
                    ))?;
                }
                push_packet(&mut out, &flush_packet(addr, value, flags))?;
            }
            Instruction::Copy(copy) => {
                let clear_color = copy.clear_color.unwrap_or_default();
                let control = copy_control(&copy)?
                    | (copy.clear_color.is_some() as u32) << 10
                    | (copy.compression as u32) << 11;

                push_packet(&mut out, &XyBlockCopyBltCmd {
                    header: header::<XyBlockCopyBltCmd>(opcode::XY_BLOCK_COPY_BLT),
                    control,
                    width: copy.width,
                    height: copy.height,
                    dst_addr_lo: copy.dst.low(),
                    dst_addr_hi: copy.dst.high(),
                    dst_pitch: copy.dst_pitch,
                    dst_array_index: copy.dst_array_index,
                    src_addr_lo: copy.src.low(),
                    src_addr_hi: copy.src.high(),
                    src_pitch: copy.src_pitch,
                    src_array_index: copy.src_array_index,
                    clear_color_lo: clear_color.low(),
                    clear_color_hi: clear_color.high(),
                    plane: copy.plane.map_or(0, |p| p as u32),
                    reserved: 0,
                })?;
            }
            _ => return Err(Error::NotSupported),
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::GpuAddr;

    fn sample(kind: InstructionKind) -> Instruction {
        let addr = GpuAddr::new(0x2_0000_1000);
        match kind {
            InstructionKind::SemaphoreWait => Instruction::SemaphoreWait { addr, value: 3 },
            InstructionKind::ArbCheck => Instruction::ArbCheck,
            InstructionKind::FlushDw => Instruction::tlb_flush(),
            InstructionKind::FlushDwPostSync => {
                Instruction::fence_write(addr, 4, FlushFlags::empty())
            }
            InstructionKind::Copy => Instruction::Copy(CopyBlt {
                src: addr,
                dst: addr + 0x1000,
                width: 64,
                height: 2,
                src_pitch: 256,
                dst_pitch: 256,
                bytes_per_pixel: 4,
                src_array_index: 1,
                dst_array_index: 0,
                src_tiled: true,
                dst_tiled: false,
                plane: Some(Plane::Uv),
                clear_color: None,
                compression: CompressionControl::Preserve,
            }),
            InstructionKind::Fill => Instruction::Fill(FillBlt {
                dst: addr,
                width: 16,
                height: 1,
                pitch: 64,
                pattern: [0xAB; 16],
                pattern_size: 4,
            }),
            InstructionKind::LoadRegisterImm => Instruction::LoadRegisterImm {
                reg: GLOBAL_SEQUENCER_FLUSH_REGISTER,
                value: 1,
            },
            InstructionKind::StoreRegisterMem => Instruction::StoreRegisterMem {
                reg: ENGINE_TIMESTAMP_REGISTER,
                addr,
            },
            InstructionKind::RegisterPoll => Instruction::RegisterPoll {
                reg: GLOBAL_SEQUENCER_FLUSH_REGISTER,
                value: 0,
            },
            InstructionKind::BatchBufferEnd => Instruction::BatchBufferEnd,
            InstructionKind::Noop => Instruction::Noop,
        }
    }

    fn check_sizes(family: &dyn CopyEngineFamily) {
        for kind in InstructionKind::ALL {
            let instruction = sample(kind);
            assert_eq!(instruction.kind(), kind);
            let bytes = family.encode(&instruction).unwrap();
            assert_eq!(
                bytes.len(),
                family.instruction_size(kind),
                "{} {:?}",
                family.name(),
                kind
            );
            assert_eq!(bytes.len() % 4, 0);
        }
    }

    #[test]
    fn test_gen12_sizes_match_encoding() {
        check_sizes(&Gen12Family::new());
    }

    #[test]
    fn test_xe_hp_sizes_match_encoding() {
        check_sizes(&XeHpFamily::new());
    }

    #[test]
    fn test_workaround_policies() {
        let gen12 = Gen12Family::new();
        let xe = XeHpFamily::new();
        assert!(gen12.is_pre_copy_workaround_required());
        assert!(!gen12.is_post_copy_tlb_flush_required());
        assert!(!xe.is_pre_copy_workaround_required());
        assert!(xe.is_post_copy_tlb_flush_required());
    }

    #[test]
    fn test_select_family() {
        assert_eq!(select_family(GpuGeneration::Gen12Lp).unwrap().name(), "gen12");
        let boxed = select_family(GpuGeneration::XeHpc).unwrap();
        assert_eq!(boxed.name(), "xe_hp");
        assert_eq!(boxed.instruction_size(InstructionKind::Copy), 64);
        assert!(matches!(
            select_family(GpuGeneration::Unknown),
            Err(Error::NotSupported)
        ));
    }

    fn control_dword(family: &dyn CopyEngineFamily, compression: CompressionControl) -> u32 {
        let mut instruction = sample(InstructionKind::Copy);
        if let Instruction::Copy(ref mut copy) = instruction {
            copy.compression = compression;
        }
        let bytes = family.encode(&instruction).unwrap();
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
    }

    #[test]
    fn test_compression_control_encoded() {
        let gen12 = Gen12Family::new();
        assert_eq!(control_dword(&gen12, CompressionControl::Preserve) >> 30, 0);
        assert_eq!(control_dword(&gen12, CompressionControl::Resolve) >> 30, 1);
        assert_eq!(control_dword(&gen12, CompressionControl::Compress) >> 30, 2);

        let xe = XeHpFamily::new();
        assert_eq!((control_dword(&xe, CompressionControl::Preserve) >> 11) & 0b11, 0);
        assert_eq!((control_dword(&xe, CompressionControl::Resolve) >> 11) & 0b11, 1);
        assert_eq!((control_dword(&xe, CompressionControl::Compress) >> 11) & 0b11, 2);
    }

    #[test]
    fn test_gen12_rejects_large_array_index() {
        let mut instruction = sample(InstructionKind::Copy);
        if let Instruction::Copy(ref mut copy) = instruction {
            copy.dst_array_index = 0x400;
        }
        assert_eq!(
            Gen12Family::new().encode(&instruction),
            Err(Error::NotSupported)
        );
    }
}
