//! # Copy Engine Instructions
//!
//! The logical instruction set emitted by the encoder, and the fixed binary
//! layouts the families serialize it into.
//!
//! Layouts are plain `#[repr(C)]` dword structs written with `bytemuck` in
//! host byte order. They follow the general shape of copy-engine packets
//! (header dword, then operands) without claiming any specific hardware's
//! bit assignment.

use arrayvec::ArrayVec;
use bytemuck::{Pod, Zeroable};
use kiln_core::{Error, GpuAddr, Result};

// =============================================================================
// FLUSH FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Side effects of a `FlushDw`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlushFlags: u32 {
        /// Invalidate the engine TLB
        const TLB_INVALIDATE = 1 << 18;
        /// Write the immediate value to the address after the flush
        const POST_SYNC_WRITE = 1 << 14;
        /// Raise a completion interrupt for the OS
        const NOTIFY = 1 << 8;
    }
}

// =============================================================================
// REGISTERS
// =============================================================================

/// Engine timestamp register snapshotted around profiled copies
pub const ENGINE_TIMESTAMP_REGISTER: u32 = 0x2_2358;

/// Global sequencer flush control register
pub const GLOBAL_SEQUENCER_FLUSH_REGISTER: u32 = 0xB404;

/// Largest single encoded instruction
pub const MAX_INSTRUCTION_BYTES: usize = 64;

/// Encoded bytes of one instruction
pub type InstructionBytes = ArrayVec<u8, MAX_INSTRUCTION_BYTES>;

// =============================================================================
// LOGICAL INSTRUCTIONS
// =============================================================================

/// Planar surface selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Plane {
    /// Luma
    Y = 1,
    /// Chroma U
    U = 2,
    /// Chroma V
    V = 3,
    /// Interleaved chroma
    Uv = 4,
}

/// Compression handling of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum CompressionControl {
    /// Each surface keeps its own compression state
    #[default]
    Preserve = 0,
    /// Read compressed, write uncompressed
    Resolve = 1,
    /// Read uncompressed, write compressed
    Compress = 2,
}

/// Operands of one tile copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyBlt {
    /// First source byte of the tile
    pub src: GpuAddr,
    /// First destination byte of the tile
    pub dst: GpuAddr,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Source row pitch in bytes
    pub src_pitch: u32,
    /// Destination row pitch in bytes
    pub dst_pitch: u32,
    /// Bytes per pixel
    pub bytes_per_pixel: u32,
    /// Array layer of a tiled source
    pub src_array_index: u32,
    /// Array layer of a tiled destination
    pub dst_array_index: u32,
    /// Source uses a tiled layout
    pub src_tiled: bool,
    /// Destination uses a tiled layout
    pub dst_tiled: bool,
    /// Planar surface selector
    pub plane: Option<Plane>,
    /// Clear-color address for compressed surfaces
    pub clear_color: Option<GpuAddr>,
    /// Aux translation mode
    pub compression: CompressionControl,
}

/// Operands of one fill rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillBlt {
    /// First destination byte
    pub dst: GpuAddr,
    /// Width in pattern elements
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Row pitch in bytes
    pub pitch: u32,
    /// Pattern, zero padded
    pub pattern: [u8; 16],
    /// Pattern length in bytes
    pub pattern_size: u32,
}

/// A copy-engine instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Stall until the dword at `addr` is >= `value`
    SemaphoreWait {
        /// Polled address
        addr: GpuAddr,
        /// Value to reach
        value: u32,
    },
    /// Arbitration checkpoint
    ArbCheck,
    /// Flush engine caches, optionally writing `value` to `addr`
    FlushDw {
        /// Post-sync address (ignored without `POST_SYNC_WRITE`)
        addr: GpuAddr,
        /// Post-sync value
        value: u64,
        /// Side effects
        flags: FlushFlags,
    },
    /// Tile copy
    Copy(CopyBlt),
    /// Pattern fill
    Fill(FillBlt),
    /// Write an immediate to a register
    LoadRegisterImm {
        /// Register offset
        reg: u32,
        /// Value
        value: u32,
    },
    /// Store a register to memory
    StoreRegisterMem {
        /// Register offset
        reg: u32,
        /// Destination
        addr: GpuAddr,
    },
    /// Stall until a register equals `value`
    RegisterPoll {
        /// Register offset
        reg: u32,
        /// Expected value
        value: u32,
    },
    /// End of the batch
    BatchBufferEnd,
    /// Padding
    Noop,
}

/// Size class of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    /// `SemaphoreWait`
    SemaphoreWait,
    /// `ArbCheck`
    ArbCheck,
    /// `FlushDw` without a post-sync write
    FlushDw,
    /// `FlushDw` with a post-sync write
    FlushDwPostSync,
    /// `Copy`
    Copy,
    /// `Fill`
    Fill,
    /// `LoadRegisterImm`
    LoadRegisterImm,
    /// `StoreRegisterMem`
    StoreRegisterMem,
    /// `RegisterPoll`
    RegisterPoll,
    /// `BatchBufferEnd`
    BatchBufferEnd,
    /// `Noop`
    Noop,
}

impl InstructionKind {
    /// Every kind, for table checks
    pub const ALL: [InstructionKind; 11] = [
        Self::SemaphoreWait,
        Self::ArbCheck,
        Self::FlushDw,
        Self::FlushDwPostSync,
        Self::Copy,
        Self::Fill,
        Self::LoadRegisterImm,
        Self::StoreRegisterMem,
        Self::RegisterPoll,
        Self::BatchBufferEnd,
        Self::Noop,
    ];
}

impl Instruction {
    /// Size class
    pub fn kind(&self) -> InstructionKind {
        match self {
            Self::SemaphoreWait { .. } => InstructionKind::SemaphoreWait,
            Self::ArbCheck => InstructionKind::ArbCheck,
            Self::FlushDw { flags, .. } if flags.contains(FlushFlags::POST_SYNC_WRITE) => {
                InstructionKind::FlushDwPostSync
            }
            Self::FlushDw { .. } => InstructionKind::FlushDw,
            Self::Copy(_) => InstructionKind::Copy,
            Self::Fill(_) => InstructionKind::Fill,
            Self::LoadRegisterImm { .. } => InstructionKind::LoadRegisterImm,
            Self::StoreRegisterMem { .. } => InstructionKind::StoreRegisterMem,
            Self::RegisterPoll { .. } => InstructionKind::RegisterPoll,
            Self::BatchBufferEnd => InstructionKind::BatchBufferEnd,
            Self::Noop => InstructionKind::Noop,
        }
    }

    /// TLB-invalidating flush without a post-sync write
    pub const fn tlb_flush() -> Self {
        Self::FlushDw {
            addr: GpuAddr::null(),
            value: 0,
            flags: FlushFlags::TLB_INVALIDATE,
        }
    }

    /// Flush that writes `value` to `addr`
    pub const fn fence_write(addr: GpuAddr, value: u64, flags: FlushFlags) -> Self {
        Self::FlushDw {
            addr,
            value,
            flags: flags.union(FlushFlags::POST_SYNC_WRITE),
        }
    }
}

// =============================================================================
// BINARY LAYOUTS
// =============================================================================

/// Header opcodes
pub mod opcode {
    //! Header dwords; the low byte carries the length in dwords minus two.

    /// Padding
    pub const NOOP: u32 = 0;
    /// Arbitration checkpoint
    pub const ARB_CHECK: u32 = 0x05 << 23;
    /// Batch end
    pub const BATCH_BUFFER_END: u32 = 0x0A << 23;
    /// Memory semaphore wait
    pub const SEMAPHORE_WAIT: u32 = 0x1C << 23;
    /// Register poll (semaphore wait in register mode)
    pub const REGISTER_POLL: u32 = (0x1C << 23) | (1 << 16);
    /// Load register immediate
    pub const LOAD_REGISTER_IMM: u32 = 0x22 << 23;
    /// Store register to memory
    pub const STORE_REGISTER_MEM: u32 = 0x24 << 23;
    /// Flush
    pub const FLUSH_DW: u32 = 0x26 << 23;
    /// Fast copy
    pub const XY_COPY_BLT: u32 = (2 << 29) | (0x53 << 22);
    /// Block copy
    pub const XY_BLOCK_COPY_BLT: u32 = (2 << 29) | (0x41 << 22);
    /// Pattern fill
    pub const XY_COLOR_BLT: u32 = (2 << 29) | (0x50 << 22);
}

/// Header dword for a packet of `T`
pub(crate) const fn header<T>(opcode: u32) -> u32 {
    let dwords = (core::mem::size_of::<T>() / 4) as u32;
    if dwords < 2 { opcode } else { opcode | (dwords - 2) }
}

/// Single-dword packet
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SingleDwordCmd {
    /// Header
    pub header: u32,
}

/// `SemaphoreWait` / `RegisterPoll` layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SemaphoreWaitCmd {
    /// Header
    pub header: u32,
    /// Compare value
    pub value: u32,
    /// Address low dword, or register offset
    pub addr_lo: u32,
    /// Address high dword
    pub addr_hi: u32,
}

/// `FlushDw` layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlushDwCmd {
    /// Header, with flush flags in the upper bits of the length field
    pub header: u32,
    /// Post-sync address low dword
    pub addr_lo: u32,
    /// Post-sync address high dword
    pub addr_hi: u32,
    /// Post-sync value low dword
    pub data_lo: u32,
    /// Post-sync value high dword
    pub data_hi: u32,
}

/// `LoadRegisterImm` layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LoadRegisterImmCmd {
    /// Header
    pub header: u32,
    /// Register offset
    pub reg: u32,
    /// Value
    pub value: u32,
}

/// `StoreRegisterMem` layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct StoreRegisterMemCmd {
    /// Header
    pub header: u32,
    /// Register offset
    pub reg: u32,
    /// Address low dword
    pub addr_lo: u32,
    /// Address high dword
    pub addr_hi: u32,
}

/// Fast copy layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct XyCopyBltCmd {
    /// Header
    pub header: u32,
    /// bpp code [3:0], plane [7:4], src tiled [8], dst tiled [9],
    /// src array [19:10], dst array [29:20], compression [31:30]
    pub control: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Destination address low dword
    pub dst_addr_lo: u32,
    /// Destination address high dword
    pub dst_addr_hi: u32,
    /// Destination pitch
    pub dst_pitch: u32,
    /// Source address low dword
    pub src_addr_lo: u32,
    /// Source address high dword
    pub src_addr_hi: u32,
    /// Source pitch
    pub src_pitch: u32,
}

/// Block copy layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct XyBlockCopyBltCmd {
    /// Header
    pub header: u32,
    /// bpp code [3:0], src tiled [8], dst tiled [9], clear color [10],
    /// compression [12:11]
    pub control: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Destination address low dword
    pub dst_addr_lo: u32,
    /// Destination address high dword
    pub dst_addr_hi: u32,
    /// Destination pitch
    pub dst_pitch: u32,
    /// Destination array layer
    pub dst_array_index: u32,
    /// Source address low dword
    pub src_addr_lo: u32,
    /// Source address high dword
    pub src_addr_hi: u32,
    /// Source pitch
    pub src_pitch: u32,
    /// Source array layer
    pub src_array_index: u32,
    /// Clear-color address low dword
    pub clear_color_lo: u32,
    /// Clear-color address high dword
    pub clear_color_hi: u32,
    /// Plane selector
    pub plane: u32,
    /// Reserved
    pub reserved: u32,
}

/// Pattern fill layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct XyColorBltCmd {
    /// Header
    pub header: u32,
    /// Pattern size code
    pub control: u32,
    /// Width in pattern elements
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Row pitch
    pub pitch: u32,
    /// Destination address low dword
    pub dst_addr_lo: u32,
    /// Destination address high dword
    pub dst_addr_hi: u32,
    /// Pattern
    pub pattern: [u32; 4],
}

static_assertions::const_assert_eq!(core::mem::size_of::<SingleDwordCmd>(), 4);
static_assertions::const_assert_eq!(core::mem::size_of::<SemaphoreWaitCmd>(), 16);
static_assertions::const_assert_eq!(core::mem::size_of::<FlushDwCmd>(), 20);
static_assertions::const_assert_eq!(core::mem::size_of::<LoadRegisterImmCmd>(), 12);
static_assertions::const_assert_eq!(core::mem::size_of::<StoreRegisterMemCmd>(), 16);
static_assertions::const_assert_eq!(core::mem::size_of::<XyCopyBltCmd>(), 40);
static_assertions::const_assert_eq!(core::mem::size_of::<XyBlockCopyBltCmd>(), 64);
static_assertions::const_assert_eq!(core::mem::size_of::<XyColorBltCmd>(), 44);
static_assertions::const_assert!(core::mem::size_of::<XyBlockCopyBltCmd>() <= MAX_INSTRUCTION_BYTES);

/// Log2 of a power-of-two byte count, as stored in the 4-bit size fields
pub(crate) fn size_code(bytes: u32) -> Result<u32> {
    match bytes {
        1 | 2 | 4 | 8 | 16 => Ok(bytes.trailing_zeros()),
        _ => Err(Error::InvalidParameter),
    }
}

/// Append a packet to an instruction buffer
pub(crate) fn push_packet<T: Pod>(out: &mut InstructionBytes, packet: &T) -> Result<()> {
    out.try_extend_from_slice(bytemuck::bytes_of(packet))
        .map_err(|_| Error::BufferOverflow)
}

/// Shared encodings for the packets every family lays out the same way
pub(crate) fn encode_common(instruction: &Instruction, out: &mut InstructionBytes) -> Result<bool> {
    match *instruction {
        Instruction::SemaphoreWait { addr, value } => push_packet(out, &SemaphoreWaitCmd {
            header: header::<SemaphoreWaitCmd>(opcode::SEMAPHORE_WAIT),
            value,
            addr_lo: addr.low(),
            addr_hi: addr.high(),
        })?,
        Instruction::RegisterPoll { reg, value } => push_packet(out, &SemaphoreWaitCmd {
            header: header::<SemaphoreWaitCmd>(opcode::REGISTER_POLL),
            value,
            addr_lo: reg,
            addr_hi: 0,
        })?,
        Instruction::ArbCheck => push_packet(out, &SingleDwordCmd {
            header: opcode::ARB_CHECK,
        })?,
        Instruction::BatchBufferEnd => push_packet(out, &SingleDwordCmd {
            header: opcode::BATCH_BUFFER_END,
        })?,
        Instruction::Noop => push_packet(out, &SingleDwordCmd {
            header: opcode::NOOP,
        })?,
        Instruction::LoadRegisterImm { reg, value } => push_packet(out, &LoadRegisterImmCmd {
            header: header::<LoadRegisterImmCmd>(opcode::LOAD_REGISTER_IMM),
            reg,
            value,
        })?,
        Instruction::StoreRegisterMem { reg, addr } => push_packet(out, &StoreRegisterMemCmd {
            header: header::<StoreRegisterMemCmd>(opcode::STORE_REGISTER_MEM),
            reg,
            addr_lo: addr.low(),
            addr_hi: addr.high(),
        })?,
        Instruction::Fill(fill) => {
            let mut pattern = [0u32; 4];
            for (dword, chunk) in pattern.iter_mut().zip(fill.pattern.chunks_exact(4)) {
                *dword = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            push_packet(out, &XyColorBltCmd {
                header: header::<XyColorBltCmd>(opcode::XY_COLOR_BLT),
                control: size_code(fill.pattern_size)?,
                width: fill.width,
                height: fill.height,
                pitch: fill.pitch,
                dst_addr_lo: fill.dst.low(),
                dst_addr_hi: fill.dst.high(),
                pattern,
            })?
        }
        Instruction::FlushDw { .. } | Instruction::Copy(_) => return Ok(false),
    }
    Ok(true)
}

/// A single `FlushDw` packet
pub(crate) fn flush_packet(addr: GpuAddr, value: u64, flags: FlushFlags) -> FlushDwCmd {
    FlushDwCmd {
        header: header::<FlushDwCmd>(opcode::FLUSH_DW) | flags.bits(),
        addr_lo: addr.low(),
        addr_hi: addr.high(),
        data_lo: value as u32,
        data_hi: (value >> 32) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_kind_depends_on_post_sync() {
        assert_eq!(Instruction::tlb_flush().kind(), InstructionKind::FlushDw);
        let fence = Instruction::fence_write(GpuAddr::new(0x1000), 7, FlushFlags::NOTIFY);
        assert_eq!(fence.kind(), InstructionKind::FlushDwPostSync);
        if let Instruction::FlushDw { flags, .. } = fence {
            assert!(flags.contains(FlushFlags::NOTIFY | FlushFlags::POST_SYNC_WRITE));
        }
    }

    #[test]
    fn test_header_length_field() {
        assert_eq!(header::<SemaphoreWaitCmd>(opcode::SEMAPHORE_WAIT) & 0xFF, 2);
        assert_eq!(header::<XyCopyBltCmd>(opcode::XY_COPY_BLT) & 0xFF, 8);
        assert_eq!(header::<SingleDwordCmd>(opcode::ARB_CHECK), opcode::ARB_CHECK);
    }

    #[test]
    fn test_size_code() {
        assert_eq!(size_code(1), Ok(0));
        assert_eq!(size_code(16), Ok(4));
        assert_eq!(size_code(3), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_semaphore_wait_bytes() {
        let mut out = InstructionBytes::new();
        let wait = Instruction::SemaphoreWait {
            addr: GpuAddr::new(0x1_0000_2000),
            value: 9,
        };
        assert!(encode_common(&wait, &mut out).unwrap());
        let cmd: SemaphoreWaitCmd = bytemuck::pod_read_unaligned(&out);
        assert_eq!(cmd.value, 9);
        assert_eq!(cmd.addr_lo, 0x2000);
        assert_eq!(cmd.addr_hi, 1);
    }
}
