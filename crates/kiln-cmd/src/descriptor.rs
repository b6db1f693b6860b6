//! # Copy Descriptors
//!
//! Turn a caller's raw copy request into a fully resolved [`CopyDescriptor`]:
//! addresses, pitches, offsets, extents and the dependency set.
//!
//! ```text
//! CopyRequest ──► direction check ──► endpoint check ──► extents
//!                                                          │
//!     CopyDescriptor ◄── host ptr wrap ◄── pitches ◄── image rewrites
//! ```
//!
//! Every validation runs before the transient host allocation is created,
//! so a rejected request leaves the registry untouched.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use kiln_core::{
    AllocDesc, AllocationHandle, AllocationInfo, AllocationRegistry, AllocationUsage,
    BuilderError, ByteSize, ContextId, Error, FenceDependency, FenceSlot, GpuAddr, Result,
    TimestampPacket, Vec3,
};

use crate::instruction::{CompressionControl, Plane};

// =============================================================================
// DIRECTION
// =============================================================================

/// What a copy moves between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlitDirection {
    /// Host memory to buffer
    HostToBuffer = 0,
    /// Buffer to host memory
    BufferToHost = 1,
    /// Buffer to buffer
    BufferToBuffer = 2,
    /// Image to image
    ImageToImage = 3,
    /// Host memory to image
    HostToImage = 4,
    /// Image to host memory
    ImageToHost = 5,
    /// In-place resolve of a compressed buffer
    AuxTranslation = 6,
}

impl TryFrom<u32> for BlitDirection {
    type Error = BuilderError;

    fn try_from(raw: u32) -> core::result::Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::HostToBuffer,
            1 => Self::BufferToHost,
            2 => Self::BufferToBuffer,
            3 => Self::ImageToImage,
            4 => Self::HostToImage,
            5 => Self::ImageToHost,
            6 => Self::AuxTranslation,
            _ => return Err(BuilderError::InvalidDirection),
        })
    }
}

/// Which way an aux translation moves a buffer's compression state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuxDirection {
    /// Resolve compressed contents in place
    #[default]
    AuxToNonAux,
    /// Compress plain contents in place
    NonAuxToAux,
}

impl AuxDirection {
    /// Copy-engine compression mode for this translation
    pub fn compression(self) -> CompressionControl {
        match self {
            Self::AuxToNonAux => CompressionControl::Resolve,
            Self::NonAuxToAux => CompressionControl::Compress,
        }
    }
}

/// Completion signal emitted after a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Nothing
    #[default]
    None,
    /// Write the batch task count to the operation's own fence slot
    TaskCountFence(FenceSlot),
    /// Snapshot start and end timestamps into a packet, then signal it
    Timestamp(TimestampPacket),
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// Image dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// 1D
    D1,
    /// 1D array (layers addressed through y)
    D1Array,
    /// 1D image viewing a buffer
    D1Buffer,
    /// 2D
    D2,
    /// 2D array
    D2Array,
    /// 3D
    D3,
}

/// Physical surface layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceLayout {
    /// Row-major
    #[default]
    Linear,
    /// Hardware tiled
    Tiled,
}

/// Caller host memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr {
    /// Host virtual address of the first byte
    pub address: u64,
}

/// A buffer memory object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSurface {
    /// Backing allocation
    pub allocation: AllocationHandle,
    /// Offset of the sub-buffer within the allocation
    pub offset: u64,
}

/// An image memory object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSurface {
    /// Backing allocation
    pub allocation: AllocationHandle,
    /// Surface offset within the allocation
    pub offset: u64,
    /// Dimensionality
    pub image_type: ImageType,
    /// Physical layout
    pub layout: SurfaceLayout,
    /// Bytes per pixel
    pub bytes_per_pixel: u32,
    /// Row pitch, zero for natural
    pub row_pitch: u64,
    /// Slice pitch, zero for natural
    pub slice_pitch: u64,
    /// Planar surface selector
    pub plane: Option<Plane>,
}

/// One side of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEndpoint {
    /// Host memory
    Host(HostPtr),
    /// Buffer
    Buffer(BufferSurface),
    /// Image
    Image(ImageSurface),
}

impl CopyEndpoint {
    fn image(&self) -> Option<&ImageSurface> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    fn allocation(&self) -> Option<AllocationHandle> {
        match self {
            Self::Host(_) => None,
            Self::Buffer(b) => Some(b.allocation),
            Self::Image(i) => Some(i.allocation),
        }
    }
}

/// Raw parameters of a copy as they arrive from the API layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    /// Direction tag
    pub direction: u32,
    /// Source
    pub src: CopyEndpoint,
    /// Destination
    pub dst: CopyEndpoint,
    /// Source origin
    pub src_origin: Vec3,
    /// Destination origin
    pub dst_origin: Vec3,
    /// Extent; zero y or z means one
    pub region: Vec3,
    /// Source row pitch, zero for natural
    pub src_row_pitch: u64,
    /// Source slice pitch, zero for natural
    pub src_slice_pitch: u64,
    /// Destination row pitch, zero for natural
    pub dst_row_pitch: u64,
    /// Destination slice pitch, zero for natural
    pub dst_slice_pitch: u64,
    /// Producer fences to wait for
    pub dependencies: Vec<FenceDependency>,
    /// Completion signal
    pub sync_mode: SyncMode,
    /// Clear-color allocation for compressed surfaces
    pub clear_color: Option<AllocationHandle>,
    /// Translation applied by an aux translation request
    pub aux_direction: AuxDirection,
}

impl CopyRequest {
    /// Request with zero origins and natural pitches
    pub fn new(direction: BlitDirection, src: CopyEndpoint, dst: CopyEndpoint, region: Vec3) -> Self {
        Self {
            direction: direction as u32,
            src,
            dst,
            src_origin: Vec3::ZERO,
            dst_origin: Vec3::ZERO,
            region,
            src_row_pitch: 0,
            src_slice_pitch: 0,
            dst_row_pitch: 0,
            dst_slice_pitch: 0,
            dependencies: Vec::new(),
            sync_mode: SyncMode::None,
            clear_color: None,
            aux_direction: AuxDirection::default(),
        }
    }

    /// Set origins
    pub fn with_origins(mut self, src: Vec3, dst: Vec3) -> Self {
        self.src_origin = src;
        self.dst_origin = dst;
        self
    }

    /// Add a producer fence
    pub fn with_dependency(mut self, dependency: FenceDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Set the completion signal
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Set the aux translation direction
    pub fn with_aux_direction(mut self, aux_direction: AuxDirection) -> Self {
        self.aux_direction = aux_direction;
        self
    }
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// One fully resolved copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyDescriptor {
    /// Direction after image rewrites
    pub direction: BlitDirection,
    /// Source allocation
    pub src_allocation: AllocationHandle,
    /// Destination allocation
    pub dst_allocation: AllocationHandle,
    /// Source base, including sub-object offset
    pub src_gpu_address: GpuAddr,
    /// Destination base, including sub-object offset
    pub dst_gpu_address: GpuAddr,
    /// Source origin
    pub src_offset: Vec3,
    /// Destination origin
    pub dst_offset: Vec3,
    /// Extent
    pub copy_size: Vec3,
    /// Source row pitch in bytes
    pub src_row_pitch: u64,
    /// Source slice pitch in bytes
    pub src_slice_pitch: u64,
    /// Destination row pitch in bytes
    pub dst_row_pitch: u64,
    /// Destination slice pitch in bytes
    pub dst_slice_pitch: u64,
    /// Bytes per pixel
    pub bytes_per_pixel: u32,
    /// Producer fences to wait for
    pub dependencies: Vec<FenceDependency>,
    /// Completion signal
    pub sync_mode: SyncMode,
    /// Clear-color allocation for compressed surfaces
    pub clear_color_allocation: Option<AllocationHandle>,
    /// Clear-color address, null without an allocation
    pub clear_color_address: GpuAddr,
    /// Planar surface selector
    pub plane: Option<Plane>,
    /// Source layout
    pub src_layout: SurfaceLayout,
    /// Destination layout
    pub dst_layout: SurfaceLayout,
    /// Compression handling, set by aux translations
    pub compression: CompressionControl,
    /// Host pointer wrapper created for this copy
    pub transient_allocation: Option<AllocationHandle>,
}

impl CopyDescriptor {
    /// Linear buffer-to-buffer copy of `size` bytes
    pub fn linear(
        src_allocation: AllocationHandle,
        src_gpu_address: GpuAddr,
        dst_allocation: AllocationHandle,
        dst_gpu_address: GpuAddr,
        size: u64,
    ) -> Self {
        Self::with_extent(
            BlitDirection::BufferToBuffer,
            (src_allocation, src_gpu_address),
            (dst_allocation, dst_gpu_address),
            Vec3::new(size, 1, 1),
            1,
        )
    }

    /// Copy with natural pitches and zero origins
    pub fn with_extent(
        direction: BlitDirection,
        src: (AllocationHandle, GpuAddr),
        dst: (AllocationHandle, GpuAddr),
        copy_size: Vec3,
        bytes_per_pixel: u32,
    ) -> Self {
        let row_pitch = copy_size.x * bytes_per_pixel as u64;
        let slice_pitch = row_pitch * copy_size.y;
        Self {
            direction,
            src_allocation: src.0,
            dst_allocation: dst.0,
            src_gpu_address: src.1,
            dst_gpu_address: dst.1,
            src_offset: Vec3::ZERO,
            dst_offset: Vec3::ZERO,
            copy_size,
            src_row_pitch: row_pitch,
            src_slice_pitch: slice_pitch,
            dst_row_pitch: row_pitch,
            dst_slice_pitch: slice_pitch,
            bytes_per_pixel,
            dependencies: Vec::new(),
            sync_mode: SyncMode::None,
            clear_color_allocation: None,
            clear_color_address: GpuAddr::null(),
            plane: None,
            src_layout: SurfaceLayout::Linear,
            dst_layout: SurfaceLayout::Linear,
            compression: CompressionControl::Preserve,
            transient_allocation: None,
        }
    }
}

/// Largest supported fill pattern
pub const MAX_FILL_PATTERN: usize = 16;

/// Fill a buffer range with a repeating pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillDescriptor {
    /// Destination allocation
    pub dst_allocation: AllocationHandle,
    /// First byte to fill
    pub dst_gpu_address: GpuAddr,
    /// Bytes to fill, a multiple of the pattern length
    pub size: u64,
    /// Pattern of 1, 2, 4, 8 or 16 bytes
    pub pattern: ArrayVec<u8, MAX_FILL_PATTERN>,
    /// Producer fences to wait for
    pub dependencies: Vec<FenceDependency>,
    /// Completion signal
    pub sync_mode: SyncMode,
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builds descriptors against an allocation registry
pub struct DescriptorBuilder<'r, R: AllocationRegistry + ?Sized> {
    registry: &'r R,
    default_clear_color: Option<AllocationHandle>,
}

/// Resolved addressing of one endpoint
struct Side {
    allocation: AllocationHandle,
    gpu_address: GpuAddr,
    row_pitch: u64,
    slice_pitch: u64,
    layout: SurfaceLayout,
}

impl<'r, R: AllocationRegistry + ?Sized> DescriptorBuilder<'r, R> {
    /// Create a builder
    pub fn new(registry: &'r R) -> Self {
        Self {
            registry,
            default_clear_color: None,
        }
    }

    /// Clear-color allocation used when a request has none
    pub fn with_clear_color(mut self, allocation: AllocationHandle) -> Self {
        self.default_clear_color = Some(allocation);
        self
    }

    /// Resolve a copy request
    pub fn build(&self, request: &CopyRequest) -> Result<CopyDescriptor> {
        let mut direction = BlitDirection::try_from(request.direction)?;
        check_endpoints(direction, &request.src, &request.dst)?;

        if request.region.x == 0 {
            return Err(BuilderError::EmptyRegion.into());
        }
        let mut region = Vec3::new(
            request.region.x,
            request.region.y.max(1),
            request.region.z.max(1),
        );
        let mut src_origin = request.src_origin;
        let mut dst_origin = request.dst_origin;

        let src_info = self.resolve(&request.src)?;
        let dst_info = self.resolve(&request.dst)?;

        let src_image = request.src.image();
        let dst_image = request.dst.image();
        let mut bytes_per_pixel = src_image
            .or(dst_image)
            .map_or(1, |image| image.bytes_per_pixel.max(1));

        // Images viewing a buffer are copied as opaque bytes.
        let is_buffer_view = |image: Option<&ImageSurface>| {
            image.is_some_and(|i| i.image_type == ImageType::D1Buffer)
        };
        let rewritten = match direction {
            BlitDirection::HostToImage if is_buffer_view(dst_image) => {
                Some(BlitDirection::HostToBuffer)
            }
            BlitDirection::ImageToHost if is_buffer_view(src_image) => {
                Some(BlitDirection::BufferToHost)
            }
            BlitDirection::ImageToImage
                if is_buffer_view(src_image) && is_buffer_view(dst_image) =>
            {
                Some(BlitDirection::BufferToBuffer)
            }
            _ => None,
        };
        if let Some(buffer_direction) = rewritten {
            direction = buffer_direction;
            let bpp = bytes_per_pixel as u64;
            region.x *= bpp;
            src_origin.x *= bpp;
            dst_origin.x *= bpp;
            bytes_per_pixel = 1;
        }

        // Tiled 1D arrays are laid out as 2D arrays with one row per layer.
        let tiled_array = |image: Option<&ImageSurface>| {
            image.is_some_and(|i| {
                i.image_type == ImageType::D1Array && i.layout == SurfaceLayout::Tiled
            })
        };
        let src_swap = rewritten.is_none() && tiled_array(src_image);
        let dst_swap = rewritten.is_none() && tiled_array(dst_image);
        if src_swap {
            src_origin = src_origin.swap_yz();
        }
        if dst_swap {
            dst_origin = dst_origin.swap_yz();
        }
        if src_swap || dst_swap {
            region = region.swap_yz();
        }

        let compressed = [src_info, dst_info]
            .iter()
            .flatten()
            .any(AllocationInfo::is_compressed);
        let compression = if direction == BlitDirection::AuxTranslation {
            if !compressed {
                return Err(Error::NotSupported);
            }
            request.aux_direction.compression()
        } else {
            CompressionControl::Preserve
        };

        // Translations change the compression state; the clear color only
        // matters to copies that keep it.
        let clear_color = match compression {
            CompressionControl::Preserve => request.clear_color.or(self.default_clear_color),
            _ => None,
        };
        if compressed && compression == CompressionControl::Preserve && clear_color.is_none() {
            return Err(BuilderError::MissingClearColor.into());
        }
        let clear_color_address = match clear_color {
            Some(handle) => self.registry.resolve(handle)?.gpu_addr,
            None => GpuAddr::null(),
        };

        let src_pitches = natural_pitches(
            &request.src,
            request.src_row_pitch,
            request.src_slice_pitch,
            region,
            bytes_per_pixel,
        );
        let dst_pitches = natural_pitches(
            &request.dst,
            request.dst_row_pitch,
            request.dst_slice_pitch,
            region,
            bytes_per_pixel,
        );

        let src = self.side(&request.src, src_info, src_pitches, src_origin, region, bytes_per_pixel)?;
        let dst = match self.side(&request.dst, dst_info, dst_pitches, dst_origin, region, bytes_per_pixel) {
            Ok(side) => side,
            Err(e) => {
                if matches!(request.src, CopyEndpoint::Host(_)) {
                    self.discard_transient(src.allocation);
                }
                return Err(e);
            }
        };

        let transient_allocation = match (&request.src, &request.dst) {
            (CopyEndpoint::Host(_), _) => Some(src.allocation),
            (_, CopyEndpoint::Host(_)) => Some(dst.allocation),
            _ => None,
        };
        if let Some(handle) = transient_allocation {
            let pending = self.registry.add_pending_transfer(handle)?;
            log::trace!("host pointer {:?} has {} pending transfers", handle, pending);
        }

        let plane = dst_image.and_then(|i| i.plane).or(src_image.and_then(|i| i.plane));

        log::debug!(
            "built {:?} copy {:?} bpp={} {} -> {}",
            direction,
            region,
            bytes_per_pixel,
            src.gpu_address,
            dst.gpu_address
        );

        Ok(CopyDescriptor {
            direction,
            src_allocation: src.allocation,
            dst_allocation: dst.allocation,
            src_gpu_address: src.gpu_address,
            dst_gpu_address: dst.gpu_address,
            src_offset: src_origin,
            dst_offset: dst_origin,
            copy_size: region,
            src_row_pitch: src.row_pitch,
            src_slice_pitch: src.slice_pitch,
            dst_row_pitch: dst.row_pitch,
            dst_slice_pitch: dst.slice_pitch,
            bytes_per_pixel,
            dependencies: request.dependencies.clone(),
            sync_mode: request.sync_mode,
            clear_color_allocation: clear_color,
            clear_color_address,
            plane,
            src_layout: src.layout,
            dst_layout: dst.layout,
            compression,
            transient_allocation,
        })
    }

    /// Resolve a fill request
    pub fn build_fill(
        &self,
        dst: BufferSurface,
        size: u64,
        pattern: &[u8],
        dependencies: Vec<FenceDependency>,
        sync_mode: SyncMode,
    ) -> Result<FillDescriptor> {
        let len = pattern.len() as u64;
        if !matches!(len, 1 | 2 | 4 | 8 | 16) || size == 0 || size % len != 0 {
            return Err(BuilderError::InvalidPattern.into());
        }
        let info = self.registry.resolve(dst.allocation)?;
        if dst.offset + size > info.size.as_bytes() {
            return Err(Error::BufferOverflow);
        }

        let mut stored = ArrayVec::new();
        stored
            .try_extend_from_slice(pattern)
            .map_err(|_| Error::from(BuilderError::InvalidPattern))?;

        Ok(FillDescriptor {
            dst_allocation: dst.allocation,
            dst_gpu_address: info.gpu_addr + dst.offset,
            size,
            pattern: stored,
            dependencies,
            sync_mode,
        })
    }

    fn resolve(&self, endpoint: &CopyEndpoint) -> Result<Option<AllocationInfo>> {
        endpoint
            .allocation()
            .map(|handle| self.registry.resolve(handle))
            .transpose()
    }

    fn side(
        &self,
        endpoint: &CopyEndpoint,
        info: Option<AllocationInfo>,
        (row_pitch, slice_pitch): (u64, u64),
        origin: Vec3,
        region: Vec3,
        bytes_per_pixel: u32,
    ) -> Result<Side> {
        match (endpoint, info) {
            (CopyEndpoint::Host(host), _) => {
                let size = host_extent(origin, region, bytes_per_pixel, row_pitch, slice_pitch);
                let handle = self
                    .registry
                    .allocate(&AllocDesc::host_ptr(host.address, ByteSize::from_bytes(size)))?;
                let gpu_address = self.registry.resolve(handle)?.gpu_addr;
                Ok(Side {
                    allocation: handle,
                    gpu_address,
                    row_pitch,
                    slice_pitch,
                    layout: SurfaceLayout::Linear,
                })
            }
            (CopyEndpoint::Buffer(buffer), Some(info)) => Ok(Side {
                allocation: buffer.allocation,
                gpu_address: info.gpu_addr + buffer.offset,
                row_pitch,
                slice_pitch,
                layout: SurfaceLayout::Linear,
            }),
            (CopyEndpoint::Image(image), Some(info)) => Ok(Side {
                allocation: image.allocation,
                gpu_address: info.gpu_addr + image.offset,
                row_pitch,
                slice_pitch,
                layout: image.layout,
            }),
            _ => Err(Error::NotFound),
        }
    }

    fn discard_transient(&self, handle: AllocationHandle) {
        // Never submitted, so it completes at task count zero.
        let usage = AllocationUsage::Temporary;
        if let Err(e) = self.registry.store_allocation(handle, ContextId::default(), usage, 0) {
            log::warn!("dropping host pointer wrapper {:?}: {}", handle, e);
        }
    }
}

fn check_endpoints(direction: BlitDirection, src: &CopyEndpoint, dst: &CopyEndpoint) -> Result<()> {
    use CopyEndpoint::*;

    let ok = match direction {
        BlitDirection::HostToBuffer => matches!((src, dst), (Host(_), Buffer(_))),
        BlitDirection::BufferToHost => matches!((src, dst), (Buffer(_), Host(_))),
        BlitDirection::BufferToBuffer => matches!((src, dst), (Buffer(_), Buffer(_))),
        BlitDirection::ImageToImage => matches!((src, dst), (Image(_), Image(_))),
        BlitDirection::HostToImage => matches!((src, dst), (Host(_), Image(_))),
        BlitDirection::ImageToHost => matches!((src, dst), (Image(_), Host(_))),
        BlitDirection::AuxTranslation => {
            matches!((src, dst), (Buffer(s), Buffer(d)) if s.allocation == d.allocation)
        }
    };

    if ok {
        Ok(())
    } else {
        Err(BuilderError::EndpointMismatch.into())
    }
}

/// Row and slice pitch of an endpoint after defaults
fn natural_pitches(
    endpoint: &CopyEndpoint,
    row_pitch: u64,
    slice_pitch: u64,
    region: Vec3,
    bytes_per_pixel: u32,
) -> (u64, u64) {
    let (image_row, image_slice) = match endpoint {
        CopyEndpoint::Image(image) => (image.row_pitch, image.slice_pitch),
        _ => (0, 0),
    };

    let row = match (row_pitch, image_row) {
        (0, 0) => region.x * bytes_per_pixel as u64,
        (0, image) => image,
        (requested, _) => requested,
    };
    let slice = match (slice_pitch, image_slice) {
        (0, 0) => row * region.y,
        (0, image) => image,
        (requested, _) => requested,
    };
    (row, slice)
}

/// Bytes of host memory touched by a copy
fn host_extent(origin: Vec3, region: Vec3, bytes_per_pixel: u32, row_pitch: u64, slice_pitch: u64) -> u64 {
    let bpp = bytes_per_pixel as u64;
    let first = origin.x * bpp + origin.y * row_pitch + origin.z * slice_pitch;
    let span = (region.z - 1) * slice_pitch + (region.y - 1) * row_pitch + region.x * bpp;
    first + span
}
