//! # KILN Blit Dispatch
//!
//! Copy-engine command dispatch: descriptor building, tiling, encoding and
//! submission tracking.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Blit Dispatch Pipeline                       │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │  Descriptor  │    │    Tiler /   │    │     Encoder      │     │
//! │  │   Builder    │───▶│  Estimator   │───▶│ (CopyEngine-     │     │
//! │  │  (request)   │    │  (reserve)   │    │  Family)         │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                    │              │
//! │                                           ┌────────▼─────────┐    │
//! │                                           │   Submission     │    │
//! │                                           │    Tracker       │    │
//! │                                           └────────┬─────────┘    │
//! │                                                    │              │
//! │                                           ┌────────▼─────────┐    │
//! │                                           │    Transport     │    │
//! │                                           └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dispatch Flow
//!
//! 1. A `CopyRequest` is resolved into a `CopyDescriptor`
//! 2. The estimator sizes every descriptor and the tracker reserves the bytes
//! 3. The encoder fills each reservation exactly
//! 4. A flush appends the batch end and hands the batch to the transport
//! 5. Waiters poll the completion tag, then fall back to the OS wait

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod config;
pub mod descriptor;
pub mod encoder;
pub mod family;
pub mod instruction;
pub mod stream;
pub mod submission;
pub mod tiler;
pub mod transport;

// Re-exports
pub use config::{BlitLimits, DispatchConfig, KmdNotifyConfig, QueueConfig};
pub use descriptor::{
    AuxDirection, BlitDirection, BufferSurface, CopyDescriptor, CopyEndpoint, CopyRequest,
    DescriptorBuilder, FillDescriptor, HostPtr, ImageSurface, ImageType, SurfaceLayout, SyncMode,
};
pub use encoder::{BlitEncoder, BlitOperation, InstructionSink, Residency};
pub use family::{select_family, CopyEngineFamily, Gen12Family, XeHpFamily};
pub use instruction::{CompressionControl, FlushFlags, Instruction, InstructionKind, Plane};
pub use stream::{CommandStream, Reservation};
pub use submission::{
    DispatchStatus, FlushResult, QueueState, SubmissionState, SubmissionTracker,
};
pub use tiler::{tile_copy, tile_count, SizeEstimator, Tile, TilingPolicy};
pub use transport::{BatchBuffer, SubmissionTransport};

static_assertions::assert_impl_all!(
    SubmissionTracker<
        alloc::boxed::Box<dyn CopyEngineFamily>,
        dyn kiln_core::AllocationRegistry,
        dyn SubmissionTransport,
    >: Send, Sync
);
