//! # KILN Core
//!
//! Foundational types and interfaces for the KILN copy-engine dispatch stack.
//!
//! ## Design Principles
//!
//! 1. **Handles, not pointers**: allocations are referenced by opaque handle
//! 2. **Typed errors**: every failure is an `Error` value, hangs included
//! 3. **Hardware agnostic**: nothing here knows an instruction layout
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      kiln-core                              │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │     Error           │  │
//! │  │ (Allocation │  │ (GpuAddr,   │  │   Handling          │  │
//! │  │  Registry)  │  │  Handle)    │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌─────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Memory    │  │  Sync (CompletionTag, WaitStatus)   │   │
//! │  └─────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod memory;
pub mod sync;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{BuilderError, Error, Result, SubmitError};
pub use memory::*;
pub use sync::*;
pub use traits::*;
pub use types::*;

static_assertions::assert_eq_size!(GpuAddr, u64);
static_assertions::assert_eq_size!(AllocationHandle, u64);
static_assertions::assert_impl_all!(CompletionTag: Send, Sync);
