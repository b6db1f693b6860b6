//! # KILN Memory Management
//!
//! The allocation registry used by the KILN dispatch pipeline: GPU virtual
//! address assignment, per-context residency, completion stamps and deferred
//! frees.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      KILN Memory System                         │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                   Allocation Tracker                      │  │
//! │  │   (handles → info, residency, task counts, stored lists)  │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌───────────────────────────┴───────────────────────────────┐  │
//! │  │                     Address Space                         │  │
//! │  │              (first-fit GPU VA assignment)                │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifetime Rules
//!
//! - An allocation is destroyed only after every context that used it has
//!   completed the task count recorded for it
//! - Host pointer allocations stay alive while a transfer is pending
//! - Stored allocations are released or recycled by `clean_allocation_list`
//!   and `obtain_reusable`

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod address_space;
pub mod tracker;

// Re-exports
pub use address_space::{AddressSpace, VaRange, DRIVER_RANGE};
pub use tracker::{AllocationTracker, TrackerStats};

static_assertions::assert_impl_all!(AllocationTracker: Send, Sync);
