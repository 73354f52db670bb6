// Exported entry points take raw handles from C callers and check them for
// null; per-function safety docs would repeat the same sentence.
#![allow(clippy::missing_safety_doc)]
//! # oomprobe-abi
//!
//! `extern "C"` allocation-callback bundle backed by the oomprobe tracker.
//!
//! ```text
//! C client -> AllocationCallbacks entry -> trampoline -> TrackedAllocator
//! ```
//!
//! Rust drivers use [`CallbackTracker`] directly; C drivers go through the
//! `oomprobe_tracker_*` exports.

pub mod callbacks;
pub mod ffi;

pub use callbacks::{
    AllocationCallbacks, CallbackTracker, PfnAllocation, PfnFree,
    PfnInternalAllocationNotification, PfnInternalFreeNotification, PfnReallocation,
};
pub use oomprobe_core::{InternalAllocationType, SystemAllocationScope};
