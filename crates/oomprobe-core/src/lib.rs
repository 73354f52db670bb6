//! # oomprobe-core
//!
//! A tracked, fault-injecting allocator for exercising out-of-memory handling
//! in code that accepts caller-supplied allocation callbacks.
//!
//! [`TrackedAllocator`] keeps one record per live pointer, honours arbitrary
//! power-of-two alignment, and rejects exactly the call selected by its
//! [`FaultPolicy`]. A scenario that finishes with [`TrackedAllocator::is_empty`]
//! returning `true` released everything it acquired, including on the
//! failure path.
//!
//! Unsafe code is confined to the modules that own raw reservations.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod log;
pub mod policy;
#[allow(unsafe_code)]
pub mod raw;
pub mod scope;
#[allow(unsafe_code)]
pub mod tracker;

pub use config::{ENV_FAIL_AFTER_ALLOCATIONS, ENV_FAIL_AFTER_CALLS, TrackerConfig};
pub use error::{ConfigError, TrackerError};
pub use log::{AllocatorLogLevel, AllocatorLogRecord, LIFECYCLE_LOG_CAPACITY};
pub use policy::{FaultPolicy, FaultTrigger};
pub use scope::{InternalAllocationType, SystemAllocationScope};
pub use tracker::{
    AllocationSnapshot, CallbackAllocator, QUARANTINE_MAX_BYTES, QUARANTINE_MAX_ENTRIES,
    TrackedAllocator, TrackerStats,
};
