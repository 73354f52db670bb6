//! Error taxonomy for tracker operations.
//!
//! Injected failures and unknown pointers are ordinary return values; the
//! callback boundary turns every variant into a null pointer. Invariant
//! violations (double free, live-count underflow) are not represented here:
//! they panic, because the tracker's bookkeeping can no longer be trusted.

use thiserror::Error;

use crate::policy::FaultTrigger;

/// Failure reported by `allocate`/`reallocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The active fault policy rejected this call.
    #[error("injected allocation failure ({trigger} {index})")]
    InjectedFailure { trigger: FaultTrigger, index: usize },
    /// `reallocate` received a pointer this tracker never issued (or already released).
    #[error("pointer {addr:#x} is not tracked by this allocator")]
    UnknownPointer { addr: usize },
    /// Alignment is not a power of two, or size plus alignment slack overflows.
    #[error("invalid layout: size {size} alignment {alignment}")]
    InvalidLayout { size: usize, alignment: usize },
    /// The backing system allocator could not satisfy the reservation.
    #[error("host allocator exhausted reserving {size} bytes aligned to {alignment}")]
    HostOutOfMemory { size: usize, alignment: usize },
}

impl TrackerError {
    /// True when the failure came from the fault policy rather than a real condition.
    #[must_use]
    pub const fn is_injected(&self) -> bool {
        matches!(self, Self::InjectedFailure { .. })
    }
}

/// Problems reading a fault policy from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected a non-negative integer threshold, got {value:?}")]
    InvalidThreshold { var: &'static str, value: String },
}
