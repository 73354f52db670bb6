//! Fault injection policy.
//!
//! A policy arms at most two independent thresholds. Each is compared
//! against the tracker's *current* counter on every growth-capable call, so a
//! rejected call (which advances nothing) would be rejected again if retried
//! unchanged. Sweeps exploit this by rerunning a whole scenario with the next
//! threshold.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which counter tripped an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultTrigger {
    /// Live allocation count reached `fail_on_allocation_index`.
    AllocationIndex,
    /// Accepted allocate/reallocate call count reached `fail_on_call_index`.
    CallIndex,
}

impl fmt::Display for FaultTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationIndex => f.write_str("allocation index"),
            Self::CallIndex => f.write_str("call index"),
        }
    }
}

/// Replaceable failure configuration for a tracker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultPolicy {
    /// Fail the allocation attempted while `allocation_count == N`.
    pub fail_on_allocation_index: Option<usize>,
    /// Fail the allocate/reallocate-growth call attempted while `call_count == N`.
    pub fail_on_call_index: Option<usize>,
}

impl FaultPolicy {
    /// Never inject a failure.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            fail_on_allocation_index: None,
            fail_on_call_index: None,
        }
    }

    /// Fail the `index`-th (0-based) accepted allocate-or-reallocate call.
    #[must_use]
    pub const fn on_call(index: usize) -> Self {
        Self {
            fail_on_allocation_index: None,
            fail_on_call_index: Some(index),
        }
    }

    /// Fail the allocation attempted while `index` allocations are live.
    #[must_use]
    pub const fn on_allocation(index: usize) -> Self {
        Self {
            fail_on_allocation_index: Some(index),
            fail_on_call_index: None,
        }
    }

    /// Build from the flag-plus-threshold form used by callback test suites.
    #[must_use]
    pub const fn from_flags(
        should_fail_on_allocation_count: bool,
        fail_after_allocations: usize,
        should_fail_after_call_count: bool,
        fail_after_calls: usize,
    ) -> Self {
        Self {
            fail_on_allocation_index: if should_fail_on_allocation_count {
                Some(fail_after_allocations)
            } else {
                None
            },
            fail_on_call_index: if should_fail_after_call_count {
                Some(fail_after_calls)
            } else {
                None
            },
        }
    }

    /// Returns true if either threshold is set.
    #[must_use]
    pub const fn is_armed(self) -> bool {
        self.fail_on_allocation_index.is_some() || self.fail_on_call_index.is_some()
    }

    /// Decide whether a call made at the given counter values must fail.
    ///
    /// The allocation threshold is checked first, so when both trip at once
    /// the reported trigger is [`FaultTrigger::AllocationIndex`].
    #[must_use]
    pub fn evaluate(self, allocation_count: usize, call_count: usize) -> Option<(FaultTrigger, usize)> {
        if self.fail_on_allocation_index == Some(allocation_count) {
            return Some((FaultTrigger::AllocationIndex, allocation_count));
        }
        if self.fail_on_call_index == Some(call_count) {
            return Some((FaultTrigger::CallIndex, call_count));
        }
        None
    }
}
