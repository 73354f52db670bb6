//! Tracker construction settings.
//!
//! A fault policy can be supplied programmatically or read from the
//! environment so a whole test binary can be rerun with a different
//! threshold without recompiling:
//! - `OOMPROBE_FAIL_AFTER_ALLOCATIONS`: live-allocation threshold.
//! - `OOMPROBE_FAIL_AFTER_CALLS`: allocate/reallocate call threshold.
//!
//! Unset, empty, `off`, `none` and `disabled` all leave a threshold unarmed.

use crate::error::ConfigError;
use crate::log::LIFECYCLE_LOG_CAPACITY;
use crate::policy::FaultPolicy;

pub const ENV_FAIL_AFTER_ALLOCATIONS: &str = "OOMPROBE_FAIL_AFTER_ALLOCATIONS";
pub const ENV_FAIL_AFTER_CALLS: &str = "OOMPROBE_FAIL_AFTER_CALLS";

/// Number of record slots reserved up front.
pub const DEFAULT_INITIAL_CAPACITY: usize = 512;

/// Settings for a [`crate::TrackedAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub policy: FaultPolicy,
    /// Lifecycle ring size; 0 disables lifecycle logging.
    pub log_capacity: usize,
    pub initial_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            policy: FaultPolicy::never(),
            log_capacity: LIFECYCLE_LOG_CAPACITY,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }
}

impl TrackerConfig {
    #[must_use]
    pub fn with_policy(policy: FaultPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }
}

fn parse_threshold(var: &'static str, raw: &str) -> Result<Option<usize>, ConfigError> {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "" | "off" | "none" | "disabled" => Ok(None),
        digits => digits
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidThreshold {
                var,
                value: raw.to_string(),
            }),
    }
}

impl FaultPolicy {
    /// Read the policy from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the policy through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fail_on_allocation_index = match lookup(ENV_FAIL_AFTER_ALLOCATIONS) {
            Some(raw) => parse_threshold(ENV_FAIL_AFTER_ALLOCATIONS, &raw)?,
            None => None,
        };
        let fail_on_call_index = match lookup(ENV_FAIL_AFTER_CALLS) {
            Some(raw) => parse_threshold(ENV_FAIL_AFTER_CALLS, &raw)?,
            None => None,
        };
        Ok(Self {
            fail_on_allocation_index,
            fail_on_call_index,
        })
    }
}
