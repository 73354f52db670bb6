//! Exported entry points for C test drivers.
//!
//! A C harness creates a tracker, passes `oomprobe_tracker_callbacks(t)` to
//! the library under test, and asks `oomprobe_tracker_is_empty(t)` before
//! `oomprobe_tracker_destroy(t)`.

use std::ptr;

use oomprobe_core::FaultPolicy;

use crate::callbacks::{AllocationCallbacks, CallbackTracker};

/// Create a tracker from the four-field settings form. Never returns null.
#[unsafe(no_mangle)]
pub extern "C" fn oomprobe_tracker_create(
    should_fail_on_allocation_count: bool,
    fail_after_allocations: usize,
    should_fail_after_call_count: bool,
    fail_after_calls: usize,
) -> *mut CallbackTracker {
    Box::into_raw(Box::new(CallbackTracker::from_flags(
        should_fail_on_allocation_count,
        fail_after_allocations,
        should_fail_after_call_count,
        fail_after_calls,
    )))
}

/// Destroy a tracker, releasing any blocks still outstanding. Null is ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn oomprobe_tracker_destroy(tracker: *mut CallbackTracker) {
    if tracker.is_null() {
        return;
    }
    // SAFETY: non-null handles come from oomprobe_tracker_create.
    drop(unsafe { Box::from_raw(tracker) });
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn oomprobe_tracker_callbacks(
    tracker: *const CallbackTracker,
) -> *const AllocationCallbacks {
    // SAFETY: non-null handles come from oomprobe_tracker_create.
    match unsafe { tracker.as_ref() } {
        Some(tracker) => tracker.callbacks(),
        None => ptr::null(),
    }
}

/// True when no allocation is outstanding. A null handle reports empty.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn oomprobe_tracker_is_empty(tracker: *const CallbackTracker) -> bool {
    // SAFETY: non-null handles come from oomprobe_tracker_create.
    unsafe { tracker.as_ref() }.is_none_or(|t| t.is_empty())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn oomprobe_tracker_allocation_count(tracker: *const CallbackTracker) -> usize {
    // SAFETY: non-null handles come from oomprobe_tracker_create.
    unsafe { tracker.as_ref() }.map_or(0, |t| t.current_allocation_count())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn oomprobe_tracker_call_count(tracker: *const CallbackTracker) -> usize {
    // SAFETY: non-null handles come from oomprobe_tracker_create.
    unsafe { tracker.as_ref() }.map_or(0, |t| t.current_call_count())
}

/// Replace the fault policy of a live tracker.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn oomprobe_tracker_set_policy(
    tracker: *const CallbackTracker,
    should_fail_on_allocation_count: bool,
    fail_after_allocations: usize,
    should_fail_after_call_count: bool,
    fail_after_calls: usize,
) {
    // SAFETY: non-null handles come from oomprobe_tracker_create.
    if let Some(tracker) = unsafe { tracker.as_ref() } {
        tracker.update_policy(FaultPolicy::from_flags(
            should_fail_on_allocation_count,
            fail_after_allocations,
            should_fail_after_call_count,
            fail_after_calls,
        ));
    }
}
