//! The C allocation-callback bundle.
//!
//! `AllocationCallbacks` has the layout C clients expect: an opaque user-data
//! pointer followed by five nullable function pointers. The trampolines
//! installed by [`AllocationCallbacks::for_allocator`] recover the allocator
//! from the user-data pointer and forward to [`CallbackAllocator`]; every
//! `Err` becomes a null return. A panic raised by the allocator (double free,
//! count underflow) cannot unwind out of an `extern "C"` function and aborts
//! the process.

use std::ffi::c_void;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use oomprobe_core::{
    CallbackAllocator, FaultPolicy, InternalAllocationType, SystemAllocationScope,
    TrackedAllocator, TrackerConfig,
};

pub type PfnAllocation = unsafe extern "C" fn(
    p_user_data: *mut c_void,
    size: usize,
    alignment: usize,
    scope: SystemAllocationScope,
) -> *mut c_void;

pub type PfnReallocation = unsafe extern "C" fn(
    p_user_data: *mut c_void,
    p_original: *mut c_void,
    size: usize,
    alignment: usize,
    scope: SystemAllocationScope,
) -> *mut c_void;

pub type PfnFree = unsafe extern "C" fn(p_user_data: *mut c_void, p_memory: *mut c_void);

pub type PfnInternalAllocationNotification = unsafe extern "C" fn(
    p_user_data: *mut c_void,
    size: usize,
    allocation_type: InternalAllocationType,
    scope: SystemAllocationScope,
);

pub type PfnInternalFreeNotification = unsafe extern "C" fn(
    p_user_data: *mut c_void,
    size: usize,
    allocation_type: InternalAllocationType,
    scope: SystemAllocationScope,
);

/// Callback bundle handed to a client library.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AllocationCallbacks {
    pub p_user_data: *mut c_void,
    pub pfn_allocation: Option<PfnAllocation>,
    pub pfn_reallocation: Option<PfnReallocation>,
    pub pfn_free: Option<PfnFree>,
    pub pfn_internal_allocation: Option<PfnInternalAllocationNotification>,
    pub pfn_internal_free: Option<PfnInternalFreeNotification>,
}

impl AllocationCallbacks {
    /// Bundle whose user data is `allocator` and whose entries forward to it.
    ///
    /// The bundle borrows nothing; the caller must keep `allocator` alive and
    /// in place for as long as the bundle (or any copy of it) may be invoked.
    pub fn for_allocator<A: CallbackAllocator>(allocator: &A) -> Self {
        Self {
            p_user_data: ptr::from_ref(allocator).cast_mut().cast(),
            pfn_allocation: Some(allocation_trampoline::<A> as PfnAllocation),
            pfn_reallocation: Some(reallocation_trampoline::<A> as PfnReallocation),
            pfn_free: Some(free_trampoline::<A> as PfnFree),
            pfn_internal_allocation: Some(
                internal_allocation_trampoline::<A> as PfnInternalAllocationNotification,
            ),
            pfn_internal_free: Some(internal_free_trampoline::<A> as PfnInternalFreeNotification),
        }
    }

    /// Invoke `pfn_allocation`; a missing entry behaves as a failed call.
    ///
    /// # Safety
    ///
    /// `p_user_data` must satisfy whatever the installed entry requires.
    pub unsafe fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> *mut c_void {
        match self.pfn_allocation {
            // SAFETY: forwarded caller contract.
            Some(f) => unsafe { f(self.p_user_data, size, alignment, scope) },
            None => ptr::null_mut(),
        }
    }

    /// Invoke `pfn_reallocation`.
    ///
    /// # Safety
    ///
    /// As for [`Self::allocate`]; `original` must be null or a pointer this
    /// bundle returned.
    pub unsafe fn reallocate(
        &self,
        original: *mut c_void,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> *mut c_void {
        match self.pfn_reallocation {
            // SAFETY: forwarded caller contract.
            Some(f) => unsafe { f(self.p_user_data, original, size, alignment, scope) },
            None => ptr::null_mut(),
        }
    }

    /// Invoke `pfn_free`.
    ///
    /// # Safety
    ///
    /// As for [`Self::allocate`].
    pub unsafe fn free(&self, memory: *mut c_void) {
        if let Some(f) = self.pfn_free {
            // SAFETY: forwarded caller contract.
            unsafe { f(self.p_user_data, memory) }
        }
    }

    /// # Safety
    ///
    /// As for [`Self::allocate`].
    pub unsafe fn notify_internal_allocation(
        &self,
        size: usize,
        allocation_type: InternalAllocationType,
        scope: SystemAllocationScope,
    ) {
        if let Some(f) = self.pfn_internal_allocation {
            // SAFETY: forwarded caller contract.
            unsafe { f(self.p_user_data, size, allocation_type, scope) }
        }
    }

    /// # Safety
    ///
    /// As for [`Self::allocate`].
    pub unsafe fn notify_internal_free(
        &self,
        size: usize,
        allocation_type: InternalAllocationType,
        scope: SystemAllocationScope,
    ) {
        if let Some(f) = self.pfn_internal_free {
            // SAFETY: forwarded caller contract.
            unsafe { f(self.p_user_data, size, allocation_type, scope) }
        }
    }
}

/// Recover the allocator behind `p_user_data`; `None` for null.
///
/// # Safety
///
/// A non-null `p_user_data` must point to a live `A`.
#[inline]
unsafe fn allocator_from<'a, A>(p_user_data: *mut c_void) -> Option<&'a A> {
    // SAFETY: caller guarantees a non-null pointer targets a live A.
    unsafe { p_user_data.cast::<A>().cast_const().as_ref() }
}

unsafe extern "C" fn allocation_trampoline<A: CallbackAllocator>(
    p_user_data: *mut c_void,
    size: usize,
    alignment: usize,
    scope: SystemAllocationScope,
) -> *mut c_void {
    // SAFETY: user data was installed by `for_allocator::<A>`.
    let Some(allocator) = (unsafe { allocator_from::<A>(p_user_data) }) else {
        return ptr::null_mut();
    };
    match allocator.allocate(size, alignment, scope) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn reallocation_trampoline<A: CallbackAllocator>(
    p_user_data: *mut c_void,
    p_original: *mut c_void,
    size: usize,
    alignment: usize,
    scope: SystemAllocationScope,
) -> *mut c_void {
    // SAFETY: user data was installed by `for_allocator::<A>`.
    let Some(allocator) = (unsafe { allocator_from::<A>(p_user_data) }) else {
        return ptr::null_mut();
    };
    let original = NonNull::new(p_original.cast::<u8>());
    match allocator.reallocate(original, size, alignment, scope) {
        Ok(Some(ptr)) => ptr.as_ptr().cast(),
        Ok(None) | Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn free_trampoline<A: CallbackAllocator>(
    p_user_data: *mut c_void,
    p_memory: *mut c_void,
) {
    // SAFETY: user data was installed by `for_allocator::<A>`.
    if let Some(allocator) = unsafe { allocator_from::<A>(p_user_data) } {
        allocator.free(NonNull::new(p_memory.cast::<u8>()));
    }
}

unsafe extern "C" fn internal_allocation_trampoline<A: CallbackAllocator>(
    p_user_data: *mut c_void,
    size: usize,
    allocation_type: InternalAllocationType,
    scope: SystemAllocationScope,
) {
    // SAFETY: user data was installed by `for_allocator::<A>`.
    if let Some(allocator) = unsafe { allocator_from::<A>(p_user_data) } {
        allocator.notify_internal_allocation(size, allocation_type, scope);
    }
}

unsafe extern "C" fn internal_free_trampoline<A: CallbackAllocator>(
    p_user_data: *mut c_void,
    size: usize,
    allocation_type: InternalAllocationType,
    scope: SystemAllocationScope,
) {
    // SAFETY: user data was installed by `for_allocator::<A>`.
    if let Some(allocator) = unsafe { allocator_from::<A>(p_user_data) } {
        allocator.notify_internal_free(size, allocation_type, scope);
    }
}

/// A tracker together with a callback bundle that points at it.
///
/// The tracker is boxed so the bundle's user-data pointer stays valid when
/// the `CallbackTracker` itself moves.
#[derive(Debug)]
pub struct CallbackTracker {
    tracker: Box<TrackedAllocator>,
    callbacks: AllocationCallbacks,
}

// SAFETY: the bundle's only pointer targets the boxed tracker, which is Sync
// and lives exactly as long as `self`.
unsafe impl Send for CallbackTracker {}
// SAFETY: see above; the bundle itself is never mutated after construction.
unsafe impl Sync for CallbackTracker {}

impl CallbackTracker {
    #[must_use]
    pub fn new(policy: FaultPolicy) -> Self {
        Self::from_tracker(TrackedAllocator::with_policy(policy))
    }

    #[must_use]
    pub fn with_config(config: TrackerConfig) -> Self {
        Self::from_tracker(TrackedAllocator::with_config(config))
    }

    /// Four-field constructor mirroring the classic test-suite settings.
    #[must_use]
    pub fn from_flags(
        should_fail_on_allocation_count: bool,
        fail_after_allocations: usize,
        should_fail_after_call_count: bool,
        fail_after_calls: usize,
    ) -> Self {
        Self::new(FaultPolicy::from_flags(
            should_fail_on_allocation_count,
            fail_after_allocations,
            should_fail_after_call_count,
            fail_after_calls,
        ))
    }

    #[must_use]
    pub fn from_tracker(tracker: TrackedAllocator) -> Self {
        let tracker = Box::new(tracker);
        let callbacks = AllocationCallbacks::for_allocator(&*tracker);
        Self { tracker, callbacks }
    }

    /// Pointer suitable for passing to a C client.
    #[must_use]
    pub fn callbacks(&self) -> *const AllocationCallbacks {
        &self.callbacks
    }

    #[must_use]
    pub fn bundle(&self) -> &AllocationCallbacks {
        &self.callbacks
    }

    #[must_use]
    pub fn get(&self) -> &TrackedAllocator {
        &self.tracker
    }
}

impl Default for CallbackTracker {
    fn default() -> Self {
        Self::new(FaultPolicy::never())
    }
}

impl Deref for CallbackTracker {
    type Target = TrackedAllocator;

    fn deref(&self) -> &TrackedAllocator {
        &self.tracker
    }
}
