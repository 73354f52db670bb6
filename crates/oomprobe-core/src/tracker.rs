//! The tracked, fault-injecting allocator.
//!
//! `TrackedAllocator` services the allocation-callback contract out of its
//! own reservations, keeps one record per live pointer, and rejects exactly
//! the call its [`FaultPolicy`] points at. All state lives behind a single
//! `parking_lot::Mutex`; every public operation holds it for its whole body,
//! so concurrent callers observe the counters in one total order.
//!
//! Released blocks sit in a bounded FIFO quarantine before going back to the
//! host. While a block is quarantined its address cannot belong to anyone
//! else, so a second free of it is a genuine double free. Once evicted, the
//! address is forgotten and a free of it is treated like any foreign pointer.
//!
//! Realloc semantics:
//! - null original: plain allocate.
//! - untracked original: [`TrackerError::UnknownPointer`].
//! - size 0: free-equivalent, returns `Ok(None)`, never fault-injected.
//! - size <= requested: original returned unchanged, never fault-injected.
//! - size > requested: fault-checked; on success the bytes move to a fresh
//!   block, on failure the original is left exactly as it was.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::log::{AllocatorLogLevel, AllocatorLogRecord, LifecycleLog};
use crate::policy::FaultPolicy;
use crate::raw::RawBlock;
use crate::scope::{InternalAllocationType, SystemAllocationScope};

/// Maximum number of released blocks held back from the host.
pub const QUARANTINE_MAX_ENTRIES: usize = 1024;

/// Maximum bytes held back from the host across quarantined blocks.
pub const QUARANTINE_MAX_BYTES: usize = 16 * 1024 * 1024;

/// The callback contract a client library invokes instead of ambient allocation.
///
/// `free` tolerates null and foreign pointers. The two notifications are
/// informational and have no effect on bookkeeping.
pub trait CallbackAllocator: Sync {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<NonNull<u8>, TrackerError>;

    /// `Ok(None)` means the original was released by a size-zero request.
    fn reallocate(
        &self,
        original: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<Option<NonNull<u8>>, TrackerError>;

    fn free(&self, memory: Option<NonNull<u8>>);

    fn notify_internal_allocation(
        &self,
        _size: usize,
        _allocation_type: InternalAllocationType,
        _scope: SystemAllocationScope,
    ) {
    }

    fn notify_internal_free(
        &self,
        _size: usize,
        _allocation_type: InternalAllocationType,
        _scope: SystemAllocationScope,
    ) {
    }
}

/// Bookkeeping for one live allocation.
#[derive(Debug)]
struct AllocationRecord {
    requested_size: usize,
    alignment: usize,
    scope: SystemAllocationScope,
    aligned: NonNull<u8>,
    block: RawBlock,
}

// SAFETY: `aligned` points into `block`, which the record owns exclusively.
unsafe impl Send for AllocationRecord {}

impl AllocationRecord {
    fn snapshot(&self) -> AllocationSnapshot {
        AllocationSnapshot {
            aligned: self.aligned.as_ptr() as usize,
            raw: self.block.addr(),
            requested_size: self.requested_size,
            actual_size: self.block.actual_size(),
            alignment: self.alignment,
            scope: self.scope,
        }
    }
}

/// A released block kept reserved so its address cannot be reissued while
/// it is still remembered in `recently_freed`.
#[derive(Debug)]
struct QuarantineEntry {
    addr: usize,
    block: RawBlock,
}

/// Read-only view of a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationSnapshot {
    /// Address handed to the caller.
    pub aligned: usize,
    /// Start of the backing reservation.
    pub raw: usize,
    pub requested_size: usize,
    pub actual_size: usize,
    pub alignment: usize,
    pub scope: SystemAllocationScope,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub allocation_count: usize,
    pub call_count: usize,
    /// Sum of requested sizes over live allocations.
    pub live_bytes: usize,
    pub injected_failures: usize,
    pub peak_allocation_count: usize,
}

/// State guarded by the tracker lock.
#[derive(Debug)]
struct TrackerState {
    policy: FaultPolicy,
    /// Aligned address -> record.
    records: HashMap<usize, AllocationRecord>,
    /// Addresses of quarantined blocks, to tell double free from foreign free.
    recently_freed: HashSet<usize>,
    /// Released blocks, oldest first.
    quarantine: VecDeque<QuarantineEntry>,
    quarantine_bytes: usize,
    allocation_count: usize,
    call_count: usize,
    live_bytes: usize,
    injected_failures: usize,
    peak_allocation_count: usize,
    log: LifecycleLog,
}

impl TrackerState {
    fn new(config: TrackerConfig) -> Self {
        Self {
            policy: config.policy,
            records: HashMap::with_capacity(config.initial_capacity),
            recently_freed: HashSet::new(),
            quarantine: VecDeque::new(),
            quarantine_bytes: 0,
            allocation_count: 0,
            call_count: 0,
            live_bytes: 0,
            injected_failures: 0,
            peak_allocation_count: 0,
            log: LifecycleLog::new(config.log_capacity),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_lifecycle(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if !self.log.is_enabled() {
            return;
        }
        let decision_id = self.log.next_decision_id();
        let trace_id = format!("core::tracker::{symbol}::{decision_id:016x}");
        let record = AllocatorLogRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            ptr,
            size,
            outcome,
            details: details.into(),
            allocation_count: self.allocation_count,
            call_count: self.call_count,
        };
        self.log.push(record);
    }

    fn stats(&self) -> TrackerStats {
        TrackerStats {
            allocation_count: self.allocation_count,
            call_count: self.call_count,
            live_bytes: self.live_bytes,
            injected_failures: self.injected_failures,
            peak_allocation_count: self.peak_allocation_count,
        }
    }

    /// Consult the policy; on a hit, count and log the injected failure.
    fn check_fault(
        &mut self,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: usize,
    ) -> Result<(), TrackerError> {
        let Some((trigger, index)) = self.policy.evaluate(self.allocation_count, self.call_count)
        else {
            return Ok(());
        };
        self.injected_failures += 1;
        self.record_lifecycle(
            AllocatorLogLevel::Info,
            symbol,
            event,
            ptr,
            Some(size),
            "injected",
            format!("trigger={trigger} index={index}"),
        );
        Err(TrackerError::InjectedFailure { trigger, index })
    }

    fn reserve(
        &mut self,
        symbol: &'static str,
        size: usize,
        alignment: usize,
    ) -> Result<RawBlock, TrackerError> {
        RawBlock::reserve(size, alignment).inspect_err(|err| {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                symbol,
                "reserve_failed",
                None,
                Some(size),
                "error",
                format!("alignment={alignment} error={err}"),
            );
        })
    }

    /// Register a fresh record. Does not touch `call_count`.
    fn install(&mut self, record: AllocationRecord) -> NonNull<u8> {
        let aligned = record.aligned;
        let addr = aligned.as_ptr() as usize;
        debug_assert!(!self.recently_freed.contains(&addr));
        self.live_bytes += record.requested_size;
        self.allocation_count += 1;
        self.peak_allocation_count = self.peak_allocation_count.max(self.allocation_count);
        let previous = self.records.insert(addr, record);
        assert!(
            previous.is_none(),
            "invariant violation: aligned pointer {addr:#x} issued while still live"
        );
        aligned
    }

    /// Remove a record and move its block into quarantine. Returns the
    /// requested size of the released allocation.
    fn release(&mut self, symbol: &'static str, addr: usize) -> Option<usize> {
        let record = self.records.remove(&addr)?;
        self.live_bytes = self.live_bytes.saturating_sub(record.requested_size);
        match self.allocation_count.checked_sub(1) {
            Some(next) => self.allocation_count = next,
            None => {
                self.record_lifecycle(
                    AllocatorLogLevel::Error,
                    symbol,
                    "invariant_allocation_count_underflow",
                    Some(addr),
                    Some(record.requested_size),
                    "abort",
                    "checked_sub_failed",
                );
                panic!(
                    "invariant violation: releasing {addr:#x} with no live allocations counted"
                );
            }
        }
        let size = record.requested_size;
        self.quarantine_bytes += record.block.actual_size();
        self.recently_freed.insert(addr);
        self.quarantine.push_back(QuarantineEntry {
            addr,
            block: record.block,
        });
        self.drain_quarantine();
        Some(size)
    }

    /// Hand the oldest quarantined blocks back to the host until both caps hold.
    /// An evicted address is forgotten: a later free of it counts as foreign.
    fn drain_quarantine(&mut self) {
        while self.quarantine.len() > QUARANTINE_MAX_ENTRIES
            || self.quarantine_bytes > QUARANTINE_MAX_BYTES
        {
            let Some(entry) = self.quarantine.pop_front() else {
                break;
            };
            self.recently_freed.remove(&entry.addr);
            self.quarantine_bytes -= entry.block.actual_size();
            drop(entry.block);
        }
    }

    fn allocate(
        &mut self,
        symbol: &'static str,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<NonNull<u8>, TrackerError> {
        self.check_fault(symbol, "alloc_injected_failure", None, size)?;
        let block = self.reserve(symbol, size, alignment)?;
        let aligned = block.aligned_ptr(alignment);
        let out = self.install(AllocationRecord {
            requested_size: size,
            alignment,
            scope,
            aligned,
            block,
        });
        self.call_count += 1;
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            symbol,
            "alloc",
            Some(out.as_ptr() as usize),
            Some(size),
            "success",
            format!("alignment={alignment} scope={}", scope.as_raw()),
        );
        Ok(out)
    }

    fn reallocate(
        &mut self,
        original: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<Option<NonNull<u8>>, TrackerError> {
        let Some(original) = original else {
            let out = self.allocate("reallocate", size, alignment, scope)?;
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "reallocate",
                "realloc_null_as_alloc",
                Some(out.as_ptr() as usize),
                Some(size),
                "success",
                "original_was_null",
            );
            return Ok(Some(out));
        };

        let addr = original.as_ptr() as usize;
        let Some(old_size) = self.records.get(&addr).map(|r| r.requested_size) else {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "reallocate",
                "realloc_unknown_pointer",
                Some(addr),
                Some(size),
                "rejected",
                "original_not_tracked",
            );
            return Err(TrackerError::UnknownPointer { addr });
        };

        if size == 0 {
            self.release("reallocate", addr);
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "reallocate",
                "realloc_zero_as_free",
                Some(addr),
                Some(0),
                "freed",
                format!("old_size={old_size}"),
            );
            return Ok(None);
        }

        if size <= old_size {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "reallocate",
                "realloc_shrink_in_place",
                Some(addr),
                Some(size),
                "success",
                format!("old_size={old_size}"),
            );
            return Ok(Some(original));
        }

        self.check_fault("reallocate", "realloc_injected_failure", Some(addr), size)?;
        let block = self.reserve("reallocate", size, alignment)?;
        let aligned = block.aligned_ptr(alignment);
        // SAFETY: the source window [addr, addr + old_size) lies inside the old
        // record's block, the destination holds at least `size > old_size`
        // bytes, and two live reservations never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(original.as_ptr(), aligned.as_ptr(), old_size);
        }
        self.release("reallocate", addr);
        let out = self.install(AllocationRecord {
            requested_size: size,
            alignment,
            scope,
            aligned,
            block,
        });
        self.call_count += 1;
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "reallocate",
            "realloc_move",
            Some(out.as_ptr() as usize),
            Some(size),
            "success",
            format!("old_ptr={addr:#x} old_size={old_size}"),
        );
        Ok(Some(out))
    }

    fn free(&mut self, memory: Option<NonNull<u8>>) {
        let Some(memory) = memory else {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "free",
                "free_null",
                None,
                None,
                "noop",
                "null_pointer",
            );
            return;
        };
        let addr = memory.as_ptr() as usize;
        match self.release("free", addr) {
            Some(size) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Trace,
                    "free",
                    "free",
                    Some(addr),
                    Some(size),
                    "success",
                    "",
                );
            }
            None if self.recently_freed.contains(&addr) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Error,
                    "free",
                    "double_free_detected",
                    Some(addr),
                    None,
                    "abort",
                    "pointer_observed_in_recently_freed_set",
                );
                panic!("invariant violation: double free of {addr:#x}");
            }
            None => {
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "free",
                    "unknown_free_pointer",
                    Some(addr),
                    None,
                    "ignored",
                    "pointer_not_tracked",
                );
            }
        }
    }
}

/// Tracked, fault-injecting allocator.
#[derive(Debug)]
pub struct TrackedAllocator {
    state: Mutex<TrackerState>,
}

impl TrackedAllocator {
    /// A tracker that never injects failures.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    #[must_use]
    pub fn with_policy(policy: FaultPolicy) -> Self {
        Self::with_config(TrackerConfig::with_policy(policy))
    }

    #[must_use]
    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            state: Mutex::new(TrackerState::new(config)),
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    ///
    /// A zero `size` still yields a distinct, freeable pointer.
    pub fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<NonNull<u8>, TrackerError> {
        self.state.lock().allocate("allocate", size, alignment, scope)
    }

    /// Resize a tracked allocation; see the module docs for the exact cases.
    pub fn reallocate(
        &self,
        original: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<Option<NonNull<u8>>, TrackerError> {
        self.state
            .lock()
            .reallocate(original, size, alignment, scope)
    }

    /// Release a tracked allocation. Null and foreign pointers are ignored.
    ///
    /// # Panics
    ///
    /// Panics when `memory` was released by this tracker and its block is
    /// still quarantined (double free).
    pub fn free(&self, memory: Option<NonNull<u8>>) {
        self.state.lock().free(memory);
    }

    pub fn notify_internal_allocation(
        &self,
        size: usize,
        allocation_type: InternalAllocationType,
        scope: SystemAllocationScope,
    ) {
        let mut state = self.state.lock();
        state.record_lifecycle(
            AllocatorLogLevel::Trace,
            "internal_allocation",
            "internal_allocation_notice",
            None,
            Some(size),
            "noop",
            format!(
                "type={} scope={}",
                allocation_type.as_raw(),
                scope.as_raw()
            ),
        );
    }

    pub fn notify_internal_free(
        &self,
        size: usize,
        allocation_type: InternalAllocationType,
        scope: SystemAllocationScope,
    ) {
        let mut state = self.state.lock();
        state.record_lifecycle(
            AllocatorLogLevel::Trace,
            "internal_free",
            "internal_free_notice",
            None,
            Some(size),
            "noop",
            format!(
                "type={} scope={}",
                allocation_type.as_raw(),
                scope.as_raw()
            ),
        );
    }

    /// True iff no allocation is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().allocation_count == 0
    }

    #[must_use]
    pub fn current_allocation_count(&self) -> usize {
        self.state.lock().allocation_count
    }

    #[must_use]
    pub fn current_call_count(&self) -> usize {
        self.state.lock().call_count
    }

    #[must_use]
    pub fn policy(&self) -> FaultPolicy {
        self.state.lock().policy
    }

    /// Replace the fault policy. Takes effect on the next call.
    pub fn update_policy(&self, policy: FaultPolicy) {
        let mut state = self.state.lock();
        let previous = state.policy;
        state.policy = policy;
        state.record_lifecycle(
            AllocatorLogLevel::Debug,
            "update_policy",
            "policy_updated",
            None,
            None,
            "success",
            format!("previous={previous:?} next={policy:?}"),
        );
    }

    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        self.state.lock().stats()
    }

    /// Sum of requested sizes over live allocations.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }

    /// Look up a live allocation by the pointer the caller received.
    #[must_use]
    pub fn lookup(&self, ptr: NonNull<u8>) -> Option<AllocationSnapshot> {
        let addr = ptr.as_ptr() as usize;
        self.state.lock().records.get(&addr).map(AllocationRecord::snapshot)
    }

    /// All live allocations, ordered by address.
    #[must_use]
    pub fn live_allocations(&self) -> Vec<AllocationSnapshot> {
        let state = self.state.lock();
        let mut out: Vec<_> = state.records.values().map(AllocationRecord::snapshot).collect();
        out.sort_unstable_by_key(|s| s.aligned);
        out
    }

    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.state.lock().log.snapshot()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.state.lock().log.drain()
    }
}

impl Default for TrackedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackAllocator for TrackedAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<NonNull<u8>, TrackerError> {
        TrackedAllocator::allocate(self, size, alignment, scope)
    }

    fn reallocate(
        &self,
        original: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        scope: SystemAllocationScope,
    ) -> Result<Option<NonNull<u8>>, TrackerError> {
        TrackedAllocator::reallocate(self, original, size, alignment, scope)
    }

    fn free(&self, memory: Option<NonNull<u8>>) {
        TrackedAllocator::free(self, memory);
    }

    fn notify_internal_allocation(
        &self,
        size: usize,
        allocation_type: InternalAllocationType,
        scope: SystemAllocationScope,
    ) {
        TrackedAllocator::notify_internal_allocation(self, size, allocation_type, scope);
    }

    fn notify_internal_free(
        &self,
        size: usize,
        allocation_type: InternalAllocationType,
        scope: SystemAllocationScope,
    ) {
        TrackedAllocator::notify_internal_free(self, size, allocation_type, scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FaultTrigger;

    const SCOPE: SystemAllocationScope = SystemAllocationScope::OBJECT;

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        // SAFETY: tests only fill windows the tracker just issued for `len` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) }
    }

    fn read(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
        // SAFETY: tests only read windows the tracker issued for at least `len` bytes.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len).to_vec() }
    }

    #[test]
    fn new_tracker_is_empty() {
        let tracker = TrackedAllocator::new();
        assert!(tracker.is_empty());
        assert_eq!(tracker.current_allocation_count(), 0);
        assert_eq!(tracker.current_call_count(), 0);
        assert_eq!(tracker.policy(), FaultPolicy::never());
    }

    #[test]
    fn allocate_and_free_cycle() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(256, 16, SCOPE).expect("allocate");
        fill(ptr, 256, 0xAB);
        assert_eq!(tracker.current_allocation_count(), 1);
        assert_eq!(tracker.current_call_count(), 1);
        assert_eq!(tracker.live_bytes(), 256);

        tracker.free(Some(ptr));
        assert!(tracker.is_empty());
        assert_eq!(tracker.current_call_count(), 1, "free does not count as a call");
        assert_eq!(tracker.live_bytes(), 0);
    }

    #[test]
    fn zero_size_allocation_succeeds_and_frees() {
        let tracker = TrackedAllocator::new();
        let a = tracker.allocate(0, 1, SCOPE).expect("zero-size allocate");
        let b = tracker.allocate(0, 8, SCOPE).expect("zero-size allocate");
        assert_ne!(a, b);
        assert_eq!(tracker.current_allocation_count(), 2);
        tracker.free(Some(a));
        tracker.free(Some(b));
        assert!(tracker.is_empty());
    }

    #[test]
    fn snapshot_preserves_scope_and_sizes() {
        let tracker = TrackedAllocator::new();
        let scope = SystemAllocationScope(42);
        let ptr = tracker.allocate(100, 64, scope).expect("allocate");
        let snap = tracker.lookup(ptr).expect("tracked");
        assert_eq!(snap.aligned, ptr.as_ptr() as usize);
        assert_eq!(snap.requested_size, 100);
        assert!(snap.actual_size >= 100 + 63);
        assert_eq!(snap.alignment, 64);
        assert_eq!(snap.scope, scope);
        assert!(snap.aligned >= snap.raw && snap.aligned < snap.raw + 64);
        tracker.free(Some(ptr));
        assert!(tracker.lookup(ptr).is_none());
    }

    #[test]
    fn example_call_threshold_scenario() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_call(2));
        let a = tracker.allocate(64, 8, SCOPE).expect("A");
        let b = tracker.allocate(128, 16, SCOPE).expect("B");
        let c = tracker.allocate(32, 8, SCOPE);
        assert_eq!(
            c,
            Err(TrackerError::InjectedFailure {
                trigger: FaultTrigger::CallIndex,
                index: 2
            })
        );
        assert_eq!(tracker.current_allocation_count(), 2);
        assert_eq!(tracker.current_call_count(), 2);

        tracker.free(Some(a));
        tracker.free(Some(b));
        assert!(tracker.is_empty());
    }

    #[test]
    fn rejected_call_fails_again_when_retried() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_call(0));
        for _ in 0..3 {
            assert!(tracker.allocate(8, 8, SCOPE).unwrap_err().is_injected());
        }
        assert_eq!(tracker.stats().injected_failures, 3);
        assert_eq!(tracker.current_call_count(), 0);
    }

    #[test]
    fn allocation_threshold_tracks_live_count() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_allocation(1));
        let a = tracker.allocate(8, 8, SCOPE).expect("first");
        assert!(tracker.allocate(8, 8, SCOPE).unwrap_err().is_injected());
        tracker.free(Some(a));
        // Live count is back to zero, so allocating passes the threshold again.
        let b = tracker.allocate(8, 8, SCOPE).expect("after free");
        tracker.free(Some(b));
        assert!(tracker.is_empty());
    }

    #[test]
    fn update_policy_takes_effect_mid_scenario() {
        let tracker = TrackedAllocator::new();
        let a = tracker.allocate(16, 8, SCOPE).expect("a");
        tracker.update_policy(FaultPolicy::on_call(1));
        assert!(tracker.allocate(16, 8, SCOPE).is_err());
        tracker.update_policy(FaultPolicy::never());
        let b = tracker.allocate(16, 8, SCOPE).expect("b");
        tracker.free(Some(a));
        tracker.free(Some(b));
        assert!(tracker.is_empty());
    }

    #[test]
    fn realloc_null_behaves_as_allocate() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker
            .reallocate(None, 48, 16, SCOPE)
            .expect("realloc")
            .expect("non-null");
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(tracker.current_allocation_count(), 1);
        assert_eq!(tracker.current_call_count(), 1);
        tracker.free(Some(ptr));
    }

    #[test]
    fn realloc_null_is_fault_injected_like_allocate() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_call(0));
        assert!(tracker.reallocate(None, 48, 16, SCOPE).unwrap_err().is_injected());
        assert!(tracker.is_empty());
    }

    #[test]
    fn realloc_unknown_pointer_fails() {
        let tracker = TrackedAllocator::new();
        let local = 7u64;
        let foreign = NonNull::from(&local).cast::<u8>();
        assert_eq!(
            tracker.reallocate(Some(foreign), 64, 8, SCOPE),
            Err(TrackerError::UnknownPointer {
                addr: foreign.as_ptr() as usize
            })
        );
        assert_eq!(tracker.current_call_count(), 0);
    }

    #[test]
    fn realloc_to_zero_frees_without_counting() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_call(1));
        let ptr = tracker.allocate(32, 8, SCOPE).expect("allocate");
        // Armed for the next call, but size zero bypasses injection.
        assert_eq!(tracker.reallocate(Some(ptr), 0, 8, SCOPE), Ok(None));
        assert!(tracker.is_empty());
        assert_eq!(tracker.current_call_count(), 1);
    }

    #[test]
    fn realloc_shrink_returns_original_and_never_fails() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(128, 8, SCOPE).expect("allocate");
        tracker.update_policy(FaultPolicy::on_call(1));
        for size in [128, 64, 1] {
            assert_eq!(tracker.reallocate(Some(ptr), size, 8, SCOPE), Ok(Some(ptr)));
        }
        assert_eq!(tracker.current_call_count(), 1);
        assert_eq!(tracker.lookup(ptr).expect("tracked").requested_size, 128);
        tracker.free(Some(ptr));
        assert!(tracker.is_empty());
    }

    #[test]
    fn realloc_growth_moves_contents() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(16, 8, SCOPE).expect("allocate");
        fill(ptr, 16, 0x5A);
        let grown = tracker
            .reallocate(Some(ptr), 4096, 64, SCOPE)
            .expect("grow")
            .expect("non-null");
        assert_eq!(grown.as_ptr() as usize % 64, 0);
        assert_eq!(read(grown, 16), vec![0x5A; 16]);
        assert_eq!(tracker.current_allocation_count(), 1);
        assert_eq!(tracker.current_call_count(), 2);
        assert!(tracker.lookup(ptr).is_none() || ptr == grown);
        assert_eq!(tracker.live_bytes(), 4096);
        tracker.free(Some(grown));
        assert!(tracker.is_empty());
    }

    #[test]
    fn failed_growth_leaves_original_intact() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(32, 8, SCOPE).expect("allocate");
        fill(ptr, 32, 0xC3);
        let before = tracker.lookup(ptr).expect("tracked");

        tracker.update_policy(FaultPolicy::on_call(1));
        let err = tracker.reallocate(Some(ptr), 64, 8, SCOPE).unwrap_err();
        assert!(err.is_injected());

        assert_eq!(tracker.lookup(ptr), Some(before));
        assert_eq!(read(ptr, 32), vec![0xC3; 32]);
        assert_eq!(tracker.current_allocation_count(), 1);
        assert_eq!(tracker.current_call_count(), 1);

        tracker.free(Some(ptr));
        assert!(tracker.is_empty());
    }

    #[test]
    fn growth_respects_allocation_threshold() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(8, 8, SCOPE).expect("allocate");
        tracker.update_policy(FaultPolicy::on_allocation(1));
        let err = tracker.reallocate(Some(ptr), 16, 8, SCOPE).unwrap_err();
        assert_eq!(
            err,
            TrackerError::InjectedFailure {
                trigger: FaultTrigger::AllocationIndex,
                index: 1
            }
        );
        tracker.free(Some(ptr));
    }

    #[test]
    fn free_null_and_foreign_are_noops() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(8, 8, SCOPE).expect("allocate");
        tracker.free(None);
        let local = 1u32;
        tracker.free(Some(NonNull::from(&local).cast()));
        assert_eq!(tracker.current_allocation_count(), 1);
        tracker.free(Some(ptr));
        assert!(tracker.is_empty());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(64, 8, SCOPE).expect("allocate");
        tracker.free(Some(ptr));
        tracker.free(Some(ptr));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn free_after_realloc_to_zero_panics() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(64, 8, SCOPE).expect("allocate");
        assert_eq!(tracker.reallocate(Some(ptr), 0, 8, SCOPE), Ok(None));
        tracker.free(Some(ptr));
    }

    #[test]
    #[should_panic(expected = "no live allocations counted")]
    fn count_underflow_panics() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(64, 8, SCOPE).expect("allocate");
        // Corrupt the counter to simulate a bookkeeping bug.
        tracker.state.lock().allocation_count = 0;
        tracker.free(Some(ptr));
    }

    #[test]
    fn invalid_alignment_changes_nothing() {
        let tracker = TrackedAllocator::new();
        assert_eq!(
            tracker.allocate(8, 12, SCOPE),
            Err(TrackerError::InvalidLayout {
                size: 8,
                alignment: 12
            })
        );
        assert!(tracker.is_empty());
        assert_eq!(tracker.current_call_count(), 0);
    }

    #[test]
    fn notifications_do_not_touch_bookkeeping() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_call(0));
        tracker.notify_internal_allocation(1024, InternalAllocationType::EXECUTABLE, SCOPE);
        tracker.notify_internal_free(1024, InternalAllocationType::EXECUTABLE, SCOPE);
        assert_eq!(tracker.stats(), TrackerStats::default());
    }

    #[test]
    fn live_allocations_are_sorted_and_complete() {
        let tracker = TrackedAllocator::new();
        let ptrs: Vec<_> = (1..=5)
            .map(|i| tracker.allocate(i * 10, 8, SCOPE).expect("allocate"))
            .collect();
        let live = tracker.live_allocations();
        assert_eq!(live.len(), 5);
        assert!(live.windows(2).all(|w| w[0].aligned < w[1].aligned));
        assert_eq!(live.iter().map(|s| s.requested_size).sum::<usize>(), 150);
        for ptr in ptrs {
            tracker.free(Some(ptr));
        }
        assert!(tracker.live_allocations().is_empty());
    }

    #[test]
    fn peak_allocation_count_is_sticky() {
        let tracker = TrackedAllocator::new();
        let a = tracker.allocate(8, 8, SCOPE).unwrap();
        let b = tracker.allocate(8, 8, SCOPE).unwrap();
        tracker.free(Some(a));
        tracker.free(Some(b));
        let stats = tracker.stats();
        assert_eq!(stats.peak_allocation_count, 2);
        assert_eq!(stats.allocation_count, 0);
    }

    #[test]
    fn lifecycle_logs_include_trace_and_decision_ids() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(64, 8, SCOPE).unwrap();
        tracker.free(Some(ptr));

        let logs = tracker.drain_lifecycle_logs();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|entry| entry.decision_id > 0));
        assert!(
            logs.iter()
                .all(|entry| entry.trace_id.starts_with("core::tracker::"))
        );
        assert_eq!(logs[0].event, "alloc");
        assert_eq!(logs[0].allocation_count, 1);
        assert_eq!(logs[1].event, "free");
        assert_eq!(logs[1].allocation_count, 0);
        assert!(tracker.lifecycle_logs().is_empty());
    }

    #[test]
    fn lifecycle_logs_flag_injection_and_unknown_pointers() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_call(0));
        let _ = tracker.allocate(8, 8, SCOPE);
        let local = 0u8;
        let foreign = NonNull::from(&local);
        tracker.free(Some(foreign));
        let _ = tracker.reallocate(Some(foreign), 16, 8, SCOPE);

        let logs = tracker.drain_lifecycle_logs();
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Info && entry.event == "alloc_injected_failure"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Warn && entry.event == "unknown_free_pointer"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Warn && entry.event == "realloc_unknown_pointer"
        }));
    }

    #[test]
    fn disabled_log_records_nothing() {
        let tracker = TrackedAllocator::with_config(TrackerConfig::default().log_capacity(0));
        let ptr = tracker.allocate(8, 8, SCOPE).unwrap();
        tracker.free(Some(ptr));
        assert!(tracker.lifecycle_logs().is_empty());
    }

    #[test]
    fn quarantined_address_is_not_reissued() {
        let tracker = TrackedAllocator::new();
        let first = tracker.allocate(24, 8, SCOPE).unwrap();
        tracker.free(Some(first));
        let mut boxes = Vec::new();
        for _ in 0..64 {
            let raw = Box::into_raw(Box::new([0u8; 31]));
            assert_ne!(raw.cast::<u8>(), first.as_ptr());
            boxes.push(raw);
            let ptr = tracker.allocate(24, 8, SCOPE).unwrap();
            assert_ne!(ptr, first);
            tracker.free(Some(ptr));
        }
        for raw in boxes {
            // SAFETY: each pointer came from Box::into_raw above and is freed once.
            drop(unsafe { Box::from_raw(raw) });
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn evicted_address_is_tolerated_as_foreign() {
        let tracker = TrackedAllocator::new();
        let first = tracker.allocate(24, 8, SCOPE).unwrap();
        let addr = first.as_ptr() as usize;
        tracker.free(Some(first));
        for _ in 0..QUARANTINE_MAX_ENTRIES {
            let ptr = tracker.allocate(24, 8, SCOPE).unwrap();
            tracker.free(Some(ptr));
        }
        {
            let state = tracker.state.lock();
            assert_eq!(state.quarantine.len(), QUARANTINE_MAX_ENTRIES);
            assert!(!state.recently_freed.contains(&addr));
        }
        tracker.drain_lifecycle_logs();

        // The host may now hand this address to another owner; forwarding
        // that owner's free here must not abort.
        tracker.free(Some(first));
        assert!(tracker.is_empty());
        let logs = tracker.drain_lifecycle_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, "unknown_free_pointer");
        assert_eq!(logs[0].level, AllocatorLogLevel::Warn);
    }

    #[test]
    fn host_reuse_after_eviction_is_not_a_double_free() {
        let tracker = TrackedAllocator::new();
        let first = tracker.allocate(24, 8, SCOPE).unwrap();
        tracker.free(Some(first));
        for _ in 0..QUARANTINE_MAX_ENTRIES {
            let ptr = tracker.allocate(24, 8, SCOPE).unwrap();
            tracker.free(Some(ptr));
        }

        let mut boxes = Vec::new();
        for _ in 0..256 {
            let raw = Box::into_raw(Box::new([0u8; 31]));
            boxes.push(raw);
            if raw.cast::<u8>() == first.as_ptr() {
                tracker.free(NonNull::new(raw.cast::<u8>()));
                break;
            }
        }
        for raw in boxes {
            // SAFETY: each pointer came from Box::into_raw above and is freed once.
            drop(unsafe { Box::from_raw(raw) });
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn quarantine_respects_byte_cap() {
        let tracker = TrackedAllocator::with_config(TrackerConfig::default().log_capacity(0));
        let size = QUARANTINE_MAX_BYTES / 4;
        for _ in 0..8 {
            let ptr = tracker.allocate(size, 1, SCOPE).unwrap();
            tracker.free(Some(ptr));
        }
        let state = tracker.state.lock();
        assert!(state.quarantine_bytes <= QUARANTINE_MAX_BYTES);
        assert_eq!(state.quarantine.len(), 4);
        assert_eq!(state.recently_freed.len(), state.quarantine.len());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_after_churn_still_panics() {
        let tracker = TrackedAllocator::new();
        let ptr = tracker.allocate(64, 8, SCOPE).unwrap();
        tracker.free(Some(ptr));
        for _ in 0..QUARANTINE_MAX_ENTRIES - 1 {
            let other = tracker.allocate(64, 8, SCOPE).unwrap();
            tracker.free(Some(other));
        }
        tracker.free(Some(ptr));
    }
}
