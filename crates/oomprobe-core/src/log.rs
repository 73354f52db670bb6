//! Structured tracker lifecycle records.
//!
//! Every operation appends one record while the tracker lock is held, so the
//! ring reflects the same total order the counters observe. The ring is
//! bounded; once full, the oldest record is dropped.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of lifecycle records retained per tracker.
pub const LIFECYCLE_LOG_CAPACITY: usize = 4096;

/// Tracker lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id (starts at 1).
    pub decision_id: u64,
    /// Correlation id: `core::tracker::<symbol>::<decision_id hex>`.
    pub trace_id: String,
    pub level: AllocatorLogLevel,
    /// Callback entry point (`allocate`, `reallocate`, `free`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `realloc_move`, `unknown_free_pointer`, ...).
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: live allocation count after the event.
    pub allocation_count: usize,
    /// Snapshot: accepted call count after the event.
    pub call_count: usize,
}

/// Bounded ring of lifecycle records.
#[derive(Debug)]
pub(crate) struct LifecycleLog {
    records: VecDeque<AllocatorLogRecord>,
    capacity: usize,
    next_decision_id: u64,
}

impl LifecycleLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(LIFECYCLE_LOG_CAPACITY)),
            capacity,
            next_decision_id: 1,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub(crate) fn next_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    pub(crate) fn push(&mut self, record: AllocatorLogRecord) {
        if !self.is_enabled() {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<AllocatorLogRecord> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        self.records.drain(..).collect()
    }
}
