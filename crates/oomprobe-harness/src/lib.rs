//! Fault-sweep harness for oomprobe.
//!
//! This crate provides:
//! - Sweeps: rerun a scenario once per injected-failure threshold and
//!   require a clean, leak-free unwind every time
//! - Structured logs: JSONL records of sweep progress and tracker lifecycle
//!   events, plus validators for recorded runs

#![forbid(unsafe_code)]

pub mod structured_log;
pub mod sweep;

pub use structured_log::{LogEmitter, LogEntry, LogError, LogLevel, Outcome};
pub use sweep::{
    DEFAULT_SWEEP_LIMIT, FaultSweep, ScenarioOutcome, SweepError, SweepReport, SweepStep,
};
