//! Exhaustive out-of-memory sweeps.
//!
//! A sweep reruns one scenario against a fresh tracker per threshold:
//! threshold `i` fails the `i`-th call (or the allocation made while `i`
//! allocations are live), the scenario must unwind, and the tracker must be
//! empty afterwards. The sweep ends at the first threshold the scenario
//! outruns, i.e. it completes without any failure having been injected.

use std::io::Write;
use std::time::Instant;

use oomprobe_abi::CallbackTracker;
use oomprobe_core::{AllocationSnapshot, FaultPolicy, FaultTrigger, TrackerStats};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogError, LogLevel, Outcome};

/// Upper bound on iterations per sweep.
pub const DEFAULT_SWEEP_LIMIT: usize = 10_000;

/// What a scenario reports back to the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Completed,
    /// An allocation failed and the scenario released what it held.
    OutOfMemory,
}

impl From<ScenarioOutcome> for Outcome {
    fn from(outcome: ScenarioOutcome) -> Self {
        match outcome {
            ScenarioOutcome::Completed => Self::Completed,
            ScenarioOutcome::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// One iteration of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStep {
    pub threshold: usize,
    pub outcome: ScenarioOutcome,
    /// Whether the policy actually rejected a call during this iteration.
    pub injected: bool,
    pub call_count: usize,
    pub peak_allocation_count: usize,
}

/// Summary of a sweep that ran to its natural end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub name: String,
    pub trigger: FaultTrigger,
    pub start: usize,
    pub steps: Vec<SweepStep>,
    /// First threshold at which the scenario ran without an injected failure.
    pub completed_at: usize,
}

impl SweepReport {
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.steps.len()
    }

    /// Iterations in which the scenario reported out-of-memory.
    #[must_use]
    pub fn out_of_memory_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == ScenarioOutcome::OutOfMemory)
            .count()
    }

    /// Iterations in which an injected failure was absorbed and the scenario still completed.
    #[must_use]
    pub fn recovered_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.injected && s.outcome == ScenarioOutcome::Completed)
            .count()
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(
        "{name}: {} allocation(s) ({live_bytes} bytes) leaked at {trigger} {threshold}",
        .live.len()
    )]
    Leak {
        name: String,
        trigger: FaultTrigger,
        threshold: usize,
        outcome: ScenarioOutcome,
        live_bytes: usize,
        live: Vec<AllocationSnapshot>,
    },
    #[error(
        "{name}: scenario still failing after {limit} iterations (last threshold {last_threshold})"
    )]
    LimitExceeded {
        name: String,
        limit: usize,
        last_threshold: usize,
    },
    #[error(
        "{name}: scenario reported out-of-memory at threshold {threshold} but nothing was injected"
    )]
    SpuriousOutOfMemory { name: String, threshold: usize },
    #[error("log: {0}")]
    Log(#[from] LogError),
}

/// Builder and driver for one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultSweep {
    name: String,
    trigger: FaultTrigger,
    start: usize,
    limit: usize,
    forward_lifecycle: bool,
}

impl FaultSweep {
    /// Sweep over `fail_on_call_index`.
    #[must_use]
    pub fn on_calls() -> Self {
        Self::new(FaultTrigger::CallIndex)
    }

    /// Sweep over `fail_on_allocation_index`.
    #[must_use]
    pub fn on_allocations() -> Self {
        Self::new(FaultTrigger::AllocationIndex)
    }

    fn new(trigger: FaultTrigger) -> Self {
        Self {
            name: "scenario".to_string(),
            trigger,
            start: 0,
            limit: DEFAULT_SWEEP_LIMIT,
            forward_lifecycle: false,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// First threshold to try.
    #[must_use]
    pub fn starting_at(mut self, threshold: usize) -> Self {
        self.start = threshold;
        self
    }

    /// Maximum number of iterations.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Also copy each iteration's tracker lifecycle records into the log.
    #[must_use]
    pub fn forward_lifecycle_logs(mut self, forward: bool) -> Self {
        self.forward_lifecycle = forward;
        self
    }

    /// Policy used for `threshold`.
    #[must_use]
    pub fn policy_for(&self, threshold: usize) -> FaultPolicy {
        match self.trigger {
            FaultTrigger::CallIndex => FaultPolicy::on_call(threshold),
            FaultTrigger::AllocationIndex => FaultPolicy::on_allocation(threshold),
        }
    }

    pub fn run<F>(&self, scenario: F) -> Result<SweepReport, SweepError>
    where
        F: FnMut(&CallbackTracker) -> ScenarioOutcome,
    {
        self.drive::<F, std::io::Sink>(None, scenario)
    }

    /// Like [`Self::run`], writing one JSONL entry per iteration.
    pub fn run_logged<F, W>(
        &self,
        emitter: &mut LogEmitter<W>,
        scenario: F,
    ) -> Result<SweepReport, SweepError>
    where
        F: FnMut(&CallbackTracker) -> ScenarioOutcome,
        W: Write,
    {
        let result = self.drive(Some(&mut *emitter), scenario);
        if let Err(err) = &result
            && !matches!(err, SweepError::Log(_))
        {
            let entry = self
                .entry(LogLevel::Error, "sweep_failed")
                .with_outcome(match err {
                    SweepError::Leak { .. } => Outcome::Leak,
                    _ => Outcome::Error,
                })
                .with_details(serde_json::json!({ "error": err.to_string() }));
            emitter.emit_entry(entry)?;
        }
        emitter.flush().map_err(LogError::from)?;
        result
    }

    fn entry(&self, level: LogLevel, event: &str) -> LogEntry {
        LogEntry::new(String::new(), level, event).with_scenario(&self.name)
    }

    fn step_entry(
        &self,
        threshold: usize,
        step: &SweepStep,
        stats: TrackerStats,
        elapsed_us: u64,
    ) -> LogEntry {
        let level = if step.outcome == ScenarioOutcome::OutOfMemory || step.injected {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };
        self.entry(level, "sweep_step")
            .with_threshold(self.trigger, threshold)
            .with_outcome(step.outcome.into())
            .with_counters(stats.allocation_count, stats.call_count, stats.injected_failures)
            .with_duration_us(elapsed_us)
    }

    fn drive<F, W>(
        &self,
        mut emitter: Option<&mut LogEmitter<W>>,
        mut scenario: F,
    ) -> Result<SweepReport, SweepError>
    where
        F: FnMut(&CallbackTracker) -> ScenarioOutcome,
        W: Write,
    {
        if let Some(emitter) = emitter.as_deref_mut() {
            emitter.emit_entry(
                self.entry(LogLevel::Info, "sweep_start")
                    .with_threshold(self.trigger, self.start)
                    .with_details(serde_json::json!({ "limit": self.limit })),
            )?;
        }

        let mut steps = Vec::new();
        let mut threshold = self.start;
        for _ in 0..self.limit {
            let tracker = CallbackTracker::new(self.policy_for(threshold));
            let started = Instant::now();
            let outcome = scenario(&tracker);
            let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            let stats = tracker.stats();
            let step = SweepStep {
                threshold,
                outcome,
                injected: stats.injected_failures > 0,
                call_count: stats.call_count,
                peak_allocation_count: stats.peak_allocation_count,
            };

            if let Some(emitter) = emitter.as_deref_mut() {
                if self.forward_lifecycle {
                    for record in tracker.drain_lifecycle_logs() {
                        emitter.emit_entry(
                            LogEntry::from_lifecycle(&record).with_scenario(&self.name),
                        )?;
                    }
                }
                emitter.emit_entry(self.step_entry(threshold, &step, stats, elapsed_us))?;
            }

            if !tracker.is_empty() {
                return Err(SweepError::Leak {
                    name: self.name.clone(),
                    trigger: self.trigger,
                    threshold,
                    outcome,
                    live_bytes: stats.live_bytes,
                    live: tracker.live_allocations(),
                });
            }
            if outcome == ScenarioOutcome::OutOfMemory && !step.injected {
                return Err(SweepError::SpuriousOutOfMemory {
                    name: self.name.clone(),
                    threshold,
                });
            }

            steps.push(step);
            if outcome == ScenarioOutcome::Completed && !step.injected {
                let report = SweepReport {
                    name: self.name.clone(),
                    trigger: self.trigger,
                    start: self.start,
                    steps,
                    completed_at: threshold,
                };
                if let Some(emitter) = emitter.as_deref_mut() {
                    emitter.emit_entry(
                        self.entry(LogLevel::Info, "sweep_complete")
                            .with_threshold(self.trigger, threshold)
                            .with_outcome(Outcome::Completed)
                            .with_details(serde_json::json!({
                                "iterations": report.iterations(),
                                "out_of_memory_steps": report.out_of_memory_steps(),
                                "recovered_steps": report.recovered_steps(),
                            })),
                    )?;
                }
                return Ok(report);
            }
            threshold += 1;
        }

        Err(SweepError::LimitExceeded {
            name: self.name.clone(),
            limit: self.limit,
            last_threshold: threshold.saturating_sub(1),
        })
    }
}
