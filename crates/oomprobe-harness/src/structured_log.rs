//! Structured JSONL logging for fault sweeps.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required and optional fields.
//! - [`LogEmitter`]: writes entries to a file, a buffer, or any writer.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks for
//!   recorded runs.
//!
//! Tracker lifecycle records can be lifted into entries with
//! [`LogEntry::from_lifecycle`], so one file can hold both the sweep's view
//! and the allocator's view of a run.

use std::io::Write;
use std::path::Path;

use oomprobe_core::{AllocatorLogLevel, AllocatorLogRecord, FaultTrigger};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<AllocatorLogLevel> for LogLevel {
    fn from(level: AllocatorLogLevel) -> Self {
        match level {
            AllocatorLogLevel::Trace => Self::Trace,
            AllocatorLogLevel::Debug => Self::Debug,
            AllocatorLogLevel::Info => Self::Info,
            AllocatorLogLevel::Warn => Self::Warn,
            AllocatorLogLevel::Error => Self::Error,
        }
    }
}

/// Result of one sweep iteration, or of a whole sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The scenario ran to completion.
    Completed,
    /// The scenario observed an allocation failure and unwound cleanly.
    OutOfMemory,
    /// Allocations were still live after the scenario returned.
    Leak,
    /// The sweep stopped for any other reason.
    Error,
}

const OUTCOMES: [&str; 4] = ["completed", "out_of_memory", "leak", "error"];
const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const TRIGGERS: [&str; 2] = ["allocation_index", "call_index"];

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    /// Which counter the sweep drives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<FaultTrigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Callback entry point, for lifted lifecycle records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_allocations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injected_failures: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            run_id: None,
            scenario: None,
            trigger: None,
            threshold: None,
            outcome: None,
            symbol: None,
            live_allocations: None,
            call_count: None,
            injected_failures: None,
            duration_us: None,
            details: None,
        }
    }

    /// Lift a tracker lifecycle record, keeping its trace id.
    #[must_use]
    pub fn from_lifecycle(record: &AllocatorLogRecord) -> Self {
        let mut details = serde_json::Map::new();
        details.insert("decision_id".into(), record.decision_id.into());
        details.insert("tracker_outcome".into(), record.outcome.into());
        if let Some(ptr) = record.ptr {
            details.insert("ptr".into(), format!("{ptr:#x}").into());
        }
        if let Some(size) = record.size {
            details.insert("size".into(), size.into());
        }
        if !record.details.is_empty() {
            details.insert("note".into(), record.details.clone().into());
        }

        let mut entry = Self::new(record.trace_id.clone(), record.level.into(), record.event);
        entry.symbol = Some(record.symbol.to_string());
        entry.live_allocations = Some(record.allocation_count);
        entry.call_count = Some(record.call_count);
        entry.details = Some(serde_json::Value::Object(details));
        entry
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    /// Set the driven counter and its threshold.
    #[must_use]
    pub fn with_threshold(mut self, trigger: FaultTrigger, threshold: usize) -> Self {
        self.trigger = Some(trigger);
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Set tracker counter snapshots.
    #[must_use]
    pub fn with_counters(
        mut self,
        live_allocations: usize,
        call_count: usize,
        injected_failures: usize,
    ) -> Self {
        self.live_allocations = Some(live_allocations);
        self.call_count = Some(call_count);
        self.injected_failures = Some(injected_failures);
        self
    }

    #[must_use]
    pub fn with_duration_us(mut self, us: u64) -> Self {
        self.duration_us = Some(us);
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Failure writing a log entry.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writes structured JSONL log entries.
#[derive(Debug)]
pub struct LogEmitter<W: Write> {
    writer: W,
    seq: u64,
    run_id: String,
}

impl LogEmitter<std::io::BufWriter<std::fs::File>> {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(std::io::BufWriter::new(file), run_id))
    }
}

impl LogEmitter<Vec<u8>> {
    /// Create an emitter that writes to an in-memory buffer.
    #[must_use]
    pub fn to_buffer(run_id: &str) -> Self {
        Self::new(Vec::new(), run_id)
    }

    /// Lines written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.writer).into_owned()
    }
}

impl<W: Write> LogEmitter<W> {
    pub fn new(writer: W, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Generate the next trace ID.
    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("oomprobe::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a bare entry with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> Result<LogEntry, LogError> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event).with_run(&self.run_id);
        let line = entry.to_jsonl()?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Emit a fully populated entry, filling in trace and run ids if absent.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> Result<(), LogError> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        let line = entry.to_jsonl()?;
        writeln!(self.writer, "{line}")?;
        Ok(())
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_number}: field '{field}': {message}")]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl LogValidationError {
    fn new(line_number: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            line_number,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Err(vec![LogValidationError::new(
                line_number,
                "<json>",
                format!("invalid JSON: {e}"),
            )]);
        }
    };

    let Some(obj) = value.as_object() else {
        return Err(vec![LogValidationError::new(
            line_number,
            "<root>",
            "expected JSON object",
        )]);
    };

    let mut errors = Vec::new();

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(LogValidationError::new(
                line_number,
                field,
                "required field missing",
            ));
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !LEVELS.contains(&level)
    {
        errors.push(LogValidationError::new(
            line_number,
            "level",
            format!("invalid level: '{level}'"),
        ));
    }

    if let Some(outcome) = obj.get("outcome").and_then(|v| v.as_str())
        && !OUTCOMES.contains(&outcome)
    {
        errors.push(LogValidationError::new(
            line_number,
            "outcome",
            format!("invalid outcome: '{outcome}'"),
        ));
    }

    if let Some(trigger) = obj.get("trigger").and_then(|v| v.as_str())
        && !TRIGGERS.contains(&trigger)
    {
        errors.push(LogValidationError::new(
            line_number,
            "trigger",
            format!("invalid trigger: '{trigger}'"),
        ));
    }

    // A threshold without the counter it applies to cannot be replayed.
    if obj.contains_key("threshold") && !obj.contains_key("trigger") {
        errors.push(LogValidationError::new(
            line_number,
            "trigger",
            "threshold present without trigger",
        ));
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id.contains("::")
    {
        errors.push(LogValidationError::new(
            line_number,
            "trace_id",
            format!("trace_id should be '::'-separated, got: '{trace_id}'"),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError::new(
            line_number,
            "<deserialization>",
            format!("failed to deserialize: {e}"),
        )]
    })
}

/// Validate an entire JSONL file.
///
/// Returns the non-blank line count and every validation error found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// RFC 3339 UTC timestamp with millisecond precision.
fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

/// Days since 1970-01-01 to (year, month, day) in the proleptic Gregorian calendar.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oomprobe_core::{FaultPolicy, SystemAllocationScope, TrackedAllocator};

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("oomprobe::run-1::001", LogLevel::Info, "sweep_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "oomprobe::run-1::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "sweep_start");
        // Optional fields should be absent
        assert!(parsed.get("run_id").is_none());
        assert!(parsed.get("threshold").is_none());
        assert!(parsed.get("outcome").is_none());
    }

    #[test]
    fn log_entry_with_optional_fields() {
        let entry = LogEntry::new("oomprobe::run-1::002", LogLevel::Warn, "sweep_step")
            .with_run("run-1")
            .with_scenario("string_table")
            .with_threshold(FaultTrigger::CallIndex, 7)
            .with_outcome(Outcome::OutOfMemory)
            .with_counters(0, 7, 1)
            .with_duration_us(42)
            .with_details(serde_json::json!({"note": "unwound"}));

        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["run_id"], "run-1");
        assert_eq!(parsed["scenario"], "string_table");
        assert_eq!(parsed["trigger"], "call_index");
        assert_eq!(parsed["threshold"], 7);
        assert_eq!(parsed["outcome"], "out_of_memory");
        assert_eq!(parsed["live_allocations"], 0);
        assert_eq!(parsed["call_count"], 7);
        assert_eq!(parsed["injected_failures"], 1);
        assert_eq!(parsed["duration_us"], 42);
        assert!(parsed["details"].is_object());
    }

    #[test]
    fn lifecycle_records_lift_into_valid_lines() {
        let tracker = TrackedAllocator::with_policy(FaultPolicy::on_call(1));
        let ptr = tracker.allocate(16, 8, SystemAllocationScope::OBJECT).unwrap();
        assert!(tracker.allocate(16, 8, SystemAllocationScope::OBJECT).is_err());
        tracker.free(Some(ptr));

        let mut emitter = LogEmitter::to_buffer("lift");
        for record in tracker.drain_lifecycle_logs() {
            emitter.emit_entry(LogEntry::from_lifecycle(&record)).unwrap();
        }
        let text = emitter.contents();
        let entries: Vec<_> = text
            .lines()
            .enumerate()
            .map(|(i, line)| validate_log_line(line, i + 1).expect("valid line"))
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].event, "alloc_injected_failure");
        assert_eq!(entries[1].level, LogLevel::Info);
        assert!(entries[1].trace_id.starts_with("core::tracker::allocate::"));
        assert_eq!(entries[2].symbol.as_deref(), Some("free"));
        assert_eq!(entries[2].live_allocations, Some(0));
        assert_eq!(entries[2].run_id.as_deref(), Some("lift"));
    }

    #[test]
    fn validate_missing_required_field() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00.000Z","level":"info","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn validate_rejects_bad_enums() {
        let json = r#"{"timestamp":"t","trace_id":"a::b","level":"critical","event":"e","outcome":"maybe","trigger":"byte_index","threshold":1}"#;
        let errors = validate_log_line(json, 4).unwrap_err();
        for field in ["level", "outcome", "trigger"] {
            assert!(errors.iter().any(|e| e.field == field), "missing {field}");
        }
        assert!(errors.iter().all(|e| e.line_number == 4));
    }

    #[test]
    fn validate_threshold_requires_trigger() {
        let json = r#"{"timestamp":"t","trace_id":"a::b","level":"info","event":"e","threshold":3}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "trigger");
    }

    #[test]
    fn validate_invalid_json_and_root() {
        let errors = validate_log_line("not json at all", 1).unwrap_err();
        assert_eq!(errors[0].field, "<json>");
        let errors = validate_log_line("[1,2]", 2).unwrap_err();
        assert_eq!(errors[0].field, "<root>");
    }

    #[test]
    fn validate_bad_trace_id_format() {
        let json = r#"{"timestamp":"t","trace_id":"no-separator","level":"info","event":"e"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
        assert_eq!(
            errors[0].to_string(),
            "line 1: field 'trace_id': trace_id should be '::'-separated, got: 'no-separator'"
        );
    }

    #[test]
    fn emitter_generates_sequential_trace_ids() {
        let mut emitter = LogEmitter::to_buffer("run-42");
        let e1 = emitter.emit(LogLevel::Info, "start").unwrap();
        let e2 = emitter.emit(LogLevel::Info, "end").unwrap();
        assert_eq!(e1.trace_id, "oomprobe::run-42::001");
        assert_eq!(e2.trace_id, "oomprobe::run-42::002");
        assert_eq!(emitter.contents().lines().count(), 2);
    }

    #[test]
    fn emitter_fills_missing_ids() {
        let mut emitter = LogEmitter::to_buffer("run-7");
        emitter
            .emit_entry(LogEntry::new("", LogLevel::Debug, "custom"))
            .unwrap();
        let bytes = emitter.into_inner();
        let line = std::str::from_utf8(&bytes).unwrap().trim_end();
        let entry = validate_log_line(line, 1).unwrap();
        assert_eq!(entry.trace_id, "oomprobe::run-7::001");
        assert_eq!(entry.run_id.as_deref(), Some("run-7"));
    }

    #[test]
    fn utc_formatting_matches_known_instants() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_utc(951_782_400, 5), "2000-02-29T00:00:00.005Z");
        assert_eq!(format_utc(1_767_225_599, 999), "2025-12-31T23:59:59.999Z");
    }
}
