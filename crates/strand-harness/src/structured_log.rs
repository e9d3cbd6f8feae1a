//! Structured JSONL log contract for scenario runs.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes records to a file, stdout or any writer.
//! - [`CoreLine`]: parses a diagnostic line from `strand-core`'s logger.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use strand_core::LogPriority;

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
    Fatal,
}

impl From<LogPriority> for LogLevel {
    fn from(p: LogPriority) -> Self {
        match p {
            LogPriority::Debug => Self::Debug,
            LogPriority::Info => Self::Info,
            LogPriority::Warn => Self::Warn,
            LogPriority::Error => Self::Error,
        }
    }
}

/// Scenario or check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
    Timeout,
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// The scenario driver itself.
    Scenario,
    /// A diagnostic line forwarded from `strand-core`.
    Core,
    Perf,
}

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
    pub scenario: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamKind>,
    /// Kernel tid the record is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_deadlocks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
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
            scenario: None,
            stream: None,
            tid: None,
            thread_count: None,
            predicted_deadlocks: None,
            outcome: None,
            errno: None,
            latency_ns: None,
            duration_ms: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: StreamKind) -> Self {
        self.stream = Some(stream);
        self
    }

    #[must_use]
    pub fn with_tid(mut self, tid: i32) -> Self {
        self.tid = Some(tid);
        self
    }

    #[must_use]
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_predicted_deadlocks(mut self, count: u64) -> Self {
        self.predicted_deadlocks = Some(count);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Set latency in nanoseconds.
    #[must_use]
    pub fn with_latency_ns(mut self, ns: u64) -> Self {
        self.latency_ns = Some(ns);
        self
    }

    /// Set duration in milliseconds.
    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
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
// Core diagnostic lines
// ---------------------------------------------------------------------------

/// A parsed `<letter>/<tag>(<tid>): <message>` line from `strand-core`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreLine {
    pub level: LogLevel,
    pub tag: String,
    pub tid: i32,
    pub message: String,
}

impl CoreLine {
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let (head, message) = line.split_once(": ")?;
        let (letter, rest) = head.split_once('/')?;
        let level = match letter {
            "D" => LogLevel::Debug,
            "I" => LogLevel::Info,
            "W" => LogLevel::Warn,
            "E" => LogLevel::Error,
            _ => return None,
        };
        let (tag, tid) = rest.strip_suffix(')')?.rsplit_once('(')?;
        Some(Self {
            level,
            tag: tag.to_string(),
            tid: tid.parse().ok()?,
            message: message.to_string(),
        })
    }

    /// Wrap as a `core_log` entry; the trace id is filled in on emit.
    #[must_use]
    pub fn into_entry(self) -> LogEntry {
        LogEntry::new(String::new(), self.level, "core_log")
            .with_stream(StreamKind::Core)
            .with_tid(self.tid)
            .with_details(serde_json::json!({ "tag": self.tag, "message": self.message }))
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write>,
    seq: u64,
    scenario: String,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, scenario: &str, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(
            Box::new(std::io::BufWriter::new(file)),
            scenario,
            run_id,
        ))
    }

    #[must_use]
    pub fn to_stdout(scenario: &str, run_id: &str) -> Self {
        Self::to_writer(Box::new(std::io::stdout()), scenario, run_id)
    }

    #[must_use]
    pub fn to_writer(writer: Box<dyn Write>, scenario: &str, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            scenario: scenario.to_string(),
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{}::{:03}", self.scenario, self.run_id, self.seq)
    }

    /// Emit a log entry with auto-generated trace_id and scenario.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(&trace_id, level, event).with_scenario(&self.scenario);
        let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Emit a fully-populated log entry, filling in trace id and scenario.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.scenario.is_none() {
            entry.scenario = Some(self.scenario.clone());
        }
        let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    /// A fresh entry bound to this emitter's next trace id.
    pub fn entry(&mut self, level: LogLevel, event: &str) -> LogEntry {
        let trace_id = self.next_trace_id();
        LogEntry::new(trace_id, level, event).with_scenario(&self.scenario)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// One schema problem in a JSONL log.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
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

type Record = serde_json::Map<String, serde_json::Value>;

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal"];
const OUTCOMES: &[&str] = &["pass", "fail", "skip", "error", "timeout"];

fn check_enum(
    record: &Record,
    field: &str,
    allowed: &[&str],
    line: usize,
) -> Option<LogValidationError> {
    let value = record.get(field)?.as_str()?;
    (!allowed.contains(&value))
        .then(|| LogValidationError::new(line, field, format!("invalid {field}: '{value}'")))
}

fn check_record(record: &Record, line: usize) -> Vec<LogValidationError> {
    let mut errors: Vec<_> = ["timestamp", "trace_id", "level", "event"]
        .into_iter()
        .filter(|field| !record.contains_key(*field))
        .map(|field| LogValidationError::new(line, field, "required field missing"))
        .collect();

    errors.extend(
        [
            check_enum(record, "level", LEVELS, line),
            check_enum(record, "outcome", OUTCOMES, line),
            check_enum(record, "stream", &["scenario", "core", "perf"], line),
        ]
        .into_iter()
        .flatten(),
    );

    // Core lines must say which thread logged them.
    let is_core = record.get("stream").and_then(|v| v.as_str()) == Some("core");
    if is_core && !record.get("tid").is_some_and(serde_json::Value::is_i64) {
        errors.push(LogValidationError::new(
            line,
            "tid",
            "core records must carry the logging tid",
        ));
    }

    if let Some(errno) = record.get("errno").and_then(serde_json::Value::as_i64)
        && errno <= 0
    {
        errors.push(LogValidationError::new(
            line,
            "errno",
            format!("errno must be positive, got {errno}"),
        ));
    }

    if let Some(trace_id) = record.get("trace_id").and_then(|v| v.as_str())
        && trace_id.split("::").count() != 3
    {
        errors.push(LogValidationError::new(
            line,
            "trace_id",
            format!("expected <scenario>::<run_id>::<seq>, got '{trace_id}'"),
        ));
    }
    errors
}

/// Check one JSONL line and decode it.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
        vec![LogValidationError::new(
            line_number,
            "<json>",
            format!("invalid JSON: {e}"),
        )]
    })?;
    let Some(record) = value.as_object() else {
        return Err(vec![LogValidationError::new(
            line_number,
            "<root>",
            "expected JSON object",
        )]);
    };

    let errors = check_record(record, line_number);
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

/// Check every non-blank line of a JSONL file.
///
/// Returns how many records were checked and every problem found.
pub fn validate_log_file(path: &Path) -> std::io::Result<(usize, Vec<LogValidationError>)> {
    let content = std::fs::read_to_string(path)?;
    let mut checked = 0;
    let mut errors = Vec::new();
    let records = content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty());
    for (line_number, line) in records {
        checked += 1;
        if let Err(found) = validate_log_line(line, line_number) {
            errors.extend(found);
        }
    }
    Ok((checked, errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Days since the epoch to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("spawn::run-1::001", LogLevel::Info, "scenario_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "spawn::run-1::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "scenario_start");
        assert!(parsed.get("scenario").is_none());
        assert!(parsed.get("tid").is_none());
    }

    #[test]
    fn timestamps_are_real_calendar_dates() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        // 2024-02-29 12:34:56 UTC
        assert_eq!(format_utc(1_709_210_096, 7), "2024-02-29T12:34:56.007Z");
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }

    #[test]
    fn core_line_parses_and_converts() {
        let line = CoreLine::parse("W/lockorder(4242): --- mutex at 0x7f00").unwrap();
        assert_eq!(line.level, LogLevel::Warn);
        assert_eq!(line.tag, "lockorder");
        assert_eq!(line.tid, 4242);
        assert_eq!(line.message, "--- mutex at 0x7f00");
        let entry = line.into_entry();
        assert_eq!(entry.stream, Some(StreamKind::Core));
        assert_eq!(entry.tid, Some(4242));

        assert!(CoreLine::parse("no separator").is_none());
        assert!(CoreLine::parse("X/tag(1): msg").is_none());
        assert!(CoreLine::parse("I/tag(abc): msg").is_none());
        // Messages may contain the separator themselves.
        let nested = CoreLine::parse("I/strand(7): a: b").unwrap();
        assert_eq!(nested.message, "a: b");
    }

    #[test]
    fn priority_maps_to_level() {
        assert_eq!(LogLevel::from(LogPriority::Warn), LogLevel::Warn);
        assert_eq!(LogLevel::from(LogPriority::Debug), LogLevel::Debug);
    }

    #[test]
    fn validate_missing_required_field() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"info","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn validate_invalid_level_and_stream() {
        let json = r#"{"timestamp":"t","trace_id":"a::b::c","level":"critical","event":"e","stream":"kernel"}"#;
        let errors = validate_log_line(json, 3).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "level"));
        assert!(errors.iter().any(|e| e.field == "stream"));
        assert!(errors.iter().all(|e| e.line_number == 3));
    }

    #[test]
    fn validate_core_record_needs_tid() {
        let json = r#"{"timestamp":"t","trace_id":"a::b::c","level":"warn","event":"core_log","stream":"core"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "tid"));
    }

    #[test]
    fn validate_rejects_nonpositive_errno() {
        let json = r#"{"timestamp":"t","trace_id":"a::b::c","level":"error","event":"e","errno":0}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "errno"));
    }

    #[test]
    fn validate_invalid_json_and_trace_id() {
        let errors = validate_log_line("not json at all", 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "<json>"));
        let json = r#"{"timestamp":"t","trace_id":"no-separator","level":"info","event":"e"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn emitter_generates_sequential_trace_ids() {
        let mut emitter = LogEmitter::to_writer(Box::new(Vec::new()), "spawn", "run-42");
        let e1 = emitter.emit(LogLevel::Info, "start").unwrap();
        let e2 = emitter.emit(LogLevel::Info, "end").unwrap();
        assert_eq!(e1.trace_id, "spawn::run-42::001");
        assert_eq!(e2.trace_id, "spawn::run-42::002");
        assert_eq!(e1.scenario.as_deref(), Some("spawn"));
    }
}
