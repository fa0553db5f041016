//! Deterministic diagnostics and replay tracing
//!
//! Diagnostics are collected in memory and returned next to timelines and
//! replay results. Each recorded entry is mirrored to `tracing` so an
//! embedding application can subscribe, but nothing here affects replay.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ValidationError;
use crate::event::EventKind;
use crate::types::{StateHash, Version};

/// Log level for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn rank(self) -> u8 {
        match self {
            LogLevel::Trace => 0,
            LogLevel::Debug => 1,
            LogLevel::Info => 2,
            LogLevel::Warn => 3,
            LogLevel::Error => 4,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ValidationError::InvalidConfig {
                reason: format!("unknown log level '{}'", other),
            }),
        }
    }
}

/// What went wrong (or was worth noting) for a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedTimestamp,
    Validation,
    InconsistentTransition,
    OutOfOrder,
    Advisory,
}

/// A single diagnostic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: LogLevel,
    pub kind: DiagnosticKind,
    /// Position of the event in its batch (timeline building) or in the
    /// ordered timeline (replay)
    pub event_index: Option<usize>,
    pub timestamp_range: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(level: LogLevel, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            event_index: None,
            timestamp_range: None,
            message: message.into(),
        }
    }

    pub fn with_event(mut self, index: usize, timestamp_range: impl Into<String>) -> Self {
        self.event_index = Some(index);
        self.timestamp_range = Some(timestamp_range.into());
        self
    }
}

/// Side list of diagnostics gathered while building or replaying
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticLog {
    entries: Vec<Diagnostic>,
    min_level: LogLevel,
}

impl DiagnosticLog {
    pub fn new(min_level: LogLevel) -> Self {
        Self {
            entries: Vec::new(),
            min_level,
        }
    }

    /// Capture every level
    pub fn all() -> Self {
        Self::new(LogLevel::Trace)
    }

    /// Record an entry if it meets the minimum level
    pub fn record(&mut self, diagnostic: Diagnostic) {
        if diagnostic.level.rank() < self.min_level.rank() {
            return;
        }
        emit(&diagnostic);
        self.entries.push(diagnostic);
    }

    pub fn warn(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        self.record(Diagnostic::new(LogLevel::Warn, kind, message));
    }

    pub fn error(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        self.record(Diagnostic::new(LogLevel::Error, kind, message));
    }

    /// Append another log's entries, keeping this log's level filter
    pub fn extend(&mut self, other: DiagnosticLog) {
        for entry in other.entries {
            if entry.level.rank() >= self.min_level.rank() {
                self.entries.push(entry);
            }
        }
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_kind(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

fn emit(diagnostic: &Diagnostic) {
    let index = diagnostic.event_index;
    let range = diagnostic.timestamp_range.as_deref().unwrap_or("");
    let kind = diagnostic.kind;
    match diagnostic.level {
        LogLevel::Trace => tracing::trace!(?kind, ?index, range, "{}", diagnostic.message),
        LogLevel::Debug => tracing::debug!(?kind, ?index, range, "{}", diagnostic.message),
        LogLevel::Info => tracing::info!(?kind, ?index, range, "{}", diagnostic.message),
        LogLevel::Warn => tracing::warn!(?kind, ?index, range, "{}", diagnostic.message),
        LogLevel::Error => tracing::error!(?kind, ?index, range, "{}", diagnostic.message),
    }
}

/// Outcome of one event during replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    Skipped,
}

/// One step of a replay trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub event_index: usize,
    pub kind: EventKind,
    pub start_time: f64,
    pub outcome: TransitionOutcome,
    pub state_hash_before: Option<StateHash>,
    pub state_hash_after: Option<StateHash>,
}

/// Audit trail of a replay run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayTrace {
    pub rules_version: Version,
    pub events_applied: usize,
    pub events_skipped: usize,
    pub transitions: Vec<TransitionRecord>,
}

impl ReplayTrace {
    pub fn new(rules_version: Version) -> Self {
        Self {
            rules_version,
            events_applied: 0,
            events_skipped: 0,
            transitions: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TransitionRecord) {
        match record.outcome {
            TransitionOutcome::Applied => self.events_applied += 1,
            TransitionOutcome::Skipped => self.events_skipped += 1,
        }
        self.transitions.push(record);
    }

    pub fn skipped(&self) -> Vec<&TransitionRecord> {
        self.transitions
            .iter()
            .filter(|t| t.outcome == TransitionOutcome::Skipped)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_level_filters() {
        let mut log = DiagnosticLog::new(LogLevel::Warn);
        log.record(Diagnostic::new(LogLevel::Info, DiagnosticKind::Advisory, "ignored"));
        log.warn(DiagnosticKind::OutOfOrder, "kept");

        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].message, "kept");
    }

    #[test]
    fn test_extend_applies_own_filter() {
        let mut a = DiagnosticLog::new(LogLevel::Warn);
        let mut b = DiagnosticLog::all();
        b.record(Diagnostic::new(LogLevel::Debug, DiagnosticKind::Advisory, "debug"));
        b.error(DiagnosticKind::Validation, "bad record");
        a.extend(b);

        assert_eq!(a.len(), 1);
        assert_eq!(a.count_kind(DiagnosticKind::Validation), 1);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_trace_counts() {
        let mut trace = ReplayTrace::new(Version::new(1, 0, 0));
        for (i, outcome) in [TransitionOutcome::Applied, TransitionOutcome::Skipped].into_iter().enumerate() {
            trace.push(TransitionRecord {
                event_index: i,
                kind: EventKind::Dispensing,
                start_time: i as f64,
                outcome,
                state_hash_before: None,
                state_hash_after: None,
            });
        }
        assert_eq!(trace.events_applied, 1);
        assert_eq!(trace.events_skipped, 1);
        assert_eq!(trace.skipped()[0].event_index, 1);
    }
}
