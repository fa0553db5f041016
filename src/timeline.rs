//! Timeline building: merges oracle batches into one ordered event sequence

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticLog, LogLevel};
use crate::error::{PipetraceError, SerializationError, TimestampError};
use crate::event::{parse_record, EventKind, LabEvent};
use crate::procedure::ProcedureContext;
use crate::timestamp::TimestampRange;
use crate::traits::TimedEvent;

/// Raw records returned by one oracle query
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    /// Name of the query that produced the batch
    pub query: String,
    /// Kind the query asked for, used for records without a discriminator
    pub hint: Option<EventKind>,
    pub records: Vec<Value>,
}

impl EventBatch {
    pub fn new(query: impl Into<String>, hint: Option<EventKind>, records: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            hint,
            records,
        }
    }

    /// Read an oracle answer: either `{"thinking": .., "events": [..]}` or a
    /// bare array of records
    pub fn from_json_str(
        query: impl Into<String>,
        hint: Option<EventKind>,
        json: &str,
    ) -> Result<Self, SerializationError> {
        let query = query.into();
        let value: Value = serde_json::from_str(json).map_err(|e| SerializationError::DeserializationFailed {
            reason: format!("batch '{}': {}", query, e),
        })?;

        let records = match value {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("events") {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(SerializationError::DeserializationFailed {
                        reason: format!("batch '{}': 'events' is not a list", query),
                    })
                }
            },
            _ => {
                return Err(SerializationError::DeserializationFailed {
                    reason: format!("batch '{}': expected an object or a list", query),
                })
            }
        };

        Ok(Self::new(query, hint, records))
    }
}

/// A typed event placed on the video timeline
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub start_time: f64,
    pub end_time: f64,
    pub event_type: EventKind,
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub event: LabEvent,
}

impl TimelineEvent {
    /// Resolve the event's timestamp and compute its display fields
    pub fn from_event(event: LabEvent) -> Result<Self, TimestampError> {
        let range = TimestampRange::parse(event.timestamp_range())?;
        let kind = event.kind();
        Ok(Self {
            start_time: range.start_seconds,
            end_time: range.end_seconds,
            event_type: kind,
            title: event.title(),
            description: event.description(),
            priority: kind.priority(),
            event,
        })
    }

    pub fn range(&self) -> TimestampRange {
        TimestampRange::new(self.start_time, self.end_time)
    }
}

/// Wire shape of a timeline entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimelineRecord {
    start_time: f64,
    end_time: f64,
    event_type: EventKind,
    title: String,
    description: String,
    priority: u8,
    event_model: Value,
    event_model_type: String,
}

impl Serialize for TimelineEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let event_model = self.event.to_model_value().map_err(S::Error::custom)?;
        TimelineRecord {
            start_time: self.start_time,
            end_time: self.end_time,
            event_type: self.event_type,
            title: self.title.clone(),
            description: self.description.clone(),
            priority: self.priority,
            event_model,
            event_model_type: self.event.kind().model_type().to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TimelineEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = TimelineRecord::deserialize(deserializer)?;
        let event = LabEvent::from_model_value(&record.event_model_type, record.event_model)
            .map_err(D::Error::custom)?;
        if event.kind() != record.event_type {
            return Err(D::Error::custom(format!(
                "event_type {} does not match model {}",
                record.event_type, record.event_model_type
            )));
        }
        Ok(Self {
            start_time: record.start_time,
            end_time: record.end_time,
            event_type: record.event_type,
            title: record.title,
            description: record.description,
            priority: record.priority,
            event,
        })
    }
}

/// Events that survived parsing, plus what was dropped and why
#[derive(Debug, Clone)]
pub struct TimelineBuild {
    pub events: Vec<TimelineEvent>,
    pub diagnostics: DiagnosticLog,
}

/// Order by start ascending, then priority descending. Stable.
pub fn sort_timeline(events: &mut [TimelineEvent]) {
    events.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then_with(|| b.priority.cmp(&a.priority))
    });
}

/// Merge oracle batches into one ordered timeline.
///
/// Records that cannot be parsed or whose timestamp is malformed are dropped
/// and reported; they never fail the whole build.
pub fn build_timeline(batches: &[EventBatch]) -> TimelineBuild {
    let mut diagnostics = DiagnosticLog::all();
    let mut events = Vec::new();

    for batch in batches {
        for (index, record) in batch.records.iter().enumerate() {
            match timeline_record(batch, index, record) {
                Ok(event) => events.push(event),
                Err(dropped) => diagnostics.record(dropped.diagnostic),
            }
        }
    }

    sort_timeline(&mut events);
    tracing::debug!(events = events.len(), dropped = diagnostics.len(), "timeline built");

    TimelineBuild { events, diagnostics }
}

/// Like [`build_timeline`], but the first record that would be dropped
/// fails the whole build
pub fn build_timeline_strict(batches: &[EventBatch]) -> Result<Vec<TimelineEvent>, PipetraceError> {
    let mut events = Vec::new();

    for batch in batches {
        for (index, record) in batch.records.iter().enumerate() {
            match timeline_record(batch, index, record) {
                Ok(event) => events.push(event),
                Err(dropped) => {
                    tracing::error!(query = %batch.query, index, "{}", dropped.diagnostic.message);
                    return Err(dropped.error);
                }
            }
        }
    }

    sort_timeline(&mut events);
    Ok(events)
}

/// A record that could not be placed on the timeline
struct DroppedRecord {
    diagnostic: Diagnostic,
    error: PipetraceError,
}

fn timeline_record(batch: &EventBatch, index: usize, record: &Value) -> Result<TimelineEvent, DroppedRecord> {
    let raw_range = record
        .get("timestamp_range")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let event = parse_record(record, batch.hint).map_err(|e| DroppedRecord {
        diagnostic: dropped(DiagnosticKind::Validation, &batch.query, index, raw_range, &e),
        error: e.into(),
    })?;

    TimelineEvent::from_event(event).map_err(|e| DroppedRecord {
        diagnostic: dropped(DiagnosticKind::MalformedTimestamp, &batch.query, index, raw_range, &e),
        error: e.into(),
    })
}

fn dropped(
    kind: DiagnosticKind,
    query: &str,
    index: usize,
    range: &str,
    error: &dyn std::fmt::Display,
) -> Diagnostic {
    Diagnostic::new(
        LogLevel::Warn,
        kind,
        format!("dropped record {} from '{}': {}", index, query, error),
    )
    .with_event(index, range)
}

/// Highest-priority event covering `seconds`; earliest start wins ties
pub fn active_event_at(events: &[TimelineEvent], seconds: f64) -> Option<&TimelineEvent> {
    events
        .iter()
        .filter(|e| e.range().contains(seconds))
        .min_by(|a, b| match b.priority.cmp(&a.priority) {
            Ordering::Equal => a.start_time.total_cmp(&b.start_time),
            other => other,
        })
}

/// Drop overlapping events so at most one is shown at a time.
///
/// Walks the timeline in order; an event replaces the kept events it
/// overlaps only when it outranks all of them. Result is sorted by start.
pub fn non_overlapping(events: &[TimelineEvent]) -> Vec<TimelineEvent> {
    let mut ordered = events.to_vec();
    sort_timeline(&mut ordered);

    let mut kept: Vec<TimelineEvent> = Vec::new();
    for event in ordered {
        let range = event.range();
        let outranks_all = kept
            .iter()
            .filter(|k| k.range().overlaps(&range))
            .all(|k| event.priority > k.priority);
        if outranks_all {
            kept.retain(|k| !k.range().overlaps(&range));
            kept.push(event);
        }
    }

    sort_timeline(&mut kept);
    kept
}

/// Number of events of each kind
pub fn event_counts(events: &[TimelineEvent]) -> BTreeMap<EventKind, usize> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(event.event_type).or_insert(0) += 1;
    }
    counts
}

/// The timeline artifact handed to presentation consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineDocument {
    pub procedure_context: Option<ProcedureContext>,
    pub total_events: usize,
    pub timeline: Vec<TimelineEvent>,
}

impl TimelineDocument {
    pub fn new(procedure_context: Option<ProcedureContext>, timeline: Vec<TimelineEvent>) -> Self {
        Self {
            procedure_context,
            total_events: timeline.len(),
            timeline,
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, SerializationError> {
        serde_json::to_string_pretty(self).map_err(|e| SerializationError::SerializationFailed {
            reason: format!("timeline document: {}", e),
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, SerializationError> {
        let document: TimelineDocument =
            serde_json::from_str(json).map_err(|e| SerializationError::DeserializationFailed {
                reason: format!("timeline document: {}", e),
            })?;
        if document.total_events != document.timeline.len() {
            return Err(SerializationError::DeserializationFailed {
                reason: format!(
                    "total_events is {} but timeline holds {} events",
                    document.total_events,
                    document.timeline.len()
                ),
            });
        }
        Ok(document)
    }

    /// Events in timeline order, ready for replay
    pub fn events(&self) -> &[TimelineEvent] {
        &self.timeline
    }
}
