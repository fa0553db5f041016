//! Interface to the external event-extraction model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OracleError;
use crate::event::EventKind;
use crate::procedure::ProcedureContext;
use crate::timeline::EventBatch;

/// Opaque handle on the footage a query runs against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoContext {
    pub video_id: String,
    pub duration_seconds: f64,
    /// Frames or clip references understood by the oracle only
    #[serde(default)]
    pub frame_refs: Vec<String>,
}

impl VideoContext {
    pub fn new(video_id: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            video_id: video_id.into(),
            duration_seconds,
            frame_refs: Vec::new(),
        }
    }
}

/// A model that answers a prompt with untyped event records.
///
/// Implementations block until the whole answer is available. Retries and
/// timeouts belong to the implementation, not to callers in this crate.
pub trait Oracle {
    fn query(&self, prompt: &str, context: &VideoContext) -> Result<Vec<Value>, OracleError>;
}

impl<O: Oracle + ?Sized> Oracle for &O {
    fn query(&self, prompt: &str, context: &VideoContext) -> Result<Vec<Value>, OracleError> {
        (**self).query(prompt, context)
    }
}

/// The standard single-purpose queries, one per event family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventQuery {
    VolumeChanges,
    Aspirations,
    Dispensing,
    TipChanges,
    Warnings,
    WellStates,
    Procedure,
}

impl EventQuery {
    /// Event queries in the order a full pass runs them
    pub const EVENTS: [EventQuery; 6] = [
        EventQuery::VolumeChanges,
        EventQuery::Aspirations,
        EventQuery::Dispensing,
        EventQuery::TipChanges,
        EventQuery::Warnings,
        EventQuery::WellStates,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventQuery::VolumeChanges => "volume_changes",
            EventQuery::Aspirations => "aspirations",
            EventQuery::Dispensing => "dispensing",
            EventQuery::TipChanges => "tip_changes",
            EventQuery::Warnings => "warnings",
            EventQuery::WellStates => "well_states",
            EventQuery::Procedure => "procedure",
        }
    }

    /// Event kind the answers should be read as. `None` for the procedure query.
    pub fn hint(&self) -> Option<EventKind> {
        match self {
            EventQuery::VolumeChanges => Some(EventKind::PipetteSetting),
            EventQuery::Aspirations => Some(EventKind::Aspiration),
            EventQuery::Dispensing => Some(EventKind::Dispensing),
            EventQuery::TipChanges => Some(EventKind::TipChange),
            EventQuery::Warnings => Some(EventKind::Warning),
            EventQuery::WellStates => Some(EventKind::WellState),
            EventQuery::Procedure => None,
        }
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            EventQuery::VolumeChanges => {
                "List every moment the pipette volume setting changes: the dial being turned or \
                 the display showing a new value. For each, give the timestamp range, the new \
                 setting in microliters and the previous setting if visible."
            }
            EventQuery::Aspirations => {
                "List every aspiration: the tip entering a source container and liquid drawn up. \
                 For each, give the timestamp range, the source container, the reagent from its \
                 label and the approximate volume in microliters."
            }
            EventQuery::Dispensing => {
                "List every dispense into a plate well: the tip entering the well and liquid \
                 expelled. For each, give the timestamp range, the well position (A1, B2, ...) \
                 and the approximate volume in microliters."
            }
            EventQuery::TipChanges => {
                "List every tip ejection or pickup. For each, give the timestamp range, whether \
                 the old tip was ejected and whether a new tip was attached."
            }
            EventQuery::Warnings => {
                "List every procedural problem: reused tips, touched surfaces, wrong wells, \
                 spills or visible volume errors. For each, give the timestamp range, a short \
                 warning message and a severity of low, medium, high or critical."
            }
            EventQuery::WellStates => {
                "Report the state of each plate well whenever it changes: its contents with \
                 volumes, whether it looks complete and which reagents are still missing."
            }
            EventQuery::Procedure => {
                "Describe the protocol being followed: the reagent source containers and, for \
                 each target well, the reagents and volumes it should end up with."
            }
        }
    }
}

/// Run each event query and wrap its answer as a batch.
///
/// The first upstream failure is returned as is. `EventQuery::Procedure`
/// produces no events and is skipped here; see [`query_procedure`].
pub fn collect_batches<O: Oracle>(
    oracle: &O,
    context: &VideoContext,
    queries: &[EventQuery],
) -> Result<Vec<EventBatch>, OracleError> {
    let mut batches = Vec::with_capacity(queries.len());

    for query in queries {
        let Some(hint) = query.hint() else {
            tracing::debug!(query = query.name(), "skipping non-event query");
            continue;
        };

        let records = oracle.query(query.prompt(), context).map_err(|e| {
            tracing::error!(query = query.name(), error = %e, "oracle query failed");
            e
        })?;
        tracing::info!(query = query.name(), records = records.len(), "oracle batch received");
        batches.push(EventBatch::new(query.name(), Some(hint), records));
    }

    Ok(batches)
}

/// Ask for the protocol and read the first record as a procedure context
pub fn query_procedure<O: Oracle>(oracle: &O, context: &VideoContext) -> Result<ProcedureContext, OracleError> {
    let query = EventQuery::Procedure;
    let records = oracle.query(query.prompt(), context)?;
    let first = records.into_iter().next().ok_or_else(|| OracleError::InvalidResponse {
        query: query.name().to_string(),
        reason: "empty answer".to_string(),
    })?;

    let procedure: ProcedureContext = serde_json::from_value(first).map_err(|e| OracleError::InvalidResponse {
        query: query.name().to_string(),
        reason: e.to_string(),
    })?;
    procedure.validate().map_err(|e| OracleError::InvalidResponse {
        query: query.name().to_string(),
        reason: e.to_string(),
    })?;
    Ok(procedure)
}
