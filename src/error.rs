//! Error types for pipetrace

use thiserror::Error;
use crate::experiment::ExperimentState;

#[derive(Debug, Error)]
pub enum PipetraceError {
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimestampError {
    #[error("Malformed timestamp '{input}': {reason}")]
    MalformedTimestamp { input: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing required field '{field}' in {event_kind} event")]
    MissingField { event_kind: String, field: String },

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Unrecognized event shape: {reason}")]
    UnknownShape { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("Inconsistent state transition at {timestamp_range}: {reason}")]
    InconsistentTransition { timestamp_range: String, reason: String },

    #[error("Invariant violated: {reason}")]
    InvariantViolated { reason: String },

    #[error("Checkpoint mismatch: expected {expected}, got {actual}")]
    CheckpointMismatch { expected: String, actual: String },

    #[error("Checkpoint error: {reason}")]
    CheckpointError { reason: String },
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("Deserialization failed: {reason}")]
    DeserializationFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OracleError {
    #[error("Oracle unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Oracle returned an invalid response for '{query}': {reason}")]
    InvalidResponse { query: String, reason: String },
}

/// Failure that stops a strict-mode replay.
///
/// The state carried here reflects every event applied before the abort.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Replay aborted at event {event_index}: {cause}")]
    StrictAbort {
        event_index: usize,
        cause: String,
        state: Box<ExperimentState>,
    },
}

impl ReplayError {
    /// Partially replayed state at the point of the abort
    pub fn partial_state(&self) -> &ExperimentState {
        match self {
            ReplayError::StrictAbort { state, .. } => state,
        }
    }

    /// Consume the error and take the partially replayed state
    pub fn into_partial_state(self) -> ExperimentState {
        match self {
            ReplayError::StrictAbort { state, .. } => *state,
        }
    }
}
