//! Core traits for pipetrace

use crate::error::{StateError, ValidationError};
use crate::event::EventKind;
use crate::experiment::ExperimentState;
use crate::context::ReplayContext;
use crate::timeline::TimelineEvent;
use crate::types::Version;

/// Capabilities shared by every oracle event variant
pub trait TimedEvent {
    /// Raw `"M:SS"` / `"M:SS - M:SS"` range as reported by the oracle
    fn timestamp_range(&self) -> &str;

    /// Free-text reasoning the oracle attached to the event
    fn rationale(&self) -> &str;

    /// Timeline tag of this variant
    fn kind(&self) -> EventKind;

    /// Check the payload for completeness
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Transition rules folded over an ordered timeline
pub trait TransitionRules {
    /// Version of these rules, recorded in every replay trace
    fn version(&self) -> Version;

    /// Apply one event to the state.
    ///
    /// Returning an error means the event was skipped; the state must not
    /// have been touched in that case.
    fn apply(
        &self,
        state: &mut ExperimentState,
        event: &TimelineEvent,
        context: &mut ReplayContext,
    ) -> Result<(), StateError>;
}
