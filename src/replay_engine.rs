//! Replay engine: folds an ordered timeline into experiment state

use chrono::{DateTime, Utc};

use crate::config::ReplayConfig;
use crate::context::ReplayContext;
use crate::diagnostics::{DiagnosticKind, DiagnosticLog, LogLevel, ReplayTrace, TransitionOutcome, TransitionRecord};
use crate::error::{PipetraceError, ReplayError, StateError};
use crate::event::LabEvent;
use crate::experiment::ExperimentState;
use crate::hasher::StateHasher;
use crate::procedure::ProcedureContext;
use crate::rules::PipettingRules;
use crate::timeline::{build_timeline, build_timeline_strict, EventBatch, TimelineBuild, TimelineEvent};
use crate::traits::{TimedEvent, TransitionRules};
use crate::types::{ContaminationWarning, StateHash, WarningSeverity, WarningType};

/// Result of one replay run
#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub final_state: ExperimentState,
    /// Present when transition hashing is enabled
    pub final_hash: Option<StateHash>,
    pub diagnostics: DiagnosticLog,
    pub trace: ReplayTrace,
}

/// What replaying into an existing state reports back
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub final_hash: Option<StateHash>,
    pub diagnostics: DiagnosticLog,
    pub trace: ReplayTrace,
}

/// Output of one processing round
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub state: ExperimentState,
    pub timeline: Vec<TimelineEvent>,
    /// Timeline and replay diagnostics, in that order
    pub diagnostics: DiagnosticLog,
    pub trace: ReplayTrace,
}

/// Deterministic replay engine
#[derive(Debug, Clone)]
pub struct ReplayEngine<R: TransitionRules = PipettingRules> {
    rules: R,
    config: ReplayConfig,
    video_started_at: Option<DateTime<Utc>>,
    hasher: StateHasher,
}

impl ReplayEngine<PipettingRules> {
    pub fn new(config: ReplayConfig) -> Self {
        Self::with_rules(PipettingRules::new(), config)
    }

    pub fn builder() -> ReplayEngineBuilder<PipettingRules> {
        ReplayEngineBuilder::new()
    }
}

impl Default for ReplayEngine<PipettingRules> {
    fn default() -> Self {
        Self::new(ReplayConfig::default())
    }
}

impl<R: TransitionRules> ReplayEngine<R> {
    pub fn with_rules(rules: R, config: ReplayConfig) -> Self {
        Self {
            rules,
            config,
            video_started_at: None,
            hasher: StateHasher::new(),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// Replay `events` on top of `initial_state` and return the new state
    pub fn replay(
        &self,
        initial_state: ExperimentState,
        events: &[TimelineEvent],
    ) -> Result<ReplayResult, ReplayError> {
        let mut state = initial_state;
        let report = self.replay_into(&mut state, events)?;
        Ok(ReplayResult {
            final_state: state,
            final_hash: report.final_hash,
            diagnostics: report.diagnostics,
            trace: report.trace,
        })
    }

    /// Replay `events` into `state` in place.
    ///
    /// Events are applied in start-time order. In lenient mode a rejected
    /// event is skipped and recorded as a low-severity warning; in strict
    /// mode the first rejection (or broken invariant) aborts, and the error
    /// carries every event applied up to that point.
    pub fn replay_into(
        &self,
        state: &mut ExperimentState,
        events: &[TimelineEvent],
    ) -> Result<ReplayReport, ReplayError> {
        let mut ordered: Vec<&TimelineEvent> = events.iter().collect();
        ordered.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        let mut context = self.context();
        let mut trace = ReplayTrace::new(self.rules.version());
        let tolerance = self.config.completion_tolerance_ul;

        if state.events_applied == 0 && state.pipette.volume_setting_ul <= 0.0 {
            state.pipette.volume_setting_ul = self.config.default_volume_setting_ul;
        }

        tracing::debug!(
            experiment = %state.experiment_id,
            events = ordered.len(),
            strict = self.config.strict,
            "replay started"
        );

        for (index, event) in ordered.into_iter().enumerate() {
            context.set_current_event(index, event.event.timestamp_range());

            if let Some(until) = state.replayed_until_seconds {
                if event.start_time < until {
                    context.note(
                        LogLevel::Warn,
                        DiagnosticKind::OutOfOrder,
                        format!(
                            "{} at {}s arrives after replay reached {}s",
                            event.event_type, event.start_time, until
                        ),
                    );
                }
            }

            let hash_before = self.hash_if_enabled(state, &mut context);

            let outcome = match self.rules.apply(state, event, &mut context) {
                Ok(()) => {
                    state.events_applied += 1;
                    TransitionOutcome::Applied
                }
                Err(e) => {
                    context.note(LogLevel::Error, DiagnosticKind::InconsistentTransition, e.to_string());
                    if self.config.strict {
                        return Err(ReplayError::StrictAbort {
                            event_index: index,
                            cause: e.to_string(),
                            state: Box::new(state.clone()),
                        });
                    }
                    record_skip(state, event, &e);
                    TransitionOutcome::Skipped
                }
            };

            let until = state.replayed_until_seconds.unwrap_or(f64::NEG_INFINITY);
            state.replayed_until_seconds = Some(until.max(event.start_time));
            state.refresh_derived(tolerance);

            if self.config.strict {
                if let Err(e) = state.validate() {
                    context.note(LogLevel::Error, DiagnosticKind::InconsistentTransition, e.to_string());
                    return Err(ReplayError::StrictAbort {
                        event_index: index,
                        cause: e.to_string(),
                        state: Box::new(state.clone()),
                    });
                }
            }

            let hash_after = self.hash_if_enabled(state, &mut context);
            trace.push(TransitionRecord {
                event_index: index,
                kind: event.event_type,
                start_time: event.start_time,
                outcome,
                state_hash_before: hash_before,
                state_hash_after: hash_after,
            });
        }
        context.clear_current_event();

        // An empty timeline still leaves derived fields consistent
        state.refresh_derived(tolerance);
        let final_hash = self.hash_if_enabled(state, &mut context);

        tracing::debug!(
            applied = trace.events_applied,
            skipped = trace.events_skipped,
            completion = state.completion_percentage,
            "replay finished"
        );

        Ok(ReplayReport {
            final_hash,
            diagnostics: context.take_diagnostics(),
            trace,
        })
    }

    /// One processing round: seed the procedure (if given), build the
    /// timeline from this round's batches and replay it onto `state`
    pub fn process_round(
        &self,
        mut state: ExperimentState,
        procedure: Option<&ProcedureContext>,
        batches: &[EventBatch],
    ) -> Result<RoundResult, PipetraceError> {
        if let Some(procedure) = procedure {
            procedure.apply_to(&mut state, self.config.completion_tolerance_ul)?;
        }

        let build = if self.config.strict {
            TimelineBuild {
                events: build_timeline_strict(batches)?,
                diagnostics: DiagnosticLog::all(),
            }
        } else {
            build_timeline(batches)
        };
        let mut diagnostics = DiagnosticLog::new(self.config.min_diagnostic_level);
        diagnostics.extend(build.diagnostics);

        let report = self.replay_into(&mut state, &build.events)?;
        diagnostics.extend(report.diagnostics);

        Ok(RoundResult {
            state,
            timeline: build.events,
            diagnostics,
            trace: report.trace,
        })
    }

    fn context(&self) -> ReplayContext {
        let builder = ReplayContext::builder().with_config(self.config.clone());
        match self.video_started_at {
            Some(start) => builder.with_video_start(start).build(),
            None => builder.build(),
        }
    }

    fn hash_if_enabled(&self, state: &ExperimentState, context: &mut ReplayContext) -> Option<StateHash> {
        if !self.config.hash_transitions {
            return None;
        }
        match self.hasher.hash(state) {
            Ok(hash) => Some(hash),
            Err(e) => {
                context.note(LogLevel::Warn, DiagnosticKind::Advisory, format!("state hash unavailable: {}", e));
                None
            }
        }
    }
}

/// Keep a skipped event visible in the state itself
fn record_skip(state: &mut ExperimentState, event: &TimelineEvent, error: &StateError) {
    let affected_containers = match &event.event {
        LabEvent::Dispensing(e) => vec![e.destination_well.clone()],
        _ => Vec::new(),
    };
    let warning = ContaminationWarning {
        warning_id: format!("warning-{:04}", state.contamination_warnings.len() + 1),
        timestamp: event.start_time,
        warning_type: WarningType::TechniqueError,
        severity: WarningSeverity::Low,
        contamination_source: "replay".to_string(),
        affected_containers,
        contaminated_reagent: None,
        description: error.to_string(),
        recommended_action: format!(
            "Check the video around {} for a missed step",
            event.event.timestamp_range()
        ),
        contamination_probability: None,
    };
    state.add_warning(warning);
}

/// Builder for [`ReplayEngine`]
pub struct ReplayEngineBuilder<R: TransitionRules> {
    rules: R,
    config: ReplayConfig,
    video_started_at: Option<DateTime<Utc>>,
}

impl ReplayEngineBuilder<PipettingRules> {
    pub fn new() -> Self {
        Self {
            rules: PipettingRules::new(),
            config: ReplayConfig::default(),
            video_started_at: None,
        }
    }
}

impl Default for ReplayEngineBuilder<PipettingRules> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: TransitionRules> ReplayEngineBuilder<R> {
    /// Swap in a different rule set
    pub fn with_rules<R2: TransitionRules>(self, rules: R2) -> ReplayEngineBuilder<R2> {
        ReplayEngineBuilder {
            rules,
            config: self.config,
            video_started_at: self.video_started_at,
        }
    }

    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn with_hash_transitions(mut self, enabled: bool) -> Self {
        self.config.hash_transitions = enabled;
        self
    }

    /// Wall-clock time the video started, used to stamp transfers
    pub fn with_video_start(mut self, started_at: DateTime<Utc>) -> Self {
        self.video_started_at = Some(started_at);
        self
    }

    pub fn build(self) -> Result<ReplayEngine<R>, PipetraceError> {
        self.config.validate()?;
        Ok(ReplayEngine {
            rules: self.rules,
            config: self.config,
            video_started_at: self.video_started_at,
            hasher: StateHasher::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AspirationEvent, DispensingEvent, TipChangeEvent};
    use crate::types::{ContaminationLevel, Reagent};

    fn event(e: LabEvent) -> TimelineEvent {
        TimelineEvent::from_event(e).unwrap()
    }

    fn aspirate(ts: &str, reagent: &str) -> TimelineEvent {
        event(LabEvent::Aspiration(AspirationEvent {
            thinking: String::new(),
            timestamp_range: ts.to_string(),
            reagent_name: reagent.to_string(),
            volume_ul: 30.0,
            source_container: format!("TUBE-{}", reagent),
        }))
    }

    fn dispense(ts: &str, reagent: &str, well: &str) -> TimelineEvent {
        event(LabEvent::Dispensing(DispensingEvent {
            thinking: String::new(),
            timestamp_range: ts.to_string(),
            reagent: Reagent::new(reagent, 30.0),
            volume_ul: 0.0,
            destination_well: well.to_string(),
        }))
    }

    fn eject(ts: &str) -> TimelineEvent {
        event(LabEvent::TipChange(TipChangeEvent {
            thinking: String::new(),
            timestamp_range: ts.to_string(),
            ejected: true,
            new_tip_attached: false,
        }))
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let mut config = ReplayConfig::default();
        config.completion_tolerance_ul = 0.0;
        assert!(ReplayEngine::builder().with_config(config).build().is_err());
    }

    #[test]
    fn test_lenient_skip_records_warning() {
        let engine = ReplayEngine::default();
        let result = engine
            .replay(ExperimentState::new("exp"), &[dispense("0:02", "A", "A1")])
            .unwrap();

        assert_eq!(result.trace.events_skipped, 1);
        assert!(result.final_state.wells.is_empty());
        assert_eq!(result.final_state.contamination_warnings.len(), 1);
        assert_eq!(
            result.final_state.contamination_warnings[0].severity,
            WarningSeverity::Low
        );
        assert_eq!(result.diagnostics.count_kind(DiagnosticKind::InconsistentTransition), 1);
    }

    #[test]
    fn test_strict_abort_keeps_applied_events() {
        let engine = ReplayEngine::builder().strict(true).build().unwrap();
        let events = [aspirate("0:01", "A"), dispense("0:02", "A", "A1"), dispense("0:03", "A", "A2")];

        let err = engine.replay(ExperimentState::new("exp"), &events).unwrap_err();
        match &err {
            ReplayError::StrictAbort { event_index, .. } => assert_eq!(*event_index, 2),
        }
        let partial = err.into_partial_state();
        assert_eq!(partial.wells["A1"].total_volume_ul, 30.0);
        assert!(!partial.wells.contains_key("A2"));
        assert!(partial.contamination_warnings.is_empty());
    }

    #[test]
    fn test_out_of_order_across_rounds() {
        let engine = ReplayEngine::default();
        let first = engine
            .replay(ExperimentState::new("exp"), &[aspirate("0:10", "A")])
            .unwrap();
        let second = engine
            .replay(first.final_state, &[eject("0:05")])
            .unwrap();

        assert_eq!(second.diagnostics.count_kind(DiagnosticKind::OutOfOrder), 1);
        assert_eq!(second.final_state.events_applied, 2);
        assert_eq!(second.final_state.replayed_until_seconds, Some(10.0));
        assert_eq!(second.final_state.pipette.tip_contamination_level, ContaminationLevel::Clean);
    }

    #[test]
    fn test_hashes_recorded_when_enabled() {
        let engine = ReplayEngine::builder().with_hash_transitions(true).build().unwrap();
        let result = engine
            .replay(ExperimentState::new("exp"), &[aspirate("0:01", "A"), dispense("0:02", "A", "A1")])
            .unwrap();

        let last = &result.trace.transitions[1];
        assert!(last.state_hash_before.is_some());
        assert_ne!(last.state_hash_before, last.state_hash_after);
        assert_eq!(result.final_hash, last.state_hash_after);
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        let engine = ReplayEngine::default();
        let result = engine
            .replay(ExperimentState::new("exp"), &[dispense("0:02", "A", "A1"), aspirate("0:01", "A")])
            .unwrap();

        assert_eq!(result.trace.events_skipped, 0);
        assert_eq!(result.final_state.wells["A1"].total_volume_ul, 30.0);
    }
}
