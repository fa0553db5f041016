//! Pipetting transition rules
//!
//! One transition per event kind. A rule either applies completely or
//! returns an error without touching the state.

use crate::context::ReplayContext;
use crate::diagnostics::{DiagnosticKind, LogLevel};
use crate::error::StateError;
use crate::event::{
    AspirationEvent, DispensingEvent, LabEvent, PipetteSettingChange, TipChangeEvent, WarningEvent,
    WellStateEvent,
};
use crate::experiment::ExperimentState;
use crate::timeline::TimelineEvent;
use crate::traits::{TimedEvent, TransitionRules};
use crate::types::{
    ContaminationEvent, ContaminationLevel, ContaminationWarning, PipetteAction, Reagent,
    ReagentTransfer, Version, VolumeDiscrepancy, WarningSeverity, WarningType, WellAnnotation,
};

/// Probability attached to tip-history cross-contamination warnings
pub const CROSS_CONTAMINATION_PROBABILITY: f64 = 0.9;

/// Standard rules for manual pipetting videos
#[derive(Debug, Clone)]
pub struct PipettingRules {
    version: Version,
}

impl PipettingRules {
    pub fn new() -> Self {
        Self {
            version: Version::new(1, 0, 0),
        }
    }

    fn apply_setting(&self, state: &mut ExperimentState, event: &PipetteSettingChange) {
        state.pipette.volume_setting_ul = event.new_setting_ul;
    }

    fn apply_aspiration(
        &self,
        state: &mut ExperimentState,
        event: &AspirationEvent,
        at: f64,
        context: &mut ReplayContext,
    ) {
        if !state.pipette.tip_attached {
            attach_tip(state, context);
            context.note(
                LogLevel::Debug,
                DiagnosticKind::Advisory,
                format!("aspiration of {} without a recorded tip pickup; assuming a fresh tip", event.reagent_name),
            );
        }

        let pipette = &mut state.pipette;
        let volume = if event.volume_ul > 0.0 {
            event.volume_ul
        } else {
            pipette.volume_setting_ul
        };

        let held_other = {
            let held = pipette.reagents_in_tip();
            !held.is_empty() && !held.contains(&event.reagent_name.as_str())
        };
        if held_other {
            pipette.tip_contamination_level = pipette
                .tip_contamination_level
                .max_of(ContaminationLevel::Contaminated);
        }

        pipette.tip_contamination_history.push(ContaminationEvent {
            timestamp: at,
            contamination_source: event.reagent_name.clone(),
            contamination_level: pipette.tip_contamination_level,
            action_taken: Some(format!("aspirated from {}", event.source_container)),
        });
        pipette.last_reagent_aspirated = Some(Reagent::new(event.reagent_name.clone(), volume));
        pipette.source_container_id = Some(event.source_container.clone());
        pipette.last_action = PipetteAction::Aspirate;

        if !state.reagent_sources.contains(&event.reagent_name) && !state.goal_wells.is_empty() {
            context.note(
                LogLevel::Info,
                DiagnosticKind::Advisory,
                format!("{} is not one of the procedure's reagent sources", event.reagent_name),
            );
        }
    }

    fn apply_dispense(
        &self,
        state: &mut ExperimentState,
        event: &DispensingEvent,
        at: f64,
        context: &mut ReplayContext,
    ) -> Result<(), StateError> {
        let aspirated = match &state.pipette.last_reagent_aspirated {
            Some(reagent) => reagent.clone(),
            None => {
                return Err(StateError::InconsistentTransition {
                    timestamp_range: event.timestamp_range.clone(),
                    reason: format!(
                        "dispense of {} into {} with no aspirated reagent",
                        event.reagent.name, event.destination_well
                    ),
                })
            }
        };

        if !event.reagent.name.is_empty() && event.reagent.name != aspirated.name {
            context.note(
                LogLevel::Warn,
                DiagnosticKind::Advisory,
                format!(
                    "dispense reports {} but the tip holds {}; keeping {}",
                    event.reagent.name, aspirated.name, aspirated.name
                ),
            );
        }

        let config = context.config().clone();
        let pipette = &state.pipette;
        let intended = if pipette.volume_setting_ul > 0.0 {
            pipette.volume_setting_ul
        } else {
            aspirated.volume_ul
        };
        let actual = (event.volume_ul > 0.0).then_some(event.volume_ul);

        let tip_reagents: Vec<String> = pipette.reagents_in_tip().into_iter().map(str::to_string).collect();
        let cross_contaminated = tip_reagents.len() > 1;

        let mut transfer = ReagentTransfer {
            transfer_id: format!("transfer-{:04}", state.all_transfers.len() + 1),
            timestamp: at,
            recorded_at: context.time().at_offset(at),
            reagent: Reagent::new(aspirated.name.clone(), actual.unwrap_or(intended)),
            source_container: pipette
                .source_container_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            destination_well: event.destination_well.clone(),
            intended_volume_ul: intended,
            actual_volume_ul: actual,
            pipette_volume_setting: pipette.volume_setting_ul,
            tip_id: pipette.tip_id.clone(),
            tip_contamination_before: pipette.tip_contamination_level,
            tip_contamination_after: pipette.tip_contamination_level,
            observed_issues: Vec::new(),
        };
        if cross_contaminated {
            transfer
                .observed_issues
                .push(format!("tip carried {}", tip_reagents.join(", ")));
        }
        let discrepant = transfer.has_volume_discrepancy(config.discrepancy_threshold);
        if let (true, Some(error)) = (discrepant, transfer.relative_error()) {
            transfer
                .observed_issues
                .push(format!("dispensed volume off by {:.1}%", error * 100.0));
        }

        let well_id = transfer.destination_well.clone();
        state.record_transfer(transfer);

        if cross_contaminated {
            let well = state.well_mut(&well_id);
            for name in tip_reagents.iter().filter(|n| **n != aspirated.name) {
                well.add_contamination_source(name);
            }
            let warning = cross_contamination_warning(state, &tip_reagents, &well_id, at);
            state.add_warning(warning);
        }

        if discrepant {
            let id = format!("discrepancy-{:04}", state.volume_discrepancies.len() + 1);
            let discrepancy = VolumeDiscrepancy::new(id, at, well_id.clone(), intended, actual)
                .with_calculated_volume(intended)
                .derive_differences();
            state.add_volume_discrepancy(discrepancy);
        }

        state.pipette.last_reagent_aspirated = None;
        state.pipette.last_action = PipetteAction::Dispense;
        Ok(())
    }

    fn apply_tip_change(&self, state: &mut ExperimentState, event: &TipChangeEvent, context: &ReplayContext) {
        if event.ejected {
            eject_tip(state);
        }
        if event.new_tip_attached {
            attach_tip(state, context);
        }
    }

    fn apply_warning(
        &self,
        state: &mut ExperimentState,
        event: &WarningEvent,
        at: f64,
        context: &mut ReplayContext,
    ) {
        let severity = match event.severity.as_deref().map(str::parse::<WarningSeverity>) {
            Some(Ok(severity)) => severity,
            Some(Err(e)) => {
                context.note(LogLevel::Info, DiagnosticKind::Advisory, format!("{}; inferring severity", e));
                infer_severity(&event.warning_message)
            }
            None => infer_severity(&event.warning_message),
        };

        let description = if event.description.is_empty() {
            event.warning_message.clone()
        } else {
            event.description.clone()
        };

        let warning = ContaminationWarning {
            warning_id: next_warning_id(state),
            timestamp: at,
            warning_type: infer_warning_type(&event.warning_message),
            severity,
            contamination_source: state
                .pipette
                .tip_id
                .clone()
                .unwrap_or_else(|| "observation".to_string()),
            affected_containers: Vec::new(),
            contaminated_reagent: state.pipette.last_reagent_aspirated.as_ref().map(|r| r.name.clone()),
            description,
            recommended_action: "Review the flagged step".to_string(),
            contamination_probability: None,
        };
        state.add_warning(warning);
    }

    fn apply_well_state(
        &self,
        state: &mut ExperimentState,
        event: &WellStateEvent,
        at: f64,
        context: &mut ReplayContext,
    ) {
        let tolerance = context.config().completion_tolerance_ul;
        let reported_total: f64 = event.current_contents.iter().map(|r| r.volume_ul).sum();

        let well = state.well_mut(&event.well_id);
        let engine_total = well.total_volume_ul;
        let engine_complete = well.is_complete_within(tolerance);
        well.annotation = Some(WellAnnotation {
            timestamp: at,
            reported_complete: event.is_complete,
            reported_contents: event.current_contents.clone(),
            missing_reagents: event.missing_reagents.clone(),
        });

        if event.is_complete != engine_complete {
            context.note(
                LogLevel::Info,
                DiagnosticKind::Advisory,
                format!(
                    "oracle reports well {} as {} but transfers say {}",
                    event.well_id,
                    completeness(event.is_complete),
                    completeness(engine_complete)
                ),
            );
        }

        if reported_total > 0.0 && (reported_total - engine_total).abs() > tolerance {
            let id = format!("discrepancy-{:04}", state.volume_discrepancies.len() + 1);
            let discrepancy = VolumeDiscrepancy::new(id, at, event.well_id.clone(), engine_total, Some(reported_total))
                .with_calculated_volume(engine_total)
                .derive_differences();
            state.add_volume_discrepancy(discrepancy);
        }
    }
}

impl Default for PipettingRules {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionRules for PipettingRules {
    fn version(&self) -> Version {
        self.version.clone()
    }

    fn apply(
        &self,
        state: &mut ExperimentState,
        event: &TimelineEvent,
        context: &mut ReplayContext,
    ) -> Result<(), StateError> {
        event.event.validate().map_err(|e| StateError::InconsistentTransition {
            timestamp_range: event.event.timestamp_range().to_string(),
            reason: e.to_string(),
        })?;

        let at = event.start_time;
        match &event.event {
            LabEvent::PipetteSetting(e) => self.apply_setting(state, e),
            LabEvent::Aspiration(e) => self.apply_aspiration(state, e, at, context),
            LabEvent::Dispensing(e) => self.apply_dispense(state, e, at, context)?,
            LabEvent::TipChange(e) => self.apply_tip_change(state, e, context),
            LabEvent::Warning(e) => self.apply_warning(state, e, at, context),
            LabEvent::WellState(e) => self.apply_well_state(state, e, at, context),
        }
        Ok(())
    }
}

fn eject_tip(state: &mut ExperimentState) {
    let pipette = &mut state.pipette;
    pipette.tip_contamination_history.clear();
    pipette.tip_contamination_level = ContaminationLevel::Clean;
    pipette.tip_attached = false;
    pipette.tip_id = None;
    pipette.last_reagent_aspirated = None;
    pipette.source_container_id = None;
    pipette.last_action = PipetteAction::ChangeTip;
}

fn attach_tip(state: &mut ExperimentState, context: &ReplayContext) {
    let pipette = &mut state.pipette;
    pipette.tip_id = Some(context.random().tip_id(pipette.tips_issued));
    pipette.tips_issued += 1;
    pipette.tip_attached = true;
    pipette.last_action = PipetteAction::ChangeTip;
}

fn next_warning_id(state: &ExperimentState) -> String {
    format!("warning-{:04}", state.contamination_warnings.len() + 1)
}

/// Warning for a tip whose history since the last change holds several reagents
fn cross_contamination_warning(
    state: &ExperimentState,
    tip_reagents: &[String],
    well_id: &str,
    at: f64,
) -> ContaminationWarning {
    ContaminationWarning {
        warning_id: next_warning_id(state),
        timestamp: at,
        warning_type: WarningType::CrossContamination,
        severity: WarningSeverity::High,
        contamination_source: tip_reagents.first().cloned().unwrap_or_default(),
        affected_containers: vec![well_id.to_string()],
        contaminated_reagent: tip_reagents.last().cloned(),
        description: format!(
            "Cross-contamination risk: tip used with {} different reagents ({})",
            tip_reagents.len(),
            tip_reagents.join(", ")
        ),
        recommended_action: "Change pipette tip before dispensing".to_string(),
        contamination_probability: Some(CROSS_CONTAMINATION_PROBABILITY),
    }
}

fn infer_severity(message: &str) -> WarningSeverity {
    let lowered = message.to_lowercase();
    if lowered.contains("critical") {
        WarningSeverity::Critical
    } else if lowered.contains("contaminat") {
        WarningSeverity::High
    } else {
        WarningSeverity::Medium
    }
}

fn infer_warning_type(message: &str) -> WarningType {
    let lowered = message.to_lowercase();
    if lowered.contains("contaminat") {
        WarningType::CrossContamination
    } else if lowered.contains("volume") || lowered.contains("bubble") {
        WarningType::VolumeDiscrepancy
    } else if lowered.contains("calibrat") || lowered.contains("equipment") {
        WarningType::EquipmentIssue
    } else if lowered.contains("protocol") || lowered.contains("skipped") {
        WarningType::ProtocolDeviation
    } else {
        WarningType::TechniqueError
    }
}

fn completeness(complete: bool) -> &'static str {
    if complete {
        "complete"
    } else {
        "incomplete"
    }
}
