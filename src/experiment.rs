//! The experiment aggregate and its derived metrics

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::StateError;
use crate::procedure::GoalWell;
use crate::types::{
    ContaminationLevel, ContaminationWarning, PipetteState, ReagentTransfer, VolumeDiscrepancy,
    WellContents, COMPLETION_TOLERANCE_UL,
};

/// Tolerance for the volume-conservation invariant checked by [`ExperimentState::validate`]
pub const VOLUME_INVARIANT_TOLERANCE_UL: f64 = 0.5;

/// Aggregate root for one experiment (one video).
///
/// Replay mutates it incrementally and never rolls it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub experiment_id: String,
    pub pipette: PipetteState,
    pub wells: BTreeMap<String, WellContents>,
    pub all_transfers: Vec<ReagentTransfer>,
    pub contamination_warnings: Vec<ContaminationWarning>,
    pub volume_discrepancies: Vec<VolumeDiscrepancy>,
    pub goal_wells: BTreeMap<String, GoalWell>,
    pub reagent_sources: Vec<String>,

    // Derived, recomputed after every mutation
    pub completion_percentage: f64,
    pub wells_completed: usize,
    pub total_wells: usize,
    pub contamination_risk_level: ContaminationLevel,
    pub critical_warnings: usize,

    /// Events applied over the lifetime of this state
    pub events_applied: usize,
    /// Latest event start seen so far, used to spot out-of-order input
    pub replayed_until_seconds: Option<f64>,
}

impl ExperimentState {
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            pipette: PipetteState::default(),
            wells: BTreeMap::new(),
            all_transfers: Vec::new(),
            contamination_warnings: Vec::new(),
            volume_discrepancies: Vec::new(),
            goal_wells: BTreeMap::new(),
            reagent_sources: Vec::new(),
            completion_percentage: 0.0,
            wells_completed: 0,
            total_wells: 0,
            contamination_risk_level: ContaminationLevel::Clean,
            critical_warnings: 0,
            events_applied: 0,
            replayed_until_seconds: None,
        }
    }

    /// Get a well, creating it on first use with any goal expectation attached
    pub fn well_mut(&mut self, well_id: &str) -> &mut WellContents {
        let expected = self.goal_wells.get(well_id).map(GoalWell::expected_volume_ul);
        self.wells.entry(well_id.to_string()).or_insert_with(|| {
            let mut well = WellContents::new(well_id);
            well.expected_volume_ul = expected;
            well
        })
    }

    /// Append a transfer and merge it into its destination well
    pub fn record_transfer(&mut self, transfer: ReagentTransfer) {
        self.well_mut(&transfer.destination_well).add_transfer(&transfer);
        self.all_transfers.push(transfer);
    }

    pub fn add_warning(&mut self, warning: ContaminationWarning) {
        self.contamination_warnings.push(warning);
    }

    pub fn add_volume_discrepancy(&mut self, discrepancy: VolumeDiscrepancy) {
        self.volume_discrepancies.push(discrepancy);
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<&ReagentTransfer> {
        self.all_transfers.iter().find(|t| t.transfer_id == transfer_id)
    }

    /// Transfers into a well, in the order they were applied
    pub fn transfers_for_well(&self, well_id: &str) -> Vec<&ReagentTransfer> {
        match self.wells.get(well_id) {
            Some(well) => well
                .transfer_history
                .iter()
                .filter_map(|id| self.transfer(id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Recompute completion, warning counts and overall risk from current fields
    pub fn refresh_derived(&mut self, completion_tolerance_ul: f64) {
        self.total_wells = if self.goal_wells.is_empty() {
            self.wells.len()
        } else {
            self.goal_wells.len()
        };

        self.wells_completed = self
            .wells
            .values()
            .filter(|w| self.goal_wells.is_empty() || self.goal_wells.contains_key(&w.well_id))
            .filter(|w| w.is_complete_within(completion_tolerance_ul))
            .count();

        self.completion_percentage = if self.total_wells > 0 {
            self.wells_completed as f64 / self.total_wells as f64 * 100.0
        } else {
            0.0
        };

        self.critical_warnings = self
            .contamination_warnings
            .iter()
            .filter(|w| w.is_critical())
            .count();

        self.contamination_risk_level = self
            .contamination_warnings
            .iter()
            .map(|w| w.severity.implied_contamination())
            .fold(ContaminationLevel::Clean, ContaminationLevel::max_of);
    }

    pub fn refresh_derived_default(&mut self) {
        self.refresh_derived(COMPLETION_TOLERANCE_UL);
    }

    /// Warnings with severity high or critical
    pub fn active_warnings(&self) -> Vec<&ContaminationWarning> {
        self.contamination_warnings
            .iter()
            .filter(|w| w.is_active())
            .collect()
    }

    /// Check the structural invariants that must hold after every mutation
    pub fn validate(&self) -> Result<(), StateError> {
        let mut by_id: HashMap<&str, &ReagentTransfer> = HashMap::with_capacity(self.all_transfers.len());
        for transfer in &self.all_transfers {
            by_id.insert(transfer.transfer_id.as_str(), transfer);
            if !self.wells.contains_key(&transfer.destination_well) {
                return Err(StateError::InvariantViolated {
                    reason: format!(
                        "transfer {} targets unknown well {}",
                        transfer.transfer_id, transfer.destination_well
                    ),
                });
            }
        }

        for (well_id, well) in &self.wells {
            if well_id != &well.well_id {
                return Err(StateError::InvariantViolated {
                    reason: format!("well key {} holds well {}", well_id, well.well_id),
                });
            }

            let reagent_sum: f64 = well.reagents.iter().map(|r| r.volume_ul).sum();
            if (reagent_sum - well.total_volume_ul).abs() > VOLUME_INVARIANT_TOLERANCE_UL {
                return Err(StateError::InvariantViolated {
                    reason: format!(
                        "well {} total {}µl differs from reagent sum {}µl",
                        well_id, well.total_volume_ul, reagent_sum
                    ),
                });
            }

            let transfer_sum: f64 = well
                .transfer_history
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|t| t.delivered_volume_ul())
                .sum();
            if (transfer_sum - well.total_volume_ul).abs() > VOLUME_INVARIANT_TOLERANCE_UL {
                return Err(StateError::InvariantViolated {
                    reason: format!(
                        "well {} total {}µl differs from transfer sum {}µl",
                        well_id, well.total_volume_ul, transfer_sum
                    ),
                });
            }
        }

        let critical = self.contamination_warnings.iter().filter(|w| w.is_critical()).count();
        if critical != self.critical_warnings {
            return Err(StateError::InvariantViolated {
                reason: format!(
                    "critical warning count {} but {} critical warnings recorded",
                    self.critical_warnings, critical
                ),
            });
        }

        Ok(())
    }
}
