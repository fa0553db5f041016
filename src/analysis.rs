//! Read-only queries over a replayed experiment

use serde::{Deserialize, Serialize};

use crate::config::ReplayConfig;
use crate::experiment::ExperimentState;
use crate::types::{
    ContaminationLevel, ContaminationWarning, PipetteAction, ReagentTransfer, VolumeDiscrepancy,
    WarningSeverity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRisk {
    Low,
    High,
}

/// One transfer made with a non-clean tip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub transfer_id: String,
    pub destination: String,
    pub contamination_before: ContaminationLevel,
    pub contamination_after: ContaminationLevel,
    pub timestamp: f64,
}

/// Wells a reagent may have carried contamination into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationChain {
    pub reagent: String,
    /// Distinct wells, in first-contact order
    pub affected_wells: Vec<String>,
    pub chain_events: Vec<ChainLink>,
    pub risk_level: ChainRisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityGrade {
    pub fn from_accuracy_rate(rate: f64) -> Self {
        if rate >= 0.95 {
            QualityGrade::Excellent
        } else if rate >= 0.90 {
            QualityGrade::Good
        } else if rate >= 0.80 {
            QualityGrade::Fair
        } else {
            QualityGrade::Poor
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub total_transfers: usize,
    pub accurate_transfers: usize,
    /// Accurate transfers over all transfers, including unobserved ones
    pub accuracy_rate: f64,
    /// Mean relative error over transfers with an observed volume
    pub average_volume_error: f64,
    pub quality_grade: QualityGrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolDeviation {
    IncompleteWell {
        well_id: String,
        expected_volume_ul: f64,
        actual_volume_ul: f64,
        deviation_ul: f64,
    },
    /// A goal well that never received a transfer
    UntouchedGoalWell {
        well_id: String,
        expected_volume_ul: f64,
    },
    VolumeDiscrepancy {
        container_id: String,
        relative_difference_percent: f64,
        severity: WarningSeverity,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TipChangeRecommendation {
    /// The tip currently attached should be replaced
    CurrentTip {
        tip_id: Option<String>,
        contamination_level: ContaminationLevel,
        contamination_events: usize,
    },
    /// A tip that was used with more than one reagent
    ReusedTip {
        tip_id: String,
        reagents_contacted: Vec<String>,
        transfers: usize,
    },
}

/// Flat snapshot for a real-time overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HudSummary {
    pub experiment_id: String,
    pub completion_percentage: f64,
    pub wells_completed: usize,
    pub total_wells: usize,
    pub pipette_volume_ul: f64,
    pub pipette_reagent: Option<String>,
    pub tip_attached: bool,
    pub tip_status: ContaminationLevel,
    pub active_warnings: usize,
    pub contamination_risk: ContaminationLevel,
    pub last_action: PipetteAction,
    pub total_transfers: usize,
}

impl HudSummary {
    /// `"completed/total"` as shown on the overlay
    pub fn completion_label(&self) -> String {
        format!("{}/{}", self.wells_completed, self.total_wells)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub percentage: f64,
    pub wells_completed: usize,
    pub total_wells: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationAnalysis {
    pub risk_level: ContaminationLevel,
    pub total_warnings: usize,
    pub critical_warnings: usize,
    /// Warnings of medium severity or above
    pub contamination_events: Vec<ContaminationWarning>,
}

/// Everything the analyzer knows about an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub experiment_id: String,
    pub completion_status: CompletionStatus,
    pub quality_metrics: AccuracyReport,
    pub contamination_analysis: ContaminationAnalysis,
    pub protocol_deviations: Vec<ProtocolDeviation>,
    pub tip_management: Vec<TipChangeRecommendation>,
    pub hud_summary: HudSummary,
}

/// Query layer over a finished [`ExperimentState`]. Never mutates it.
pub struct ExperimentAnalyzer<'a> {
    state: &'a ExperimentState,
    completion_tolerance_ul: f64,
    accuracy_tolerance: f64,
    deviation_threshold_percent: f64,
}

impl<'a> ExperimentAnalyzer<'a> {
    pub fn new(state: &'a ExperimentState) -> Self {
        Self::with_config(state, &ReplayConfig::default())
    }

    pub fn with_config(state: &'a ExperimentState, config: &ReplayConfig) -> Self {
        Self {
            state,
            completion_tolerance_ul: config.completion_tolerance_ul,
            accuracy_tolerance: config.accuracy_tolerance,
            deviation_threshold_percent: config.deviation_threshold_percent,
        }
    }

    /// Warnings at or above `min_severity`, ordered low to critical
    pub fn find_contamination_events(&self, min_severity: WarningSeverity) -> Vec<&'a ContaminationWarning> {
        let mut found: Vec<&ContaminationWarning> = self
            .state
            .contamination_warnings
            .iter()
            .filter(|w| w.severity.at_least(min_severity))
            .collect();
        found.sort_by_key(|w| w.severity.rank());
        found
    }

    pub fn find_volume_discrepancies_by_well(&self, well_id: &str) -> Vec<&'a VolumeDiscrepancy> {
        self.state
            .volume_discrepancies
            .iter()
            .filter(|d| d.container_id == well_id)
            .collect()
    }

    pub fn find_transfers_by_reagent(&self, reagent_name: &str) -> Vec<&'a ReagentTransfer> {
        self.state
            .all_transfers
            .iter()
            .filter(|t| t.reagent.name == reagent_name)
            .collect()
    }

    /// Follow a reagent's transfers made with a non-clean tip
    pub fn trace_cross_contamination_chain(&self, reagent_name: &str) -> ContaminationChain {
        let mut affected_wells: Vec<String> = Vec::new();
        let mut chain_events = Vec::new();

        for transfer in self.find_transfers_by_reagent(reagent_name) {
            if transfer.tip_contamination_before.is_clean() && transfer.tip_contamination_after.is_clean() {
                continue;
            }
            if !affected_wells.contains(&transfer.destination_well) {
                affected_wells.push(transfer.destination_well.clone());
            }
            chain_events.push(ChainLink {
                transfer_id: transfer.transfer_id.clone(),
                destination: transfer.destination_well.clone(),
                contamination_before: transfer.tip_contamination_before,
                contamination_after: transfer.tip_contamination_after,
                timestamp: transfer.timestamp,
            });
        }

        let risk_level = if affected_wells.len() > 1 {
            ChainRisk::High
        } else {
            ChainRisk::Low
        };

        ContaminationChain {
            reagent: reagent_name.to_string(),
            affected_wells,
            chain_events,
            risk_level,
        }
    }

    pub fn analyze_pipetting_accuracy(&self) -> AccuracyReport {
        let transfers = &self.state.all_transfers;
        let errors: Vec<f64> = transfers.iter().filter_map(ReagentTransfer::relative_error).collect();
        let accurate_transfers = errors.iter().filter(|e| **e <= self.accuracy_tolerance).count();

        let accuracy_rate = if transfers.is_empty() {
            0.0
        } else {
            accurate_transfers as f64 / transfers.len() as f64
        };
        let average_volume_error = if errors.is_empty() {
            0.0
        } else {
            errors.iter().sum::<f64>() / errors.len() as f64
        };

        AccuracyReport {
            total_transfers: transfers.len(),
            accurate_transfers,
            accuracy_rate,
            average_volume_error,
            quality_grade: QualityGrade::from_accuracy_rate(accuracy_rate),
        }
    }

    pub fn find_protocol_deviations(&self) -> Vec<ProtocolDeviation> {
        let mut deviations = Vec::new();

        for (well_id, well) in &self.state.wells {
            if let Some(expected) = well.expected_volume_ul {
                if !well.is_complete_within(self.completion_tolerance_ul) {
                    deviations.push(ProtocolDeviation::IncompleteWell {
                        well_id: well_id.clone(),
                        expected_volume_ul: expected,
                        actual_volume_ul: well.total_volume_ul,
                        deviation_ul: (well.total_volume_ul - expected).abs(),
                    });
                }
            }
        }

        for (well_id, goal) in &self.state.goal_wells {
            if !self.state.wells.contains_key(well_id) {
                deviations.push(ProtocolDeviation::UntouchedGoalWell {
                    well_id: well_id.clone(),
                    expected_volume_ul: goal.expected_volume_ul(),
                });
            }
        }

        for discrepancy in &self.state.volume_discrepancies {
            if let Some(percent) = discrepancy.relative_difference_percent {
                if percent > self.deviation_threshold_percent {
                    deviations.push(ProtocolDeviation::VolumeDiscrepancy {
                        container_id: discrepancy.container_id.clone(),
                        relative_difference_percent: percent,
                        severity: discrepancy.severity,
                    });
                }
            }
        }

        deviations
    }

    pub fn find_tip_changes_needed(&self) -> Vec<TipChangeRecommendation> {
        let mut recommendations = Vec::new();
        let pipette = &self.state.pipette;

        if pipette.requires_tip_change() {
            recommendations.push(TipChangeRecommendation::CurrentTip {
                tip_id: pipette.tip_id.clone(),
                contamination_level: pipette.tip_contamination_level,
                contamination_events: pipette.tip_contamination_history.len(),
            });
        }

        // (tip id, reagents in first-use order, transfer count)
        let mut usage: Vec<(&str, Vec<String>, usize)> = Vec::new();
        for transfer in &self.state.all_transfers {
            let Some(tip_id) = transfer.tip_id.as_deref() else {
                continue;
            };
            let index = match usage.iter().position(|(id, _, _)| *id == tip_id) {
                Some(index) => index,
                None => {
                    usage.push((tip_id, Vec::new(), 0));
                    usage.len() - 1
                }
            };
            let entry = &mut usage[index];
            if !entry.1.contains(&transfer.reagent.name) {
                entry.1.push(transfer.reagent.name.clone());
            }
            entry.2 += 1;
        }

        for (tip_id, reagents, transfers) in usage {
            if reagents.len() > 1 {
                recommendations.push(TipChangeRecommendation::ReusedTip {
                    tip_id: tip_id.to_string(),
                    reagents_contacted: reagents,
                    transfers,
                });
            }
        }

        recommendations
    }

    /// Warnings with severity high or critical
    pub fn active_warnings(&self) -> Vec<&'a ContaminationWarning> {
        self.state.active_warnings()
    }

    pub fn get_hud_summary(&self) -> HudSummary {
        let state = self.state;
        HudSummary {
            experiment_id: state.experiment_id.clone(),
            completion_percentage: state.completion_percentage,
            wells_completed: state.wells_completed,
            total_wells: state.total_wells,
            pipette_volume_ul: state.pipette.volume_setting_ul,
            pipette_reagent: state.pipette.last_reagent_aspirated.as_ref().map(|r| r.name.clone()),
            tip_attached: state.pipette.tip_attached,
            tip_status: state.pipette.tip_contamination_level,
            active_warnings: state.active_warnings().len(),
            contamination_risk: state.contamination_risk_level,
            last_action: state.pipette.last_action,
            total_transfers: state.all_transfers.len(),
        }
    }

    pub fn generate_report(&self) -> ExperimentReport {
        let state = self.state;
        ExperimentReport {
            experiment_id: state.experiment_id.clone(),
            completion_status: CompletionStatus {
                percentage: state.completion_percentage,
                wells_completed: state.wells_completed,
                total_wells: state.total_wells,
            },
            quality_metrics: self.analyze_pipetting_accuracy(),
            contamination_analysis: ContaminationAnalysis {
                risk_level: state.contamination_risk_level,
                total_warnings: state.contamination_warnings.len(),
                critical_warnings: state.critical_warnings,
                contamination_events: self
                    .find_contamination_events(WarningSeverity::Medium)
                    .into_iter()
                    .cloned()
                    .collect(),
            },
            protocol_deviations: self.find_protocol_deviations(),
            tip_management: self.find_tip_changes_needed(),
            hud_summary: self.get_hud_summary(),
        }
    }
}
