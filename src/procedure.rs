//! Procedure context: the goal plate layout extracted before replay

use serde::{Deserialize, Serialize};

use crate::error::{SerializationError, ValidationError};
use crate::experiment::ExperimentState;
use crate::types::Reagent;

/// Target contents for one well
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalWell {
    pub well_id: String,
    pub reagents: Vec<Reagent>,
}

impl GoalWell {
    pub fn expected_volume_ul(&self) -> f64 {
        self.reagents.iter().map(|r| r.volume_ul).sum()
    }

    pub fn expects_reagent(&self, name: &str) -> bool {
        self.reagents.iter().any(|r| r.name == name)
    }
}

/// Procedure extracted by the oracle ahead of event replay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureContext {
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub timestamp_range: Option<String>,
    pub goal_wells: Vec<GoalWell>,
    #[serde(default)]
    pub reagent_sources: Vec<String>,
}

impl ProcedureContext {
    pub fn new(goal_wells: Vec<GoalWell>, reagent_sources: Vec<String>) -> Self {
        Self {
            thinking: String::new(),
            timestamp_range: None,
            goal_wells,
            reagent_sources,
        }
    }

    /// Parse the oracle's procedure extraction document
    pub fn from_json_str(json: &str) -> Result<Self, SerializationError> {
        serde_json::from_str(json).map_err(|e| SerializationError::DeserializationFailed {
            reason: format!("procedure context: {}", e),
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen: Vec<&str> = Vec::new();
        for goal in &self.goal_wells {
            if goal.well_id.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    event_kind: "procedure".to_string(),
                    field: "well_id".to_string(),
                });
            }
            if seen.contains(&goal.well_id.as_str()) {
                return Err(ValidationError::InvalidField {
                    field: "goal_wells".to_string(),
                    reason: format!("well {} listed twice", goal.well_id),
                });
            }
            seen.push(&goal.well_id);
            if let Some(bad) = goal.reagents.iter().find(|r| !r.volume_ul.is_finite() || r.volume_ul < 0.0) {
                return Err(ValidationError::InvalidField {
                    field: "volume_ul".to_string(),
                    reason: format!("goal volume {} for {} in {}", bad.volume_ul, bad.name, goal.well_id),
                });
            }
        }
        Ok(())
    }

    /// Seed goal wells and expected volumes. Intended to run once, before any
    /// events are replayed; wells already present pick up their expectation.
    /// Completion is judged within `completion_tolerance_ul`.
    pub fn apply_to(&self, state: &mut ExperimentState, completion_tolerance_ul: f64) -> Result<(), ValidationError> {
        self.validate()?;

        for goal in &self.goal_wells {
            state.goal_wells.insert(goal.well_id.clone(), goal.clone());
            if let Some(well) = state.wells.get_mut(&goal.well_id) {
                well.expected_volume_ul = Some(goal.expected_volume_ul());
            }
        }
        for source in &self.reagent_sources {
            if !state.reagent_sources.contains(source) {
                state.reagent_sources.push(source.clone());
            }
        }
        state.refresh_derived(completion_tolerance_ul);
        Ok(())
    }
}
