//! Core domain vocabulary: reagents, pipette and well state, transfers, warnings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Tolerance used to decide whether a well has reached its expected volume
pub const COMPLETION_TOLERANCE_UL: f64 = 0.5;

/// Semantic version for transition rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Create a new version
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Blake3 digest of an experiment state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    /// Parse a hex-encoded digest
    pub fn from_hex(encoded: &str) -> Result<Self, ValidationError> {
        let bytes = hex::decode(encoded).map_err(|e| ValidationError::InvalidField {
            field: "hash".to_string(),
            reason: e.to_string(),
        })?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| ValidationError::InvalidField {
            field: "hash".to_string(),
            reason: "expected 32 bytes".to_string(),
        })?;
        Ok(StateHash(array))
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A named reagent with a volume in microliters.
///
/// Treated as a value: aggregation produces a new instance rather than
/// editing the volume of one already recorded elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reagent {
    pub name: String,
    pub volume_ul: f64,
}

impl Reagent {
    pub fn new(name: impl Into<String>, volume_ul: f64) -> Self {
        Self {
            name: name.into(),
            volume_ul,
        }
    }

    /// Return a new reagent of the same name holding `added_ul` more volume
    pub fn combined(&self, added_ul: f64) -> Self {
        Self {
            name: self.name.clone(),
            volume_ul: self.volume_ul + added_ul,
        }
    }
}

impl fmt::Display for Reagent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}µl)", self.name, self.volume_ul)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipetteAction {
    Aspirate,
    Dispense,
    Mix,
    BlowOut,
    TouchTip,
    ChangeTip,
    #[default]
    Idle,
}

impl PipetteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipetteAction::Aspirate => "aspirate",
            PipetteAction::Dispense => "dispense",
            PipetteAction::Mix => "mix",
            PipetteAction::BlowOut => "blow_out",
            PipetteAction::TouchTip => "touch_tip",
            PipetteAction::ChangeTip => "change_tip",
            PipetteAction::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContaminationLevel {
    #[default]
    Clean,
    PotentiallyContaminated,
    Contaminated,
    Unknown,
}

impl ContaminationLevel {
    /// Explicit risk ranking. `Unknown` sits between clean and potentially
    /// contaminated: it carries some risk but less than observed contact.
    pub fn rank(self) -> u8 {
        match self {
            ContaminationLevel::Clean => 0,
            ContaminationLevel::Unknown => 1,
            ContaminationLevel::PotentiallyContaminated => 2,
            ContaminationLevel::Contaminated => 3,
        }
    }

    /// The riskier of two levels
    pub fn max_of(self, other: ContaminationLevel) -> ContaminationLevel {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn is_clean(self) -> bool {
        self == ContaminationLevel::Clean
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContaminationLevel::Clean => "clean",
            ContaminationLevel::PotentiallyContaminated => "potentially_contaminated",
            ContaminationLevel::Contaminated => "contaminated",
            ContaminationLevel::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    CrossContamination,
    VolumeDiscrepancy,
    TechniqueError,
    EquipmentIssue,
    ProtocolDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl WarningSeverity {
    /// Explicit ordering: low < medium < high < critical
    pub fn rank(self) -> u8 {
        match self {
            WarningSeverity::Low => 1,
            WarningSeverity::Medium => 2,
            WarningSeverity::High => 3,
            WarningSeverity::Critical => 4,
        }
    }

    pub fn at_least(self, threshold: WarningSeverity) -> bool {
        self.rank() >= threshold.rank()
    }

    /// Experiment-wide contamination risk implied by a warning of this severity
    pub fn implied_contamination(self) -> ContaminationLevel {
        match self {
            WarningSeverity::Low => ContaminationLevel::Clean,
            WarningSeverity::Medium => ContaminationLevel::PotentiallyContaminated,
            WarningSeverity::High | WarningSeverity::Critical => ContaminationLevel::Contaminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WarningSeverity::Low => "low",
            WarningSeverity::Medium => "medium",
            WarningSeverity::High => "high",
            WarningSeverity::Critical => "critical",
        }
    }
}

impl FromStr for WarningSeverity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(WarningSeverity::Low),
            "medium" | "moderate" => Ok(WarningSeverity::Medium),
            "high" => Ok(WarningSeverity::High),
            "critical" => Ok(WarningSeverity::Critical),
            other => Err(ValidationError::InvalidField {
                field: "severity".to_string(),
                reason: format!("unknown severity '{}'", other),
            }),
        }
    }
}

/// One entry in a tip's contamination lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationEvent {
    /// Video offset in seconds
    pub timestamp: f64,
    /// Reagent that touched the tip
    pub contamination_source: String,
    pub contamination_level: ContaminationLevel,
    pub action_taken: Option<String>,
}

/// Pipette state, owned by the experiment and mutated only by replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipetteState {
    pub volume_setting_ul: f64,
    pub last_reagent_aspirated: Option<Reagent>,
    pub source_container_id: Option<String>,
    pub tip_attached: bool,
    pub tip_id: Option<String>,
    pub tip_contamination_level: ContaminationLevel,
    pub tip_contamination_history: Vec<ContaminationEvent>,
    pub last_action: PipetteAction,
    /// Number of tips picked up so far; feeds deterministic tip ids
    pub tips_issued: u64,
}

impl Default for PipetteState {
    fn default() -> Self {
        Self {
            volume_setting_ul: 0.0,
            last_reagent_aspirated: None,
            source_container_id: None,
            tip_attached: false,
            tip_id: None,
            tip_contamination_level: ContaminationLevel::Clean,
            tip_contamination_history: Vec::new(),
            last_action: PipetteAction::Idle,
            tips_issued: 0,
        }
    }
}

impl PipetteState {
    pub fn requires_tip_change(&self) -> bool {
        self.tip_contamination_level == ContaminationLevel::Contaminated
            || self.tip_contamination_history.len() > 3
    }

    /// Distinct reagent names the current tip has touched, in first-contact order
    pub fn reagents_in_tip(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entry in &self.tip_contamination_history {
            if !names.contains(&entry.contamination_source.as_str()) {
                names.push(entry.contamination_source.as_str());
            }
        }
        names
    }
}

/// Immutable record of a single dispense
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReagentTransfer {
    pub transfer_id: String,
    /// Video offset in seconds
    pub timestamp: f64,
    /// Wall-clock time, when the video start time is known
    pub recorded_at: Option<DateTime<Utc>>,
    pub reagent: Reagent,
    pub source_container: String,
    pub destination_well: String,
    pub intended_volume_ul: f64,
    pub actual_volume_ul: Option<f64>,
    pub pipette_volume_setting: f64,
    pub tip_id: Option<String>,
    pub tip_contamination_before: ContaminationLevel,
    pub tip_contamination_after: ContaminationLevel,
    pub observed_issues: Vec<String>,
}

impl ReagentTransfer {
    /// Volume that actually landed in the destination well
    pub fn delivered_volume_ul(&self) -> f64 {
        self.actual_volume_ul.unwrap_or(self.intended_volume_ul)
    }

    /// Relative error between intended and observed volume, if observed
    pub fn relative_error(&self) -> Option<f64> {
        let actual = self.actual_volume_ul?;
        if self.intended_volume_ul <= 0.0 {
            return None;
        }
        Some((self.intended_volume_ul - actual).abs() / self.intended_volume_ul)
    }

    pub fn has_volume_discrepancy(&self, threshold: f64) -> bool {
        self.relative_error().map_or(false, |err| err > threshold)
    }
}

/// The oracle's own view of a well, kept as an annotation only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellAnnotation {
    pub timestamp: f64,
    pub reported_complete: bool,
    pub reported_contents: Vec<Reagent>,
    pub missing_reagents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellContents {
    pub well_id: String,
    /// One aggregated entry per distinct reagent name
    pub reagents: Vec<Reagent>,
    pub total_volume_ul: f64,
    pub expected_volume_ul: Option<f64>,
    /// Ids of transfers into this well, in replay order
    pub transfer_history: Vec<String>,
    pub contamination_risk: ContaminationLevel,
    pub contamination_sources: Vec<String>,
    pub annotation: Option<WellAnnotation>,
}

impl WellContents {
    pub fn new(well_id: impl Into<String>) -> Self {
        Self {
            well_id: well_id.into(),
            reagents: Vec::new(),
            total_volume_ul: 0.0,
            expected_volume_ul: None,
            transfer_history: Vec::new(),
            contamination_risk: ContaminationLevel::Clean,
            contamination_sources: Vec::new(),
            annotation: None,
        }
    }

    /// Merge a transfer into this well
    pub fn add_transfer(&mut self, transfer: &ReagentTransfer) {
        let volume = transfer.delivered_volume_ul();
        self.transfer_history.push(transfer.transfer_id.clone());

        match self
            .reagents
            .iter_mut()
            .find(|r| r.name == transfer.reagent.name)
        {
            Some(existing) => *existing = existing.combined(volume),
            None => self
                .reagents
                .push(Reagent::new(transfer.reagent.name.clone(), volume)),
        }

        self.total_volume_ul = self.reagents.iter().map(|r| r.volume_ul).sum();

        if !transfer.tip_contamination_after.is_clean() {
            self.contamination_risk = self
                .contamination_risk
                .max_of(transfer.tip_contamination_after);
        }
    }

    /// Note a reagent that may have been carried into this well by the tip
    pub fn add_contamination_source(&mut self, reagent: &str) {
        if !self.contamination_sources.iter().any(|s| s == reagent) {
            self.contamination_sources.push(reagent.to_string());
        }
    }

    /// Absolute distance from the expected volume, if one is set
    pub fn volume_discrepancy(&self) -> Option<f64> {
        self.expected_volume_ul
            .map(|expected| (self.total_volume_ul - expected).abs())
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete_within(COMPLETION_TOLERANCE_UL)
    }

    pub fn is_complete_within(&self, tolerance_ul: f64) -> bool {
        self.volume_discrepancy()
            .map_or(false, |diff| diff < tolerance_ul)
    }

    pub fn reagent_volume(&self, name: &str) -> f64 {
        self.reagents
            .iter()
            .find(|r| r.name == name)
            .map_or(0.0, |r| r.volume_ul)
    }
}

/// Warning raised during replay or reported by the oracle. Never mutated
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationWarning {
    pub warning_id: String,
    pub timestamp: f64,
    pub warning_type: WarningType,
    pub severity: WarningSeverity,
    pub contamination_source: String,
    pub affected_containers: Vec<String>,
    pub contaminated_reagent: Option<String>,
    pub description: String,
    pub recommended_action: String,
    pub contamination_probability: Option<f64>,
}

impl ContaminationWarning {
    pub fn is_critical(&self) -> bool {
        self.severity == WarningSeverity::Critical
    }

    pub fn is_active(&self) -> bool {
        self.severity.at_least(WarningSeverity::High)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDiscrepancy {
    pub discrepancy_id: String,
    pub timestamp: f64,
    pub container_id: String,
    pub expected_volume_ul: f64,
    pub observed_volume_ul: Option<f64>,
    pub calculated_volume_ul: Option<f64>,
    pub absolute_difference_ul: Option<f64>,
    pub relative_difference_percent: Option<f64>,
    pub severity: WarningSeverity,
    pub description: String,
}

impl VolumeDiscrepancy {
    /// Create a discrepancy record. Differences stay unset until
    /// [`VolumeDiscrepancy::derive_differences`] runs.
    pub fn new(
        discrepancy_id: impl Into<String>,
        timestamp: f64,
        container_id: impl Into<String>,
        expected_volume_ul: f64,
        observed_volume_ul: Option<f64>,
    ) -> Self {
        Self {
            discrepancy_id: discrepancy_id.into(),
            timestamp,
            container_id: container_id.into(),
            expected_volume_ul,
            observed_volume_ul,
            calculated_volume_ul: None,
            absolute_difference_ul: None,
            relative_difference_percent: None,
            severity: WarningSeverity::Low,
            description: String::new(),
        }
    }

    pub fn with_calculated_volume(mut self, calculated_ul: f64) -> Self {
        self.calculated_volume_ul = Some(calculated_ul);
        self
    }

    /// Compute absolute/relative differences and the resulting severity
    pub fn derive_differences(mut self) -> Self {
        if let Some(observed) = self.observed_volume_ul {
            let absolute = (self.expected_volume_ul - observed).abs();
            self.absolute_difference_ul = Some(absolute);
            if self.expected_volume_ul > 0.0 {
                let relative = absolute / self.expected_volume_ul * 100.0;
                self.relative_difference_percent = Some(relative);
                self.severity = severity_for_relative_difference(relative);
            }
            self.description = format!(
                "{}: expected {}µl, observed {}µl",
                self.container_id, self.expected_volume_ul, observed
            );
        }
        self
    }
}

/// Severity bands for a relative volume difference in percent
pub fn severity_for_relative_difference(percent: f64) -> WarningSeverity {
    if percent >= 50.0 {
        WarningSeverity::High
    } else if percent >= 20.0 {
        WarningSeverity::Medium
    } else {
        WarningSeverity::Low
    }
}
