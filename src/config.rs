//! Replay configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::diagnostics::LogLevel;
use crate::error::ValidationError;
use crate::types::COMPLETION_TOLERANCE_UL;

/// Knobs controlling replay and analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Abort on the first dropped record or skipped event instead of
    /// recording a diagnostic
    pub strict: bool,
    /// A well is complete when within this many µl of its expected volume
    pub completion_tolerance_ul: f64,
    /// Relative error at or below which a transfer counts as accurate
    pub accuracy_tolerance: f64,
    /// Discrepancies above this relative difference are protocol deviations
    pub deviation_threshold_percent: f64,
    /// Relative intended-vs-observed error that records a volume discrepancy
    pub discrepancy_threshold: f64,
    /// Pipette setting assumed before the first setting change
    pub default_volume_setting_ul: f64,
    /// Seed for tip ids
    pub seed: u64,
    /// Record before/after state hashes in the replay trace
    pub hash_transitions: bool,
    pub min_diagnostic_level: LogLevel,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            strict: false,
            completion_tolerance_ul: COMPLETION_TOLERANCE_UL,
            accuracy_tolerance: 0.05,
            deviation_threshold_percent: 10.0,
            discrepancy_threshold: 0.1,
            default_volume_setting_ul: 0.0,
            seed: 0,
            hash_transitions: false,
            min_diagnostic_level: LogLevel::Info,
        }
    }
}

impl ReplayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_hash_transitions(mut self, enabled: bool) -> Self {
        self.hash_transitions = enabled;
        self
    }

    /// Parse a JSON document; missing keys take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: ReplayConfig = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read `PIPETRACE_*` overrides from the process environment, after
    /// loading a `.env` file if one is found
    pub fn from_env() -> Result<Self, ValidationError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read `PIPETRACE_*` overrides from a dotenv file without touching the
    /// process environment
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let invalid = |e: dotenvy::Error| ValidationError::InvalidConfig {
            reason: format!("{}: {}", path.display(), e),
        };

        let mut vars = HashMap::new();
        for item in dotenvy::from_path_iter(path).map_err(invalid)? {
            let (key, value) = item.map_err(invalid)?;
            vars.insert(key, value);
        }
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Apply overrides from an arbitrary key lookup on top of the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("PIPETRACE_STRICT") {
            config.strict = parse_flag("PIPETRACE_STRICT", &value)?;
        }
        if let Some(value) = lookup("PIPETRACE_SEED") {
            config.seed = parse_value("PIPETRACE_SEED", &value)?;
        }
        if let Some(value) = lookup("PIPETRACE_COMPLETION_TOLERANCE_UL") {
            config.completion_tolerance_ul = parse_value("PIPETRACE_COMPLETION_TOLERANCE_UL", &value)?;
        }
        if let Some(value) = lookup("PIPETRACE_HASH_TRANSITIONS") {
            config.hash_transitions = parse_flag("PIPETRACE_HASH_TRANSITIONS", &value)?;
        }
        if let Some(value) = lookup("PIPETRACE_LOG_LEVEL") {
            config.min_diagnostic_level = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("completion_tolerance_ul", self.completion_tolerance_ul),
            ("accuracy_tolerance", self.accuracy_tolerance),
            ("deviation_threshold_percent", self.deviation_threshold_percent),
            ("discrepancy_threshold", self.discrepancy_threshold),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{} must be positive, got {}", name, value),
                });
            }
        }
        if !self.default_volume_setting_ul.is_finite() || self.default_volume_setting_ul < 0.0 {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "default_volume_setting_ul must be non-negative, got {}",
                    self.default_volume_setting_ul
                ),
            });
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ValidationError::InvalidConfig {
            reason: format!("{} must be a boolean, got '{}'", key, other),
        }),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ValidationError> {
    value.trim().parse().map_err(|_| ValidationError::InvalidConfig {
        reason: format!("{} has invalid value '{}'", key, value),
    })
}
