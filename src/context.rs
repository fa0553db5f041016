//! Replay context: the only source of time, randomness and configuration
//! a transition may consult

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::ReplayConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticLog, LogLevel};

/// Maps video offsets to wall-clock time when the recording start is known
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeterministicTime {
    video_started_at: Option<DateTime<Utc>>,
}

impl DeterministicTime {
    pub fn new(video_started_at: Option<DateTime<Utc>>) -> Self {
        Self { video_started_at }
    }

    pub fn video_started_at(&self) -> Option<DateTime<Utc>> {
        self.video_started_at
    }

    /// Wall-clock time of a video offset in seconds
    pub fn at_offset(&self, offset_seconds: f64) -> Option<DateTime<Utc>> {
        let start = self.video_started_at?;
        let millis = (offset_seconds * 1000.0).round() as i64;
        start.checked_add_signed(Duration::milliseconds(millis))
    }
}

/// Seeded generator for tip ids.
///
/// Each tip is derived from `seed + tips_issued`, so ids stay stable across
/// processing rounds that resume from a stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededRandom {
    seed: u64,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Id for the tip issued after `tips_issued` earlier ones
    pub fn tip_id(&self, tips_issued: u64) -> String {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(tips_issued));
        let suffix: u32 = rng.gen();
        format!("tip-{:03}-{:08x}", tips_issued + 1, suffix)
    }
}

/// Mutable context threaded through one replay run
#[derive(Debug, Clone)]
pub struct ReplayContext {
    time: DeterministicTime,
    random: SeededRandom,
    config: ReplayConfig,
    diagnostics: DiagnosticLog,
    current_event: Option<(usize, String)>,
}

impl ReplayContext {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            time: DeterministicTime::default(),
            random: SeededRandom::new(config.seed),
            diagnostics: DiagnosticLog::new(config.min_diagnostic_level),
            config,
            current_event: None,
        }
    }

    pub fn builder() -> ReplayContextBuilder {
        ReplayContextBuilder::new()
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn time(&self) -> &DeterministicTime {
        &self.time
    }

    pub fn random(&self) -> &SeededRandom {
        &self.random
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Take the collected diagnostics, leaving an empty log behind
    pub fn take_diagnostics(&mut self) -> DiagnosticLog {
        let fresh = DiagnosticLog::new(self.config.min_diagnostic_level);
        std::mem::replace(&mut self.diagnostics, fresh)
    }

    pub(crate) fn set_current_event(&mut self, index: usize, timestamp_range: &str) {
        self.current_event = Some((index, timestamp_range.to_string()));
    }

    pub(crate) fn clear_current_event(&mut self) {
        self.current_event = None;
    }

    /// Record a diagnostic tagged with the event being applied, if any
    pub fn note(&mut self, level: LogLevel, kind: DiagnosticKind, message: impl Into<String>) {
        let mut diagnostic = Diagnostic::new(level, kind, message);
        if let Some((index, range)) = &self.current_event {
            diagnostic = diagnostic.with_event(*index, range.clone());
        }
        self.diagnostics.record(diagnostic);
    }
}

impl Default for ReplayContext {
    fn default() -> Self {
        Self::new(ReplayConfig::default())
    }
}

pub struct ReplayContextBuilder {
    config: ReplayConfig,
    video_started_at: Option<DateTime<Utc>>,
}

impl ReplayContextBuilder {
    pub fn new() -> Self {
        Self {
            config: ReplayConfig::default(),
            video_started_at: None,
        }
    }

    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn with_video_start(mut self, started_at: DateTime<Utc>) -> Self {
        self.video_started_at = Some(started_at);
        self
    }

    pub fn build(self) -> ReplayContext {
        let mut context = ReplayContext::new(self.config);
        context.time = DeterministicTime::new(self.video_started_at);
        context
    }
}

impl Default for ReplayContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tip_ids_are_reproducible() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        assert_eq!(a.tip_id(0), b.tip_id(0));
        assert_ne!(a.tip_id(0), a.tip_id(1));
        assert!(a.tip_id(2).starts_with("tip-003-"));
    }

    #[test]
    fn test_different_seeds_differ() {
        assert_ne!(SeededRandom::new(1).tip_id(0), SeededRandom::new(2).tip_id(0));
    }

    #[test]
    fn test_offsets_map_to_wall_clock() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let context = ReplayContext::builder().with_video_start(start).build();

        let at = context.time().at_offset(62.5).unwrap();
        assert_eq!(at, start + Duration::milliseconds(62_500));
        assert_eq!(DeterministicTime::default().at_offset(5.0), None);
    }

    #[test]
    fn test_note_tags_current_event() {
        let mut context = ReplayContext::default();
        context.set_current_event(3, "0:05");
        context.note(LogLevel::Warn, DiagnosticKind::Advisory, "mismatch");
        context.clear_current_event();

        let log = context.take_diagnostics();
        assert_eq!(log.entries()[0].event_index, Some(3));
        assert!(context.diagnostics().is_empty());
    }
}
