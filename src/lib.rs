//! pipetrace
//!
//! Deterministic reconstruction of a pipetting experiment from timestamped
//! events extracted out of lab video.

pub mod analysis;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod experiment;
pub mod hasher;
pub mod oracle;
pub mod procedure;
pub mod replay_engine;
pub mod rules;
pub mod serialization;
pub mod timeline;
pub mod timestamp;
pub mod traits;
pub mod types;

// Re-export core types and traits
pub use analysis::{
    AccuracyReport, ChainLink, ChainRisk, ContaminationChain, ExperimentAnalyzer, ExperimentReport,
    HudSummary, ProtocolDeviation, QualityGrade, TipChangeRecommendation,
};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::ReplayConfig;
pub use context::{DeterministicTime, ReplayContext, ReplayContextBuilder, SeededRandom};
pub use diagnostics::{
    Diagnostic, DiagnosticKind, DiagnosticLog, LogLevel, ReplayTrace, TransitionOutcome, TransitionRecord,
};
pub use error::{
    OracleError, PipetraceError, ReplayError, SerializationError, StateError, TimestampError, ValidationError,
};
pub use event::{
    parse_record, AspirationEvent, DispensingEvent, EventKind, LabEvent, PipetteSettingChange, TipChangeEvent,
    WarningEvent, WellStateEvent,
};
pub use experiment::ExperimentState;
pub use hasher::StateHasher;
pub use oracle::{collect_batches, query_procedure, EventQuery, Oracle, VideoContext};
pub use procedure::{GoalWell, ProcedureContext};
pub use replay_engine::{ReplayEngine, ReplayEngineBuilder, ReplayReport, ReplayResult, RoundResult};
pub use rules::PipettingRules;
pub use serialization::{BincodeSerializer, JsonSerializer, StateSerializer};
pub use timeline::{build_timeline, build_timeline_strict, EventBatch, TimelineBuild, TimelineDocument, TimelineEvent};
pub use timestamp::{parse_timestamp_range, TimestampRange};
pub use traits::{TimedEvent, TransitionRules};
pub use types::{
    ContaminationLevel, ContaminationWarning, PipetteAction, PipetteState, Reagent, ReagentTransfer, StateHash,
    VolumeDiscrepancy, Version, WarningSeverity, WarningType, WellContents,
};
