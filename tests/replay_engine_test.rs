use pipetrace::event::{AspirationEvent, DispensingEvent, TipChangeEvent, WarningEvent};
use pipetrace::timestamp::format_clock;
use pipetrace::{
    ContaminationLevel, DiagnosticKind, EventBatch, EventKind, ExperimentState, GoalWell, LabEvent,
    PipetraceError, ProcedureContext, Reagent, ReplayConfig, ReplayEngine, ReplayError, TimelineEvent, TransitionOutcome,
    WarningSeverity, WarningType,
};
use proptest::prelude::*;
use serde_json::json;

fn timeline_event(event: LabEvent) -> TimelineEvent {
    TimelineEvent::from_event(event).unwrap()
}

fn aspirate(ts: &str, reagent: &str, volume: f64) -> TimelineEvent {
    timeline_event(LabEvent::Aspiration(AspirationEvent {
        thinking: String::new(),
        timestamp_range: ts.to_string(),
        reagent_name: reagent.to_string(),
        volume_ul: volume,
        source_container: format!("TUBE-{}", reagent.trim_start_matches("Reagent ")),
    }))
}

fn dispense(ts: &str, reagent: &str, well: &str) -> TimelineEvent {
    timeline_event(LabEvent::Dispensing(DispensingEvent {
        thinking: String::new(),
        timestamp_range: ts.to_string(),
        reagent: Reagent::new(reagent, 0.0),
        volume_ul: 0.0,
        destination_well: well.to_string(),
    }))
}

fn tip_change(ts: &str, ejected: bool, new_tip_attached: bool) -> TimelineEvent {
    timeline_event(LabEvent::TipChange(TipChangeEvent {
        thinking: String::new(),
        timestamp_range: ts.to_string(),
        ejected,
        new_tip_attached,
    }))
}

fn contamination_scenario() -> Vec<TimelineEvent> {
    vec![
        aspirate("0:01", "Reagent A", 30.0),
        dispense("0:02", "Reagent A", "A1"),
        aspirate("0:03", "Reagent B", 30.0),
        dispense("0:04", "Reagent B", "A2"),
    ]
}

#[test]
fn test_simple_transfer() {
    let engine = ReplayEngine::default();
    let events = vec![aspirate("0:01", "Reagent A", 30.0), dispense("0:02", "Reagent A", "A1")];

    let result = engine.replay(ExperimentState::new("simple"), &events).unwrap();
    let well = &result.final_state.wells["A1"];

    assert_eq!(well.reagents, vec![Reagent::new("Reagent A", 30.0)]);
    assert_eq!(well.total_volume_ul, 30.0);
    assert_eq!(result.final_state.all_transfers.len(), 1);
    assert_eq!(result.final_state.all_transfers[0].source_container, "TUBE-A");
    assert_eq!(result.trace.events_applied, 2);
    assert!(result.final_state.contamination_warnings.is_empty());
}

#[test]
fn test_contamination_without_tip_change() {
    let engine = ReplayEngine::default();
    let events = contamination_scenario();

    // Tip level right after the second aspiration
    let partial = engine.replay(ExperimentState::new("contam"), &events[..3]).unwrap();
    assert_eq!(
        partial.final_state.pipette.tip_contamination_level,
        ContaminationLevel::Contaminated
    );

    let result = engine.replay(ExperimentState::new("contam"), &events).unwrap();
    let state = &result.final_state;
    let warning = state
        .contamination_warnings
        .iter()
        .find(|w| w.warning_type == WarningType::CrossContamination)
        .expect("cross-contamination warning");

    assert_eq!(warning.severity, WarningSeverity::High);
    assert_eq!(warning.affected_containers, vec!["A2".to_string()]);
    assert_eq!(warning.contamination_source, "Reagent A");
    assert_eq!(warning.contaminated_reagent.as_deref(), Some("Reagent B"));
    assert_eq!(state.wells["A2"].contamination_sources, vec!["Reagent A".to_string()]);
    assert_eq!(state.contamination_risk_level, ContaminationLevel::Contaminated);
}

#[test]
fn test_eject_resets_tip() {
    let engine = ReplayEngine::default();
    let mut events = contamination_scenario();
    events.push(tip_change("0:05", true, false));

    let result = engine.replay(ExperimentState::new("reset"), &events).unwrap();
    let pipette = &result.final_state.pipette;

    assert_eq!(pipette.tip_contamination_level, ContaminationLevel::Clean);
    assert!(pipette.tip_contamination_history.is_empty());
    assert!(!pipette.tip_attached);
}

#[test]
fn test_new_tip_between_reagents_avoids_warning() {
    let engine = ReplayEngine::default();
    let events = vec![
        aspirate("0:01", "Reagent A", 30.0),
        dispense("0:02", "Reagent A", "A1"),
        tip_change("0:03", true, true),
        aspirate("0:04", "Reagent B", 30.0),
        dispense("0:05", "Reagent B", "A2"),
    ];

    let result = engine.replay(ExperimentState::new("clean"), &events).unwrap();
    let state = &result.final_state;

    assert!(state.contamination_warnings.is_empty());
    assert_eq!(state.pipette.tips_issued, 2);
    assert_ne!(state.all_transfers[0].tip_id, state.all_transfers[1].tip_id);
}

#[test]
fn test_strict_mode_aborts_with_partial_state() {
    let engine = ReplayEngine::builder().strict(true).build().unwrap();
    let events = vec![
        aspirate("0:01", "Reagent A", 30.0),
        dispense("0:02", "Reagent A", "A1"),
        dispense("0:03", "Reagent A", "A2"),
    ];

    match engine.replay(ExperimentState::new("strict"), &events) {
        Err(ReplayError::StrictAbort { event_index, .. }) if event_index == 2 => {}
        other => panic!("expected strict abort at event 2, got {:?}", other.map(|r| r.trace)),
    }

    let err = engine.replay(ExperimentState::new("strict"), &events).unwrap_err();
    let partial = err.into_partial_state();
    assert_eq!(partial.events_applied, 2);
    assert!(partial.wells.contains_key("A1"));
}

#[test]
fn test_lenient_mode_skips_and_continues() {
    let engine = ReplayEngine::default();
    let events = vec![
        dispense("0:01", "Reagent A", "A1"),
        aspirate("0:02", "Reagent A", 30.0),
        dispense("0:03", "Reagent A", "A2"),
    ];

    let result = engine.replay(ExperimentState::new("lenient"), &events).unwrap();

    assert_eq!(result.trace.events_skipped, 1);
    assert_eq!(result.trace.transitions[0].outcome, TransitionOutcome::Skipped);
    assert_eq!(result.final_state.events_applied, 2);
    assert!(result.final_state.wells.contains_key("A2"));
    assert_eq!(result.diagnostics.count_kind(DiagnosticKind::InconsistentTransition), 1);
}

#[test]
fn test_out_of_order_across_rounds() {
    let engine = ReplayEngine::default();
    let mut state = ExperimentState::new("rounds");

    engine
        .replay_into(&mut state, &[aspirate("0:10", "Reagent A", 30.0)])
        .unwrap();
    let report = engine
        .replay_into(&mut state, &[dispense("0:05", "Reagent A", "A1")])
        .unwrap();

    assert_eq!(report.diagnostics.count_kind(DiagnosticKind::OutOfOrder), 1);
    assert_eq!(state.replayed_until_seconds, Some(10.0));
    assert_eq!(state.events_applied, 2);
}

#[test]
fn test_process_round_from_oracle_batches() {
    let engine = ReplayEngine::default();
    let procedure = ProcedureContext::new(
        vec![GoalWell {
            well_id: "A1".to_string(),
            reagents: vec![Reagent::new("Reagent A", 30.0)],
        }],
        vec!["Reagent A".to_string()],
    );
    let batches = vec![
        EventBatch::new(
            "aspirations",
            Some(EventKind::Aspiration),
            vec![json!({
                "timestamp_range": "0:01",
                "reagent_name": "Reagent A",
                "volume_ul": 30.0,
                "source_container": "TUBE-A"
            })],
        ),
        EventBatch::new(
            "dispensing",
            Some(EventKind::Dispensing),
            vec![
                json!({
                    "timestamp_range": "0:02",
                    "reagent": {"name": "Reagent A", "volume_ul": 30.0},
                    "volume_ul": 30.0,
                    "destination_well": "A1"
                }),
                json!({"timestamp_range": "later", "destination_well": "A2"}),
            ],
        ),
    ];

    let round = engine
        .process_round(ExperimentState::new("round"), Some(&procedure), &batches)
        .unwrap();

    assert_eq!(round.timeline.len(), 2);
    assert_eq!(round.state.completion_percentage, 100.0);
    assert_eq!(round.state.wells_completed, 1);
    assert!(!round.diagnostics.is_empty());
}

fn oracle_round(dispense_records: Vec<serde_json::Value>) -> Vec<EventBatch> {
    vec![
        EventBatch::new(
            "aspirations",
            Some(EventKind::Aspiration),
            vec![json!({"timestamp_range": "0:01", "reagent_name": "Reagent A", "volume_ul": 30.0})],
        ),
        EventBatch::new("dispensing", Some(EventKind::Dispensing), dispense_records),
    ]
}

#[test]
fn test_strict_round_fails_on_dropped_record() {
    let batches = oracle_round(vec![
        json!({"timestamp_range": "0:02", "reagent_name": "Reagent A", "destination_well": "A1"}),
        json!({"timestamp_range": "zero", "reagent_name": "Reagent A", "destination_well": "A2"}),
    ]);

    let lenient = ReplayEngine::default()
        .process_round(ExperimentState::new("round"), None, &batches)
        .unwrap();
    assert_eq!(lenient.timeline.len(), 2);
    assert_eq!(lenient.diagnostics.count_kind(DiagnosticKind::MalformedTimestamp), 1);

    let strict = ReplayEngine::builder().strict(true).build().unwrap();
    let result = strict.process_round(ExperimentState::new("round"), None, &batches);
    assert!(matches!(result, Err(PipetraceError::Timestamp(_))));

    let unparseable = oracle_round(vec![json!({"timestamp_range": "0:02", "destination_well": "A1"})]);
    let result = strict.process_round(ExperimentState::new("round"), None, &unparseable);
    assert!(matches!(result, Err(PipetraceError::Validation(_))));
}

#[test]
fn test_round_seeds_procedure_with_configured_tolerance() {
    let procedure = ProcedureContext::new(
        vec![GoalWell {
            well_id: "A1".to_string(),
            reagents: vec![Reagent::new("Reagent A", 31.5)],
        }],
        vec!["Reagent A".to_string()],
    );
    let batches = oracle_round(vec![json!({
        "timestamp_range": "0:02",
        "reagent_name": "Reagent A",
        "volume_ul": 30.0,
        "destination_well": "A1"
    })]);

    let default_round = ReplayEngine::default()
        .process_round(ExperimentState::new("round"), Some(&procedure), &batches)
        .unwrap();
    assert_eq!(default_round.state.wells_completed, 0);

    let mut config = ReplayConfig::default();
    config.completion_tolerance_ul = 2.0;
    let engine = ReplayEngine::builder().with_config(config).build().unwrap();
    let mut state = default_round.state.clone();
    procedure.apply_to(&mut state, engine.config().completion_tolerance_ul).unwrap();
    assert_eq!(state.wells_completed, 1);

    let round = engine
        .process_round(ExperimentState::new("round"), Some(&procedure), &batches)
        .unwrap();
    assert_eq!(round.state.wells_completed, 1);
}

#[test]
fn test_warning_event_severity_inference() {
    let engine = ReplayEngine::default();
    let events = vec![timeline_event(LabEvent::Warning(WarningEvent {
        thinking: String::new(),
        timestamp_range: "0:07".to_string(),
        warning_message: "Possible contamination: tip touched bench".to_string(),
        description: String::new(),
        severity: None,
    }))];

    let result = engine.replay(ExperimentState::new("warn"), &events).unwrap();
    let warning = &result.final_state.contamination_warnings[0];

    assert_eq!(warning.severity, WarningSeverity::High);
    assert_eq!(warning.warning_type, WarningType::CrossContamination);
    assert_eq!(result.final_state.active_warnings().len(), 1);
}

#[test]
fn test_hashed_replay_is_reproducible() {
    let engine = ReplayEngine::builder()
        .with_seed(7)
        .with_hash_transitions(true)
        .build()
        .unwrap();
    let events = contamination_scenario();

    let first = engine.replay(ExperimentState::new("hash"), &events).unwrap();
    let second = engine.replay(ExperimentState::new("hash"), &events).unwrap();

    assert!(first.final_hash.is_some());
    assert_eq!(first.final_hash, second.final_hash);
    assert!(first.trace.transitions.iter().all(|t| t.state_hash_after.is_some()));
}

#[derive(Debug, Clone)]
enum Step {
    Aspirate(usize),
    Dispense(usize),
    Eject,
    NewTip,
    Pickup,
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..3).prop_map(Step::Aspirate),
            (0usize..4).prop_map(Step::Dispense),
            Just(Step::Eject),
            Just(Step::NewTip),
            Just(Step::Pickup),
        ],
        1..30,
    )
}

const REAGENTS: [&str; 3] = ["Reagent A", "Reagent B", "Reagent C"];
const WELLS: [&str; 4] = ["A1", "A2", "B1", "B2"];

fn steps_to_events(steps: &[Step]) -> Vec<TimelineEvent> {
    let mut held = REAGENTS[0];
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let ts = format_clock(i as f64 * 2.0);
            match step {
                Step::Aspirate(r) => {
                    held = REAGENTS[*r];
                    aspirate(&ts, held, 10.0 + *r as f64 * 5.0)
                }
                Step::Dispense(w) => dispense(&ts, held, WELLS[*w]),
                Step::Eject => tip_change(&ts, true, false),
                Step::NewTip => tip_change(&ts, true, true),
                Step::Pickup => tip_change(&ts, false, true),
            }
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Replaying the same events with the same seed yields the same state
    #[test]
    fn property_replay_is_deterministic(steps in arb_steps(), seed in any::<u64>()) {
        let events = steps_to_events(&steps);
        let engine = ReplayEngine::builder().with_seed(seed).build().unwrap();

        let a = engine.replay(ExperimentState::new("det"), &events).unwrap();
        let b = engine.replay(ExperimentState::new("det"), &events).unwrap();

        prop_assert_eq!(a.final_state, b.final_state);
        prop_assert_eq!(a.trace, b.trace);
    }

    /// Every well's total equals the sum of its reagents
    #[test]
    fn property_well_volume_invariant(steps in arb_steps()) {
        let events = steps_to_events(&steps);
        let result = ReplayEngine::default()
            .replay(ExperimentState::new("vol"), &events)
            .unwrap();

        for well in result.final_state.wells.values() {
            let sum: f64 = well.reagents.iter().map(|r| r.volume_ul).sum();
            prop_assert!((well.total_volume_ul - sum).abs() < 1e-6);
        }
        prop_assert!(result.final_state.validate().is_ok());
    }

    /// Tip contamination only goes down right after an eject
    #[test]
    fn property_tip_contamination_is_monotonic(steps in arb_steps()) {
        let events = steps_to_events(&steps);
        let engine = ReplayEngine::default();
        let mut state = ExperimentState::new("mono");
        let mut previous = state.pipette.tip_contamination_level;

        for event in &events {
            engine.replay_into(&mut state, std::slice::from_ref(event)).unwrap();
            let current = state.pipette.tip_contamination_level;
            let ejected = matches!(&event.event, LabEvent::TipChange(change) if change.ejected);
            if !ejected {
                prop_assert!(current.rank() >= previous.rank());
            }
            previous = current;
        }
    }

    /// Recomputing derived metrics changes nothing
    #[test]
    fn property_derived_metrics_idempotent(steps in arb_steps()) {
        let events = steps_to_events(&steps);
        let config = ReplayConfig::default();
        let mut state = ReplayEngine::default()
            .replay(ExperimentState::new("idem"), &events)
            .unwrap()
            .final_state;

        state.refresh_derived(config.completion_tolerance_ul);
        let once = state.clone();
        state.refresh_derived(config.completion_tolerance_ul);

        prop_assert_eq!(once, state);
    }
}
