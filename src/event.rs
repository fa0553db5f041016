//! Typed oracle events and their coercion from untyped JSON records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ValidationError;
use crate::traits::TimedEvent;
use crate::types::Reagent;

/// Timeline tag for each event variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PipetteSetting,
    Aspiration,
    Dispensing,
    TipChange,
    Warning,
    WellState,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::PipetteSetting,
        EventKind::Aspiration,
        EventKind::Dispensing,
        EventKind::TipChange,
        EventKind::Warning,
        EventKind::WellState,
    ];

    /// Display priority among events starting at the same time. Higher wins.
    pub fn priority(self) -> u8 {
        match self {
            EventKind::Warning => 4,
            EventKind::Dispensing | EventKind::Aspiration => 3,
            EventKind::WellState => 2,
            EventKind::PipetteSetting => 1,
            EventKind::TipChange => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PipetteSetting => "pipette_setting",
            EventKind::Aspiration => "aspiration",
            EventKind::Dispensing => "dispensing",
            EventKind::TipChange => "tip_change",
            EventKind::Warning => "warning",
            EventKind::WellState => "well_state",
        }
    }

    /// Name of the event model carried in `event_model_type`
    pub fn model_type(self) -> &'static str {
        match self {
            EventKind::PipetteSetting => "PipetteSettingChange",
            EventKind::Aspiration => "AspirationEvent",
            EventKind::Dispensing => "DispensingEvent",
            EventKind::TipChange => "TipChangeEvent",
            EventKind::Warning => "WarningEvent",
            EventKind::WellState => "WellStateEvent",
        }
    }

    /// Resolve either a timeline tag or a model type name
    pub fn from_tag(tag: &str) -> Option<EventKind> {
        let tag = tag.trim();
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag) || kind.model_type() == tag)
            .or(match tag {
                "volume_change" => Some(EventKind::PipetteSetting),
                "aspirate" => Some(EventKind::Aspiration),
                "dispense" => Some(EventKind::Dispensing),
                _ => None,
            })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipetteSettingChange {
    #[serde(default)]
    pub thinking: String,
    pub timestamp_range: String,
    pub new_setting_ul: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspirationEvent {
    #[serde(default)]
    pub thinking: String,
    pub timestamp_range: String,
    pub reagent_name: String,
    pub volume_ul: f64,
    pub source_container: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispensingEvent {
    #[serde(default)]
    pub thinking: String,
    pub timestamp_range: String,
    pub reagent: Reagent,
    pub volume_ul: f64,
    pub destination_well: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipChangeEvent {
    #[serde(default)]
    pub thinking: String,
    pub timestamp_range: String,
    pub ejected: bool,
    pub new_tip_attached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningEvent {
    #[serde(default)]
    pub thinking: String,
    pub timestamp_range: String,
    pub warning_message: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellStateEvent {
    #[serde(default)]
    pub thinking: String,
    pub timestamp_range: String,
    pub well_id: String,
    pub is_complete: bool,
    #[serde(default)]
    pub current_contents: Vec<Reagent>,
    #[serde(default)]
    pub missing_reagents: Vec<String>,
}

fn require_text(kind: EventKind, field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            event_kind: kind.to_string(),
            field: field.to_string(),
        });
    }
    Ok(())
}

fn require_volume(field: &str, value: f64, allow_zero: bool) -> Result<(), ValidationError> {
    let valid = value.is_finite() && (value > 0.0 || (allow_zero && value == 0.0));
    if !valid {
        return Err(ValidationError::InvalidField {
            field: field.to_string(),
            reason: format!("volume {} is not usable", value),
        });
    }
    Ok(())
}

impl TimedEvent for PipetteSettingChange {
    fn timestamp_range(&self) -> &str {
        &self.timestamp_range
    }

    fn rationale(&self) -> &str {
        &self.thinking
    }

    fn kind(&self) -> EventKind {
        EventKind::PipetteSetting
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(self.kind(), "timestamp_range", &self.timestamp_range)?;
        require_volume("new_setting_ul", self.new_setting_ul, false)
    }
}

impl TimedEvent for AspirationEvent {
    fn timestamp_range(&self) -> &str {
        &self.timestamp_range
    }

    fn rationale(&self) -> &str {
        &self.thinking
    }

    fn kind(&self) -> EventKind {
        EventKind::Aspiration
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(self.kind(), "timestamp_range", &self.timestamp_range)?;
        require_text(self.kind(), "reagent_name", &self.reagent_name)?;
        require_volume("volume_ul", self.volume_ul, true)
    }
}

impl TimedEvent for DispensingEvent {
    fn timestamp_range(&self) -> &str {
        &self.timestamp_range
    }

    fn rationale(&self) -> &str {
        &self.thinking
    }

    fn kind(&self) -> EventKind {
        EventKind::Dispensing
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(self.kind(), "timestamp_range", &self.timestamp_range)?;
        require_text(self.kind(), "reagent", &self.reagent.name)?;
        require_text(self.kind(), "destination_well", &self.destination_well)?;
        require_volume("volume_ul", self.volume_ul, true)
    }
}

impl TimedEvent for TipChangeEvent {
    fn timestamp_range(&self) -> &str {
        &self.timestamp_range
    }

    fn rationale(&self) -> &str {
        &self.thinking
    }

    fn kind(&self) -> EventKind {
        EventKind::TipChange
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(self.kind(), "timestamp_range", &self.timestamp_range)
    }
}

impl TimedEvent for WarningEvent {
    fn timestamp_range(&self) -> &str {
        &self.timestamp_range
    }

    fn rationale(&self) -> &str {
        &self.thinking
    }

    fn kind(&self) -> EventKind {
        EventKind::Warning
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(self.kind(), "timestamp_range", &self.timestamp_range)?;
        require_text(self.kind(), "warning_message", &self.warning_message)
    }
}

impl TimedEvent for WellStateEvent {
    fn timestamp_range(&self) -> &str {
        &self.timestamp_range
    }

    fn rationale(&self) -> &str {
        &self.thinking
    }

    fn kind(&self) -> EventKind {
        EventKind::WellState
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_text(self.kind(), "timestamp_range", &self.timestamp_range)?;
        require_text(self.kind(), "well_id", &self.well_id)
    }
}

/// Closed set of oracle event variants
#[derive(Debug, Clone, PartialEq)]
pub enum LabEvent {
    PipetteSetting(PipetteSettingChange),
    Aspiration(AspirationEvent),
    Dispensing(DispensingEvent),
    TipChange(TipChangeEvent),
    Warning(WarningEvent),
    WellState(WellStateEvent),
}

impl LabEvent {
    fn inner(&self) -> &dyn TimedEvent {
        match self {
            LabEvent::PipetteSetting(e) => e,
            LabEvent::Aspiration(e) => e,
            LabEvent::Dispensing(e) => e,
            LabEvent::TipChange(e) => e,
            LabEvent::Warning(e) => e,
            LabEvent::WellState(e) => e,
        }
    }

    /// Short title for overlays
    pub fn title(&self) -> String {
        match self {
            LabEvent::PipetteSetting(e) => format!("Set to {}µL", e.new_setting_ul),
            LabEvent::Aspiration(e) => format!("Aspirate {}", e.reagent_name),
            LabEvent::Dispensing(e) => format!("Dispense {}", e.reagent.name),
            LabEvent::TipChange(_) => "Tip Change".to_string(),
            LabEvent::Warning(e) => e.warning_message.clone(),
            LabEvent::WellState(e) => {
                let status = if e.is_complete { "Complete" } else { "Partial" };
                format!("Well {}: {}", e.well_id, status)
            }
        }
    }

    /// Longer human-readable description
    pub fn description(&self) -> String {
        match self {
            LabEvent::PipetteSetting(e) => {
                format!("Pipette volume adjusted to {} microliters", e.new_setting_ul)
            }
            LabEvent::Aspiration(e) => format!(
                "Drew {}µL of {} from {}",
                e.volume_ul, e.reagent_name, e.source_container
            ),
            LabEvent::Dispensing(e) => format!(
                "Added {}µL of {} to {}",
                e.volume_ul, e.reagent.name, e.destination_well
            ),
            LabEvent::TipChange(e) => match (e.ejected, e.new_tip_attached) {
                (true, true) => "Tip ejected and new tip attached".to_string(),
                (true, false) => "Tip ejected".to_string(),
                (false, true) => "New tip attached".to_string(),
                (false, false) => "Pipette tip attached/removed".to_string(),
            },
            LabEvent::Warning(e) => {
                if e.description.is_empty() {
                    e.warning_message.clone()
                } else {
                    e.description.clone()
                }
            }
            LabEvent::WellState(e) => {
                let names: Vec<&str> = e.current_contents.iter().map(|r| r.name.as_str()).collect();
                format!("Contains: {}", names.join(", "))
            }
        }
    }

    /// Serialize the variant payload alone, as carried in `event_model`
    pub fn to_model_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            LabEvent::PipetteSetting(e) => serde_json::to_value(e),
            LabEvent::Aspiration(e) => serde_json::to_value(e),
            LabEvent::Dispensing(e) => serde_json::to_value(e),
            LabEvent::TipChange(e) => serde_json::to_value(e),
            LabEvent::Warning(e) => serde_json::to_value(e),
            LabEvent::WellState(e) => serde_json::to_value(e),
        }
    }

    /// Rebuild a variant from its `event_model` payload and `event_model_type`
    pub fn from_model_value(model_type: &str, model: Value) -> Result<LabEvent, ValidationError> {
        let kind = EventKind::from_tag(model_type).ok_or_else(|| ValidationError::UnknownShape {
            reason: format!("unknown event model type '{}'", model_type),
        })?;
        let invalid = |e: serde_json::Error| ValidationError::InvalidField {
            field: "event_model".to_string(),
            reason: e.to_string(),
        };
        let event = match kind {
            EventKind::PipetteSetting => LabEvent::PipetteSetting(serde_json::from_value(model).map_err(invalid)?),
            EventKind::Aspiration => LabEvent::Aspiration(serde_json::from_value(model).map_err(invalid)?),
            EventKind::Dispensing => LabEvent::Dispensing(serde_json::from_value(model).map_err(invalid)?),
            EventKind::TipChange => LabEvent::TipChange(serde_json::from_value(model).map_err(invalid)?),
            EventKind::Warning => LabEvent::Warning(serde_json::from_value(model).map_err(invalid)?),
            EventKind::WellState => LabEvent::WellState(serde_json::from_value(model).map_err(invalid)?),
        };
        event.validate()?;
        Ok(event)
    }
}

impl TimedEvent for LabEvent {
    fn timestamp_range(&self) -> &str {
        self.inner().timestamp_range()
    }

    fn rationale(&self) -> &str {
        self.inner().rationale()
    }

    fn kind(&self) -> EventKind {
        self.inner().kind()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.inner().validate()
    }
}

/// Decide whether a record holding only a reagent describes an aspiration
/// or a dispense, based on the oracle's reasoning text.
pub fn classify_reagent_event(thinking: &str) -> EventKind {
    let lowered = thinking.to_lowercase();
    if lowered.contains("aspirat") {
        EventKind::Aspiration
    } else {
        EventKind::Dispensing
    }
}

/// Determine which variant an untyped record describes.
///
/// An explicit discriminator wins; otherwise shapes are tried in a fixed
/// priority order and the first match is taken.
pub fn detect_kind(record: &Map<String, Value>) -> Result<EventKind, ValidationError> {
    for key in ["event_model_type", "event_type"] {
        if let Some(tag) = record.get(key).and_then(Value::as_str) {
            return EventKind::from_tag(tag).ok_or_else(|| ValidationError::UnknownShape {
                reason: format!("unknown discriminator '{}'", tag),
            });
        }
    }

    let has = |key: &str| record.contains_key(key);

    if has("new_setting_ul") || has("new_setting") || has("new_volume") {
        return Ok(EventKind::PipetteSetting);
    }
    if has("warning_message") {
        return Ok(EventKind::Warning);
    }
    if has("well_id") && (has("is_complete") || has("current_contents") || has("missing_reagents")) {
        return Ok(EventKind::WellState);
    }
    if has("destination_well") || has("target_well") {
        return Ok(EventKind::Dispensing);
    }
    if has("reagent_name") || has("source_container") || has("container") {
        return Ok(EventKind::Aspiration);
    }
    if has("reagent") {
        let thinking = record.get("thinking").and_then(Value::as_str).unwrap_or_default();
        return Ok(classify_reagent_event(thinking));
    }
    if has("well_id") {
        return Ok(EventKind::WellState);
    }
    if has("ejected") || has("new_tip_attached") || has("action") || has("timestamp_range") {
        return Ok(EventKind::TipChange);
    }

    Err(ValidationError::UnknownShape {
        reason: "record matches no event variant".to_string(),
    })
}

/// Coerce one untyped oracle record into a typed event.
///
/// `hint` is the kind the originating query asked for. It is used when the
/// record carries no discriminator of its own.
pub fn parse_record(record: &Value, hint: Option<EventKind>) -> Result<LabEvent, ValidationError> {
    let obj = record.as_object().ok_or_else(|| ValidationError::UnknownShape {
        reason: "event record is not a JSON object".to_string(),
    })?;

    let has_discriminator = ["event_model_type", "event_type"]
        .iter()
        .any(|key| obj.get(*key).map_or(false, Value::is_string));

    let kind = match hint {
        Some(kind) if !has_discriminator => kind,
        _ => detect_kind(obj)?,
    };

    let fields = RecordFields { obj, kind };
    let thinking = fields.text(&["thinking", "rationale"]).unwrap_or_default();
    let timestamp_range = fields.required_text(&["timestamp_range", "timestamp"])?;

    let event = match kind {
        EventKind::PipetteSetting => LabEvent::PipetteSetting(PipetteSettingChange {
            thinking,
            timestamp_range,
            new_setting_ul: fields.required_volume(&["new_setting_ul", "new_setting", "new_volume"])?,
        }),
        EventKind::Aspiration => {
            let reagent = fields.reagent()?;
            let reagent_name = fields
                .text(&["reagent_name"])
                .or_else(|| reagent.as_ref().map(|r| r.name.clone()))
                .ok_or_else(|| fields.missing("reagent_name"))?;
            let volume_ul = match fields.volume(&["volume_ul", "volume"])? {
                Some(volume) => volume,
                None => reagent.map_or(0.0, |r| r.volume_ul),
            };
            LabEvent::Aspiration(AspirationEvent {
                thinking,
                timestamp_range,
                reagent_name,
                volume_ul,
                source_container: fields
                    .text(&["source_container", "container", "source"])
                    .unwrap_or_else(|| "unknown".to_string()),
            })
        }
        EventKind::Dispensing => {
            let reagent = match fields.reagent()? {
                Some(reagent) => reagent,
                None => {
                    let name = fields
                        .text(&["reagent_name"])
                        .ok_or_else(|| fields.missing("reagent"))?;
                    Reagent::new(name, 0.0)
                }
            };
            let volume_ul = fields.volume(&["volume_ul", "volume"])?.unwrap_or(reagent.volume_ul);
            LabEvent::Dispensing(DispensingEvent {
                thinking,
                timestamp_range,
                reagent,
                volume_ul,
                destination_well: fields.required_text(&["destination_well", "target_well", "well_id", "well"])?,
            })
        }
        EventKind::TipChange => {
            let action = fields.text(&["action"]).map(|a| a.to_lowercase());
            let explicit_eject = fields.flag(&["ejected"]);
            let explicit_pickup = fields.flag(&["new_tip_attached", "new_tip"]);
            let (ejected, new_tip_attached) = match (action.as_deref(), explicit_eject, explicit_pickup) {
                (_, Some(e), Some(p)) => (e, p),
                (Some("eject"), e, p) => (e.unwrap_or(true), p.unwrap_or(false)),
                (Some("pickup"), e, p) => (e.unwrap_or(false), p.unwrap_or(true)),
                (_, e, p) => (e.unwrap_or(true), p.unwrap_or(true)),
            };
            LabEvent::TipChange(TipChangeEvent {
                thinking,
                timestamp_range,
                ejected,
                new_tip_attached,
            })
        }
        EventKind::Warning => LabEvent::Warning(WarningEvent {
            thinking,
            timestamp_range,
            warning_message: fields.required_text(&["warning_message", "message", "warning"])?,
            description: fields.text(&["description"]).unwrap_or_default(),
            severity: fields.text(&["severity"]),
        }),
        EventKind::WellState => LabEvent::WellState(WellStateEvent {
            thinking,
            timestamp_range,
            well_id: fields.required_text(&["well_id", "well"])?,
            is_complete: fields.flag(&["is_complete", "complete"]).unwrap_or(false),
            current_contents: fields.reagent_list("current_contents")?,
            missing_reagents: fields.name_list("missing_reagents"),
        }),
    };

    event.validate()?;
    Ok(event)
}

struct RecordFields<'a> {
    obj: &'a Map<String, Value>,
    kind: EventKind,
}

impl<'a> RecordFields<'a> {
    fn missing(&self, field: &str) -> ValidationError {
        ValidationError::MissingField {
            event_kind: self.kind.to_string(),
            field: field.to_string(),
        }
    }

    fn first<'n>(&self, names: &[&'n str]) -> Option<(&'n str, &'a Value)> {
        names
            .iter()
            .find_map(|name| self.obj.get(*name).filter(|v| !v.is_null()).map(|v| (*name, v)))
    }

    fn text(&self, names: &[&str]) -> Option<String> {
        match self.first(names)? {
            (_, Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            (_, Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn required_text(&self, names: &[&str]) -> Result<String, ValidationError> {
        self.text(names).ok_or_else(|| self.missing(names[0]))
    }

    fn volume(&self, names: &[&str]) -> Result<Option<f64>, ValidationError> {
        match self.first(names) {
            None => Ok(None),
            Some((name, value)) => coerce_volume(name, value).map(Some),
        }
    }

    fn required_volume(&self, names: &[&str]) -> Result<f64, ValidationError> {
        self.volume(names)?.ok_or_else(|| self.missing(names[0]))
    }

    fn flag(&self, names: &[&str]) -> Option<bool> {
        match self.first(names)? {
            (_, Value::Bool(b)) => Some(*b),
            (_, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn reagent(&self) -> Result<Option<Reagent>, ValidationError> {
        match self.first(&["reagent"]) {
            None => Ok(None),
            Some((_, value)) => coerce_reagent(value).map(Some),
        }
    }

    fn reagent_list(&self, name: &str) -> Result<Vec<Reagent>, ValidationError> {
        match self.obj.get(name) {
            Some(Value::Array(items)) => items.iter().map(coerce_reagent).collect(),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(ValidationError::InvalidField {
                field: name.to_string(),
                reason: "expected a list of reagents".to_string(),
            }),
        }
    }

    fn name_list(&self, name: &str) -> Vec<String> {
        match self.obj.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn coerce_reagent(value: &Value) -> Result<Reagent, ValidationError> {
    match value {
        Value::String(name) if !name.trim().is_empty() => Ok(Reagent::new(name.trim(), 0.0)),
        Value::Object(obj) => {
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| ValidationError::MissingField {
                    event_kind: "reagent".to_string(),
                    field: "name".to_string(),
                })?;
            let volume = match obj.get("volume_ul").or_else(|| obj.get("volume")) {
                Some(v) if !v.is_null() => coerce_volume("volume_ul", v)?,
                _ => 0.0,
            };
            Ok(Reagent::new(name.trim(), volume))
        }
        _ => Err(ValidationError::InvalidField {
            field: "reagent".to_string(),
            reason: "expected a reagent object or name".to_string(),
        }),
    }
}

/// Accept plain numbers and strings such as `"30µL"` or `"30 uL"`
pub fn coerce_volume(field: &str, value: &Value) -> Result<f64, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField {
        field: field.to_string(),
        reason,
    };
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(format!("{} is not a number", n))),
        Value::String(s) => {
            let numeric: String = s
                .trim()
                .trim_end_matches(|c: char| c.is_alphabetic() || c == 'µ' || c == 'μ' || c.is_whitespace())
                .to_string();
            numeric
                .parse::<f64>()
                .map_err(|_| invalid(format!("'{}' is not a volume", s)))
        }
        other => Err(invalid(format!("unexpected value {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_table() {
        assert_eq!(EventKind::Warning.priority(), 4);
        assert_eq!(EventKind::Dispensing.priority(), EventKind::Aspiration.priority());
        assert!(EventKind::WellState.priority() > EventKind::PipetteSetting.priority());
        assert_eq!(EventKind::TipChange.priority(), 0);
    }

    #[test]
    fn test_from_tag_accepts_both_forms() {
        assert_eq!(EventKind::from_tag("dispensing"), Some(EventKind::Dispensing));
        assert_eq!(EventKind::from_tag("WellStateEvent"), Some(EventKind::WellState));
        assert_eq!(EventKind::from_tag("volume_change"), Some(EventKind::PipetteSetting));
        assert_eq!(EventKind::from_tag("nonsense"), None);
    }

    #[test]
    fn test_classify_reagent_event() {
        assert_eq!(
            classify_reagent_event("The user aspirates Reagent A from tube"),
            EventKind::Aspiration
        );
        assert_eq!(
            classify_reagent_event("Liquid is expelled into the well"),
            EventKind::Dispensing
        );
    }

    #[test]
    fn test_parse_setting_with_unit_string() {
        let record = json!({"timestamp_range": "0:05", "new_setting_ul": "30µL"});
        let event = parse_record(&record, None).unwrap();
        match event {
            LabEvent::PipetteSetting(e) => assert_eq!(e.new_setting_ul, 30.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_aspiration_from_reagent_object() {
        let record = json!({
            "thinking": "aspiration of reagent A",
            "timestamp_range": "0:10 - 0:12",
            "reagent": {"name": "Reagent A", "volume_ul": 30}
        });
        let event = parse_record(&record, None).unwrap();
        match event {
            LabEvent::Aspiration(e) => {
                assert_eq!(e.reagent_name, "Reagent A");
                assert_eq!(e.volume_ul, 30.0);
                assert_eq!(e.source_container, "unknown");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_dispense_requires_reagent() {
        let record = json!({"timestamp_range": "0:10", "destination_well": "A1", "volume_ul": 10});
        let err = parse_record(&record, Some(EventKind::Dispensing)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref field, .. } if field == "reagent"));
    }

    #[test]
    fn test_parse_tip_change_actions() {
        let eject = parse_record(&json!({"timestamp_range": "0:30", "action": "eject"}), Some(EventKind::TipChange)).unwrap();
        assert_eq!(
            eject,
            LabEvent::TipChange(TipChangeEvent {
                thinking: String::new(),
                timestamp_range: "0:30".to_string(),
                ejected: true,
                new_tip_attached: false,
            })
        );

        let pickup = parse_record(&json!({"timestamp_range": "0:31", "action": "pickup"}), Some(EventKind::TipChange)).unwrap();
        match pickup {
            LabEvent::TipChange(e) => assert!(!e.ejected && e.new_tip_attached),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_discriminator_overrides_hint() {
        let record = json!({
            "event_model_type": "WarningEvent",
            "timestamp_range": "0:40",
            "warning_message": "Tip touched bench"
        });
        let event = parse_record(&record, Some(EventKind::Aspiration)).unwrap();
        assert_eq!(event.kind(), EventKind::Warning);
    }

    #[test]
    fn test_warning_type_field_is_not_a_discriminator() {
        let record = json!({
            "timestamp_range": "0:05",
            "type": "cross_contamination",
            "warning_message": "Tip reused",
            "severity": "high"
        });

        match parse_record(&record, Some(EventKind::Warning)).unwrap() {
            LabEvent::Warning(e) => assert_eq!(e.severity.as_deref(), Some("high")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_record(&record, None).unwrap().kind(), EventKind::Warning);
    }

    #[test]
    fn test_unknown_shape_rejected() {
        let err = parse_record(&json!({"foo": 1}), None).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownShape { .. }));
        assert!(parse_record(&json!([1, 2]), None).is_err());
    }

    #[test]
    fn test_model_value_round_trip() {
        let event = LabEvent::WellState(WellStateEvent {
            thinking: "well looks done".to_string(),
            timestamp_range: "1:00".to_string(),
            well_id: "A1".to_string(),
            is_complete: true,
            current_contents: vec![Reagent::new("Reagent A", 30.0)],
            missing_reagents: vec![],
        });
        let value = event.to_model_value().unwrap();
        let back = LabEvent::from_model_value(event.kind().model_type(), value).unwrap();
        assert_eq!(event, back);
        assert_eq!(back.title(), "Well A1: Complete");
    }
}
