//! Typed events recorded in the event log.
//!
//! Events are immutable once built: fields are private and constructors
//! validate everything the persisted format cannot carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Foreground/background state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

impl AppState {
    /// Integer value used in the persisted record.
    pub fn raw_value(self) -> i64 {
        match self {
            AppState::Active => 0,
            AppState::Inactive => 1,
            AppState::Background => 2,
        }
    }

    pub fn from_raw_value(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(AppState::Active),
            1 => Some(AppState::Inactive),
            2 => Some(AppState::Background),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self == AppState::Active
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppState::Active => write!(f, "active"),
            AppState::Inactive => write!(f, "inactive"),
            AppState::Background => write!(f, "background"),
        }
    }
}

impl FromStr for AppState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(AppState::Active),
            "inactive" => Ok(AppState::Inactive),
            "background" => Ok(AppState::Background),
            other => Err(EventError::UnknownAppState(other.to_string())),
        }
    }
}

/// A scalar payload value.
///
/// Only values the persisted format can represent exactly are allowed.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Text(String),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Flag(bool),
}

impl PayloadValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PayloadValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn check(&self, key: &str) -> Result<(), EventError> {
        match self {
            PayloadValue::Number(n) if !n.is_finite() => Err(EventError::NonFiniteNumber {
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PayloadValue::Text(s) => serde_json::Value::String(s.clone()),
            PayloadValue::Number(n) => serde_json::json!(n),
            PayloadValue::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            PayloadValue::Flag(b) => serde_json::Value::Bool(*b),
        }
    }
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::Text(s) => write!(f, "{s}"),
            PayloadValue::Number(n) => write!(f, "{n}"),
            PayloadValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            PayloadValue::Flag(b) => write!(f, "{b}"),
        }
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        PayloadValue::Number(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Flag(value)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Text(value)
    }
}

impl From<DateTime<Utc>> for PayloadValue {
    fn from(value: DateTime<Utc>) -> Self {
        PayloadValue::Timestamp(value)
    }
}

impl TryFrom<serde_json::Value> for PayloadValue {
    type Error = EventError;

    /// Accepts JSON scalars only. Nulls, arrays and objects have no scalar
    /// representation and are rejected.
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::String(s) => Ok(PayloadValue::Text(s)),
            serde_json::Value::Bool(b) => Ok(PayloadValue::Flag(b)),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(PayloadValue::Number)
                .ok_or_else(|| EventError::UnsupportedPayload(n.to_string())),
            serde_json::Value::Null => Err(EventError::UnsupportedPayload("null".to_string())),
            serde_json::Value::Array(_) => {
                Err(EventError::UnsupportedPayload("array".to_string()))
            }
            serde_json::Value::Object(_) => {
                Err(EventError::UnsupportedPayload("object".to_string()))
            }
        }
    }
}

/// Payload attached to a sensor event.
pub type Payload = BTreeMap<String, PayloadValue>;

/// Build a payload from a JSON object, rejecting non-scalar members.
pub fn payload_from_json(value: serde_json::Value) -> Result<Payload, EventError> {
    let serde_json::Value::Object(map) = value else {
        return Err(EventError::UnsupportedPayload(
            "payload must be an object".to_string(),
        ));
    };

    map.into_iter()
        .map(|(key, value)| PayloadValue::try_from(value).map(|v| (key, v)))
        .collect()
}

/// A reading delivered by the sensor subsystem for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    sample_type: String,
    received_at: DateTime<Utc>,
    app_state: AppState,
    payload: Payload,
}

impl SensorEvent {
    /// Create an event stamped with the current wall-clock time.
    pub fn new(
        sample_type: impl Into<String>,
        app_state: AppState,
        payload: Payload,
    ) -> Result<Self, EventError> {
        Self::at(sample_type, Utc::now(), app_state, payload)
    }

    /// Create an event with an explicit receive time.
    pub fn at(
        sample_type: impl Into<String>,
        received_at: DateTime<Utc>,
        app_state: AppState,
        payload: Payload,
    ) -> Result<Self, EventError> {
        let sample_type = sample_type.into();
        if sample_type.trim().is_empty() {
            return Err(EventError::EmptySampleType);
        }
        for (key, value) in &payload {
            value.check(key)?;
        }

        Ok(Self {
            sample_type,
            received_at,
            app_state,
            payload,
        })
    }

    /// Shorthand for the common single-scalar payload `{"value": n}`.
    pub fn with_value(
        sample_type: impl Into<String>,
        app_state: AppState,
        value: f64,
    ) -> Result<Self, EventError> {
        let mut payload = Payload::new();
        payload.insert(VALUE_KEY.to_string(), PayloadValue::Number(value));
        Self::new(sample_type, app_state, payload)
    }

    pub fn sample_type(&self) -> &str {
        &self.sample_type
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn app_state(&self) -> AppState {
        self.app_state
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The `value` payload entry, if numeric.
    pub fn value(&self) -> Option<f64> {
        self.payload.get(VALUE_KEY).and_then(PayloadValue::as_number)
    }
}

/// Payload key under which aggregate results are stored.
pub const VALUE_KEY: &str = "value";

/// A host application lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    received_at: DateTime<Utc>,
    description: String,
}

impl LifecycleEvent {
    pub fn new(description: impl Into<String>) -> Self {
        Self::at(Utc::now(), description)
    }

    pub fn at(received_at: DateTime<Utc>, description: impl Into<String>) -> Self {
        Self {
            received_at,
            description: description.into(),
        }
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Any event stored in the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Sensor(SensorEvent),
    Lifecycle(LifecycleEvent),
}

impl Event {
    pub fn received_at(&self) -> DateTime<Utc> {
        match self {
            Event::Sensor(e) => e.received_at(),
            Event::Lifecycle(e) => e.received_at(),
        }
    }

    /// Short title naming the originating channel or the variant.
    pub fn title(&self) -> String {
        match self {
            Event::Sensor(e) => e.sample_type().to_string(),
            Event::Lifecycle(_) => "Lifecycle".to_string(),
        }
    }

    /// Plain JSON rendering used for exports.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Event::Sensor(e) => {
                let payload: serde_json::Map<String, serde_json::Value> = e
                    .payload()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::json!({
                    "type": "sensor",
                    "sample_type": e.sample_type(),
                    "received_at": e.received_at().to_rfc3339(),
                    "app_state": e.app_state(),
                    "payload": payload,
                })
            }
            Event::Lifecycle(e) => serde_json::json!({
                "type": "lifecycle",
                "description": e.description(),
                "received_at": e.received_at().to_rfc3339(),
            }),
        }
    }
}

impl From<SensorEvent> for Event {
    fn from(event: SensorEvent) -> Self {
        Event::Sensor(event)
    }
}

impl From<LifecycleEvent> for Event {
    fn from(event: LifecycleEvent) -> Self {
        Event::Lifecycle(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Sensor(e) => {
                write!(
                    f,
                    "{} at {} ({})",
                    e.sample_type(),
                    e.received_at().format("%Y-%m-%d %H:%M:%S"),
                    e.app_state()
                )?;
                for (key, value) in e.payload() {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
            Event::Lifecycle(e) => write!(
                f,
                "{} at {}",
                e.description(),
                e.received_at().format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }
}

/// Errors raised while building events.
#[derive(Debug, Clone, PartialEq)]
pub enum EventError {
    EmptySampleType,
    NonFiniteNumber { key: String },
    UnsupportedPayload(String),
    UnknownAppState(String),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::EmptySampleType => write!(f, "Sample type must not be empty"),
            EventError::NonFiniteNumber { key } => {
                write!(f, "Payload value for '{key}' is not a finite number")
            }
            EventError::UnsupportedPayload(kind) => {
                write!(f, "Unsupported payload value: {kind}")
            }
            EventError::UnknownAppState(s) => write!(f, "Unknown application state: {s}"),
        }
    }
}

impl std::error::Error for EventError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_app_state_raw_values() {
        for state in [AppState::Active, AppState::Inactive, AppState::Background] {
            assert_eq!(AppState::from_raw_value(state.raw_value()), Some(state));
        }
        assert_eq!(AppState::from_raw_value(7), None);
        assert_eq!("Background".parse::<AppState>(), Ok(AppState::Background));
    }

    #[test]
    fn test_sensor_event_rejects_empty_sample_type() {
        let result = SensorEvent::with_value("  ", AppState::Active, 1.0);
        assert_eq!(result, Err(EventError::EmptySampleType));
    }

    #[test]
    fn test_sensor_event_rejects_non_finite_numbers() {
        let result = SensorEvent::with_value("stepCount", AppState::Active, f64::NAN);
        assert!(matches!(result, Err(EventError::NonFiniteNumber { .. })));
    }

    #[test]
    fn test_payload_from_json_scalars_only() {
        let payload = payload_from_json(json!({"value": 12.5, "unit": "count", "ok": true}))
            .expect("scalar payload");
        assert_eq!(payload.get("value"), Some(&PayloadValue::Number(12.5)));
        assert_eq!(payload.get("ok"), Some(&PayloadValue::Flag(true)));

        assert!(payload_from_json(json!({"nested": {"a": 1}})).is_err());
        assert!(payload_from_json(json!({"list": [1, 2]})).is_err());
        assert!(payload_from_json(json!({"missing": null})).is_err());
        assert!(payload_from_json(json!([1])).is_err());
    }

    #[test]
    fn test_event_title_and_description() {
        let event = Event::from(
            SensorEvent::with_value("stepCount", AppState::Background, 1500.0).unwrap(),
        );
        assert_eq!(event.title(), "stepCount");
        let text = event.to_string();
        assert!(text.contains("background"));
        assert!(text.contains("value=1500"));

        let lifecycle = Event::from(LifecycleEvent::new("Application became active"));
        assert_eq!(lifecycle.title(), "Lifecycle");
        assert!(lifecycle.to_string().starts_with("Application became active"));
    }

    #[test]
    fn test_event_json_export_shape() {
        let event = Event::from(
            SensorEvent::with_value("sleepAnalysis", AppState::Inactive, 7.5).unwrap(),
        );
        let json = event.to_json();
        assert_eq!(json["type"], "sensor");
        assert_eq!(json["sample_type"], "sleepAnalysis");
        assert_eq!(json["app_state"], "inactive");
        assert_eq!(json["payload"]["value"], 7.5);

        let lifecycle = Event::from(LifecycleEvent::new("Application entered background")).to_json();
        assert_eq!(lifecycle["type"], "lifecycle");
        assert_eq!(lifecycle["description"], "Application entered background");
    }
}
