//! Mapping between [`Event`] values and property-list records.
//!
//! # Record layout
//!
//! ```text
//! { "type": "SensorEvent", "schemaVersion": 1, "sampleType": "stepCount",
//!   "receivedAt": <date>, "appState": 2, "payload": { "value": 1500.0 } }
//!
//! { "type": "LifecycleEvent", "schemaVersion": 1, "receivedAt": <date>,
//!   "description": "Application became active" }
//! ```
//!
//! A record missing its discriminator or a required field decodes to `None`.
//! A record naming a type or schema version this build does not know is an
//! error: the log only ever contains this program's own writes, so an
//! unknown tag means the data came from an incompatible build.

use super::value::{PlistValue, Record};
use super::CodecError;
use crate::event::{AppState, Event, LifecycleEvent, Payload, PayloadValue, SensorEvent};

/// Current record schema version.
pub const SCHEMA_VERSION: i64 = 1;

const TYPE_KEY: &str = "type";
const VERSION_KEY: &str = "schemaVersion";
const SAMPLE_TYPE_KEY: &str = "sampleType";
const RECEIVED_AT_KEY: &str = "receivedAt";
const APP_STATE_KEY: &str = "appState";
const PAYLOAD_KEY: &str = "payload";
const DESCRIPTION_KEY: &str = "description";

const SENSOR_TAG: &str = "SensorEvent";
const LIFECYCLE_TAG: &str = "LifecycleEvent";

/// Encode an event into its record form.
pub fn encode(event: &Event) -> PlistValue {
    let mut record = Record::new();
    record.insert(VERSION_KEY.to_string(), PlistValue::Integer(SCHEMA_VERSION));
    record.insert(
        RECEIVED_AT_KEY.to_string(),
        PlistValue::Date(event.received_at()),
    );

    match event {
        Event::Sensor(e) => {
            record.insert(TYPE_KEY.to_string(), PlistValue::String(SENSOR_TAG.to_string()));
            record.insert(
                SAMPLE_TYPE_KEY.to_string(),
                PlistValue::String(e.sample_type().to_string()),
            );
            record.insert(
                APP_STATE_KEY.to_string(),
                PlistValue::Integer(e.app_state().raw_value()),
            );
            record.insert(PAYLOAD_KEY.to_string(), encode_payload(e.payload()));
        }
        Event::Lifecycle(e) => {
            record.insert(
                TYPE_KEY.to_string(),
                PlistValue::String(LIFECYCLE_TAG.to_string()),
            );
            record.insert(
                DESCRIPTION_KEY.to_string(),
                PlistValue::String(e.description().to_string()),
            );
        }
    }

    PlistValue::Dictionary(record)
}

/// Decode a record produced by [`encode`].
pub fn decode(value: &PlistValue) -> Result<Option<Event>, CodecError> {
    let Some(record) = value.as_dictionary() else {
        return Ok(None);
    };
    let Some(tag) = record.get(TYPE_KEY).and_then(PlistValue::as_str) else {
        return Ok(None);
    };
    if tag != SENSOR_TAG && tag != LIFECYCLE_TAG {
        return Err(CodecError::UnknownEventType(tag.to_string()));
    }

    let Some(version) = record.get(VERSION_KEY).and_then(PlistValue::as_integer) else {
        return Ok(None);
    };
    if version != SCHEMA_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let Some(received_at) = record.get(RECEIVED_AT_KEY).and_then(PlistValue::as_date) else {
        return Ok(None);
    };

    if tag == LIFECYCLE_TAG {
        let Some(description) = record.get(DESCRIPTION_KEY).and_then(PlistValue::as_str) else {
            return Ok(None);
        };
        return Ok(Some(Event::Lifecycle(LifecycleEvent::at(
            received_at,
            description,
        ))));
    }

    let sample_type = record.get(SAMPLE_TYPE_KEY).and_then(PlistValue::as_str);
    let app_state = record
        .get(APP_STATE_KEY)
        .and_then(PlistValue::as_integer)
        .and_then(AppState::from_raw_value);
    let payload = record.get(PAYLOAD_KEY).and_then(decode_payload);

    let (Some(sample_type), Some(app_state), Some(payload)) = (sample_type, app_state, payload)
    else {
        return Ok(None);
    };

    // Constructor validation failures (empty type, NaN) mean the record is unusable.
    Ok(SensorEvent::at(sample_type, received_at, app_state, payload)
        .ok()
        .map(Event::Sensor))
}

fn encode_payload(payload: &Payload) -> PlistValue {
    let record = payload
        .iter()
        .map(|(key, value)| {
            let encoded = match value {
                PayloadValue::Text(s) => PlistValue::String(s.clone()),
                PayloadValue::Number(n) => PlistValue::Real(*n),
                PayloadValue::Timestamp(t) => PlistValue::Date(*t),
                PayloadValue::Flag(b) => PlistValue::Boolean(*b),
            };
            (key.clone(), encoded)
        })
        .collect();
    PlistValue::Dictionary(record)
}

fn decode_payload(value: &PlistValue) -> Option<Payload> {
    value
        .as_dictionary()?
        .iter()
        .map(|(key, value)| {
            let decoded = match value {
                PlistValue::String(s) => PayloadValue::Text(s.clone()),
                PlistValue::Real(r) => PayloadValue::Number(*r),
                PlistValue::Integer(i) => PayloadValue::Number(*i as f64),
                PlistValue::Date(d) => PayloadValue::Timestamp(*d),
                PlistValue::Boolean(b) => PayloadValue::Flag(*b),
                PlistValue::Array(_) | PlistValue::Dictionary(_) => return None,
            };
            Some((key.clone(), decoded))
        })
        .collect()
}
