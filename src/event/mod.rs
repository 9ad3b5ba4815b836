//! Event types recorded by the agent.

pub mod types;

pub use types::{
    payload_from_json, AppState, Event, EventError, LifecycleEvent, Payload, PayloadValue,
    SensorEvent, VALUE_KEY,
};
